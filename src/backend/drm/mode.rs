//! Mode selection
//!
//! The requested mode comes from the boot configuration as a keyword (`1080p`, `2k`,
//! `4k`, `preferred`) or an explicit `WxH`, `WxH@R` or `WxHpR`. Every mode of the
//! connector is scored by its distance to the requested size, ties go to a mode with
//! the requested refresh rate and then to the mode the sink prefers.

use std::{cmp::Reverse, fmt, str::FromStr};

use tracing::{debug, info};

use super::device::ModeInfo;
use crate::{
    backend::allocator::PixelFormat,
    display::config::{dpi_from_size, DisplayConfig, DEFAULT_REFRESH_RATE, RESERVED_DISPLAY_GROUP_ID},
};

/// Refresh rate below which modes are only used as a last resort
const MIN_REFRESH_RATE: u32 = 60;

/// Mode asked for by the boot configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeRequest {
    /// Horizontal resolution, `None` matches any
    pub width: Option<u32>,
    /// Vertical resolution, `None` matches any
    pub height: Option<u32>,
    /// Refresh rate in Hz
    pub refresh: Option<u32>,
    /// Take the mode the sink prefers
    pub preferred: bool,
}

impl ModeRequest {
    /// Request a resolution
    pub fn size(width: u32, height: u32) -> ModeRequest {
        ModeRequest {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    /// Request a refresh rate as well
    pub fn at(mut self, refresh: u32) -> ModeRequest {
        self.refresh = Some(refresh);
        self
    }
}

/// Error parsing a [`ModeRequest`] or a [`GuiResolution`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid display mode `{0}`")]
pub struct ParseModeError(pub String);

impl FromStr for ModeRequest {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<ModeRequest, ParseModeError> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "preferred" => {
                return Ok(ModeRequest {
                    preferred: true,
                    ..Default::default()
                })
            }
            "1080p" => return Ok(ModeRequest::size(1920, 1080)),
            "2k" => return Ok(ModeRequest::size(2048, 1080)),
            "4k" => return Ok(ModeRequest::size(4096, 2160)),
            _ => {}
        }

        if let Ok((width, height, refresh)) = scan_fmt::scan_fmt!(s, "{d}x{d}@{d}", u32, u32, u32) {
            return Ok(ModeRequest::size(width, height).at(refresh));
        }
        if let Ok((width, height, refresh)) = scan_fmt::scan_fmt!(s, "{d}x{d}p{d}", u32, u32, u32) {
            return Ok(ModeRequest::size(width, height).at(refresh));
        }
        if let Ok((width, height)) = scan_fmt::scan_fmt!(s, "{d}x{d}", u32, u32) {
            return Ok(ModeRequest::size(width, height));
        }
        // `720p` and friends only name the height
        if let Some(height) = s.strip_suffix('p').and_then(|h| h.parse::<u32>().ok()) {
            return Ok(ModeRequest {
                height: Some(height),
                ..Default::default()
            });
        }
        Err(ParseModeError(s.to_owned()))
    }
}

impl fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.preferred {
            return write!(f, "preferred");
        }
        match (self.width, self.height) {
            (Some(w), Some(h)) => write!(f, "{w}x{h}")?,
            (None, Some(h)) => write!(f, "{h}p")?,
            (Some(w), None) => write!(f, "{w}x*")?,
            (None, None) => write!(f, "*")?,
        }
        if let Some(refresh) = self.refresh {
            write!(f, "@{refresh}")?;
        }
        Ok(())
    }
}

/// UI resolution override, the render target size when smaller than the mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuiResolution {
    /// Render target width
    pub width: u32,
    /// Render target height
    pub height: u32,
    /// Scale on the display controller (`shw`) instead of in software (`ssw`)
    pub hardware_scaling: bool,
}

impl FromStr for GuiResolution {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<GuiResolution, ParseModeError> {
        let s = s.trim();
        let (spec, hardware_scaling) = if let Some(rest) = s.strip_prefix("shw") {
            (rest, true)
        } else if let Some(rest) = s.strip_prefix("ssw") {
            (rest, false)
        } else {
            (s, true)
        };
        let (width, height) =
            scan_fmt::scan_fmt!(spec, "{d}x{d}", u32, u32).map_err(|_| ParseModeError(s.to_owned()))?;
        if width == 0 || height == 0 {
            return Err(ParseModeError(s.to_owned()));
        }
        Ok(GuiResolution {
            width,
            height,
            hardware_scaling,
        })
    }
}

fn distance(mode: &ModeInfo, width: Option<u32>, height: Option<u32>) -> u32 {
    let dx = width.map_or(0, |w| w.abs_diff(mode.hdisplay as u32));
    let dy = height.map_or(0, |h| h.abs_diff(mode.vdisplay as u32));
    dx + dy
}

/// Index of the best mode for `request`
///
/// Without a request the mode closest to the preferred one is taken. `None` if the
/// connector has no mode.
pub fn select_mode(modes: &[ModeInfo], request: Option<&ModeRequest>) -> Option<usize> {
    if modes.is_empty() {
        return None;
    }
    let fast_enough = modes.iter().any(|m| m.vrefresh >= MIN_REFRESH_RATE);
    let candidates = || {
        modes
            .iter()
            .enumerate()
            .filter(move |(_, m)| !fast_enough || m.vrefresh >= MIN_REFRESH_RATE)
    };

    let preferred = candidates().find(|(_, m)| m.is_preferred());
    let request = match request {
        Some(request) if !request.preferred => *request,
        _ => {
            if let Some((index, mode)) = preferred {
                debug!(?mode, "using preferred mode");
                return Some(index);
            }
            // no preferred mode, fall back to full HD
            ModeRequest::size(1920, 1080)
        }
    };

    let refresh = request.refresh.unwrap_or(DEFAULT_REFRESH_RATE);
    let (index, mode) = candidates().min_by_key(|(index, mode)| {
        (
            distance(mode, request.width, request.height),
            mode.vrefresh != refresh,
            !mode.is_preferred(),
            Reverse(mode.vrefresh),
            *index,
        )
    })?;
    info!(%request, ?mode, "selected mode");
    Some(index)
}

/// Configs of a connector
///
/// One config per distinct `(width, height, refresh)` mode, configs of one resolution
/// share a group. Returns the configs and the index of the config of `selected`.
/// A [`GuiResolution`] adds a UI config in [`RESERVED_DISPLAY_GROUP_ID`] backed by the
/// selected mode, which becomes the active one.
pub fn configs_from_modes(
    modes: &[ModeInfo],
    selected: usize,
    mm_size: (u32, u32),
    format: PixelFormat,
    gui: Option<GuiResolution>,
) -> (Vec<DisplayConfig>, Option<usize>) {
    let fast_enough = modes.iter().any(|m| m.vrefresh >= MIN_REFRESH_RATE);
    let mut configs: Vec<DisplayConfig> = Vec::new();
    let mut groups: Vec<(u16, u16)> = Vec::new();
    let mut active = None;

    for (index, mode) in modes.iter().enumerate() {
        if fast_enough && mode.vrefresh < MIN_REFRESH_RATE && index != selected {
            continue;
        }
        let fps = mode.refresh_rate();
        let existing = configs.iter().position(|c| {
            c.width == mode.hdisplay as u32 && c.height == mode.vdisplay as u32 && c.refresh_matches(fps)
        });
        if let Some(existing) = existing {
            if index == selected {
                configs[existing].mode_index = Some(index);
                active = Some(existing);
            }
            continue;
        }

        let size = (mode.hdisplay, mode.vdisplay);
        let group = match groups.iter().position(|&g| g == size) {
            Some(group) => group,
            None => {
                groups.push(size);
                groups.len() - 1
            }
        };
        let mut config = DisplayConfig::new(mode.hdisplay as u32, mode.vdisplay as u32, format)
            .with_refresh(fps)
            .with_dpi(
                dpi_from_size(mode.hdisplay as u32, mm_size.0),
                dpi_from_size(mode.vdisplay as u32, mm_size.1),
            )
            .with_group(group as i32);
        config.mode_index = Some(index);
        if index == selected {
            active = Some(configs.len());
        }
        configs.push(config);
    }

    if let (Some(gui), Some(mode)) = (gui, modes.get(selected)) {
        let (width, height) = (gui.width.min(mode.hdisplay as u32), gui.height.min(mode.vdisplay as u32));
        info!(width, height, hardware = gui.hardware_scaling, "UI resolution override");
        let mut config = DisplayConfig::new(width, height, format)
            .with_refresh(mode.refresh_rate())
            .with_dpi(
                dpi_from_size(width, mm_size.0),
                dpi_from_size(height, mm_size.1),
            )
            .with_group(RESERVED_DISPLAY_GROUP_ID);
        config.mode_index = Some(selected);
        active = Some(configs.len());
        configs.push(config);
    }

    (configs, active)
}

#[cfg(test)]
mod test {
    use super::*;

    fn modes() -> Vec<ModeInfo> {
        vec![
            ModeInfo::new(3840, 2160, 30),
            ModeInfo::new(1920, 1080, 60).preferred(),
            ModeInfo::new(1920, 1080, 50),
            ModeInfo::new(1280, 720, 60),
            ModeInfo::new(1920, 1080, 75),
            ModeInfo::new(720, 480, 60),
        ]
    }

    #[test]
    fn keywords() {
        assert_eq!("1080p".parse(), Ok(ModeRequest::size(1920, 1080)));
        assert_eq!("2k".parse(), Ok(ModeRequest::size(2048, 1080)));
        assert_eq!("4K".parse(), Ok(ModeRequest::size(4096, 2160)));
        assert_eq!("1280x720@50".parse(), Ok(ModeRequest::size(1280, 720).at(50)));
        assert_eq!("1280x720p50".parse(), Ok(ModeRequest::size(1280, 720).at(50)));
        assert_eq!("800x600".parse(), Ok(ModeRequest::size(800, 600)));
        assert_eq!(
            "720p".parse(),
            Ok(ModeRequest {
                height: Some(720),
                ..Default::default()
            })
        );
        assert!("preferred".parse::<ModeRequest>().unwrap().preferred);
        assert!("hello".parse::<ModeRequest>().is_err());
    }

    #[test]
    fn gui_resolution() {
        assert_eq!(
            "shw1280x720".parse(),
            Ok(GuiResolution {
                width: 1280,
                height: 720,
                hardware_scaling: true
            })
        );
        assert!(!"ssw1280x720".parse::<GuiResolution>().unwrap().hardware_scaling);
        assert!("1280x720".parse::<GuiResolution>().unwrap().hardware_scaling);
        assert!("shw0x720".parse::<GuiResolution>().is_err());
    }

    #[test]
    fn scoring() {
        let modes = modes();
        // exact size, default refresh
        assert_eq!(select_mode(&modes, Some(&ModeRequest::size(1920, 1080))), Some(1));
        // exact refresh wins the tie
        assert_eq!(select_mode(&modes, Some(&ModeRequest::size(1920, 1080).at(75))), Some(4));
        // closest size
        assert_eq!(select_mode(&modes, Some(&ModeRequest::size(1366, 768))), Some(3));
        // modes below 60 Hz are skipped while others exist
        assert_eq!(select_mode(&modes, Some(&ModeRequest::size(3840, 2160))), Some(1));
        assert_eq!(select_mode(&modes, Some(&"2160p".parse().unwrap())), Some(1));
        assert_eq!(select_mode(&modes, Some(&ModeRequest::size(1920, 1080).at(50))), Some(1));
    }

    #[test]
    fn preferred_mode() {
        let modes = modes();
        let preferred = ModeRequest {
            preferred: true,
            ..Default::default()
        };
        assert_eq!(select_mode(&modes, Some(&preferred)), Some(1));
        assert_eq!(select_mode(&modes, None), Some(1));
        assert_eq!(select_mode(&[], None), None);

        let slow = vec![ModeInfo::new(1920, 1080, 30), ModeInfo::new(1280, 720, 24)];
        assert_eq!(select_mode(&slow, None), Some(0));
        assert_eq!(select_mode(&slow, Some(&ModeRequest::size(1280, 720))), Some(1));
    }

    #[test]
    fn configs_share_groups_per_resolution() {
        let modes = modes();
        let (configs, active) = configs_from_modes(&modes, 1, (520, 290), PixelFormat::Rgba8888, None);
        let sizes: Vec<_> = configs.iter().map(|c| (c.width, c.fps as u32, c.group_id)).collect();
        assert_eq!(sizes, vec![(1920, 60, 0), (1280, 60, 1), (1920, 75, 0), (720, 60, 2)]);
        assert_eq!(active, Some(0));
        assert_eq!(configs[0].mode_index, Some(1));
        assert_eq!(configs[0].xdpi, 1920 * 25_400 / 520);
    }

    #[test]
    fn gui_override_config() {
        let modes = modes();
        let gui = "shw1280x720".parse().ok();
        let (configs, active) = configs_from_modes(&modes, 1, (0, 0), PixelFormat::Rgba8888, gui);
        let active = &configs[active.unwrap()];
        assert_eq!((active.width, active.height), (1280, 720));
        assert_eq!(active.group_id, RESERVED_DISPLAY_GROUP_ID);
        assert_eq!(active.mode_index, Some(1));
    }
}
