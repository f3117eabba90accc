//! Display modes and output properties

use std::time::Duration;

use crate::backend::allocator::PixelFormat;

/// Refresh rate assumed when the hardware doesn't report one
pub const DEFAULT_REFRESH_RATE: u32 = 60;

/// Config group of configs synthesized from a UI resolution override
pub const RESERVED_DISPLAY_GROUP_ID: i32 = 100;

/// Dots per 1000 inches assumed when the physical size is unknown
pub const DEFAULT_DPI: u32 = 160_000;

const FLOAT_TOLERANCE: f32 = 0.01;

/// Kind of output a display drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayType {
    /// Unknown output
    #[default]
    Invalid,
    /// LVDS or other built-in panel
    Ldb,
    /// HDMI or TV output
    Hdmi,
    /// DVI output
    Dvi,
    /// HDMI bridge soldered on the board
    HdmiOnBoard,
    /// Memory-backed output without hardware
    Virtual,
}

impl DisplayType {
    /// Whether the output may be unplugged
    pub fn is_external(self) -> bool {
        matches!(self, DisplayType::Hdmi | DisplayType::Dvi)
    }
}

/// Logical power state of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerMode {
    /// Scanning out
    #[default]
    On,
    /// Low power, still showing content
    Doze,
    /// Low power, content frozen
    DozeSuspend,
    /// Blanked
    Off,
}

/// One supported mode of a display
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    /// Horizontal resolution in pixels
    pub width: u32,
    /// Vertical resolution in pixels
    pub height: u32,
    /// Scan-out format
    pub format: PixelFormat,
    /// Size of one pixel in bytes
    pub bytes_per_pixel: u32,
    /// Line length in bytes
    pub stride: u32,
    /// Refresh rate in Hz
    pub fps: f32,
    /// Length of one frame in nanoseconds
    pub vsync_period: i64,
    /// Horizontal density in dots per 1000 inches
    pub xdpi: u32,
    /// Vertical density in dots per 1000 inches
    pub ydpi: u32,
    /// Configs of one group differ only in refresh rate
    pub group_id: i32,
    /// Hardware mode backing this config, if any
    pub mode_index: Option<usize>,
}

impl DisplayConfig {
    /// A config at the default refresh rate
    pub fn new(width: u32, height: u32, format: PixelFormat) -> DisplayConfig {
        let bytes_per_pixel = format.bytes_per_pixel();
        DisplayConfig {
            width,
            height,
            format,
            bytes_per_pixel,
            stride: width * bytes_per_pixel,
            fps: DEFAULT_REFRESH_RATE as f32,
            vsync_period: period_from_fps(DEFAULT_REFRESH_RATE as f32),
            xdpi: DEFAULT_DPI,
            ydpi: DEFAULT_DPI,
            group_id: 0,
            mode_index: None,
        }
    }

    /// Set the refresh rate, a rate of 0 selects [`DEFAULT_REFRESH_RATE`]
    pub fn with_refresh(mut self, fps: f32) -> DisplayConfig {
        self.fps = if fps > 0.0 { fps } else { DEFAULT_REFRESH_RATE as f32 };
        self.vsync_period = period_from_fps(self.fps);
        self
    }

    /// Set the physical density
    pub fn with_dpi(mut self, xdpi: u32, ydpi: u32) -> DisplayConfig {
        self.xdpi = xdpi;
        self.ydpi = ydpi;
        self
    }

    /// Set the config group
    pub fn with_group(mut self, group_id: i32) -> DisplayConfig {
        self.group_id = group_id;
        self
    }

    /// Whether this config describes the given resolution and format
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }

    /// Whether the refresh rate equals `fps` within float tolerance
    pub fn refresh_matches(&self, fps: f32) -> bool {
        (self.fps - fps).abs() < FLOAT_TOLERANCE
    }

    /// Frame length
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.vsync_period.max(0) as u64)
    }
}

/// Frame length in nanoseconds of a refresh rate
pub fn period_from_fps(fps: f32) -> i64 {
    if fps <= 0.0 {
        return period_from_fps(DEFAULT_REFRESH_RATE as f32);
    }
    (1e9 / fps as f64) as i64
}

/// Physical density in dots per 1000 inches, [`DEFAULT_DPI`] if the size is unknown
pub fn dpi_from_size(pixels: u32, millimeters: u32) -> u32 {
    if millimeters == 0 {
        return DEFAULT_DPI;
    }
    (pixels as u64 * 25_400 / millimeters as u64) as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn periods() {
        assert_eq!(period_from_fps(60.0), 16_666_666);
        assert_eq!(period_from_fps(0.0), 16_666_666);
        let config = DisplayConfig::new(1920, 1080, PixelFormat::Rgba8888).with_refresh(30.0);
        assert_eq!(config.vsync_period, 33_333_333);
        assert_eq!(config.stride, 1920 * 4);
        assert!(config.refresh_matches(30.004));
        assert!(!config.refresh_matches(29.97));
    }

    #[test]
    fn density() {
        assert_eq!(dpi_from_size(1920, 0), DEFAULT_DPI);
        // 1920 px over 508 mm is 96 dpi
        assert_eq!(dpi_from_size(1920, 508), 96_000);
    }
}
