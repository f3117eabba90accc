//! Legacy framebuffer display backend
//!
//! An [`FbBackend`] presents through a `/dev/fbN` device. The device is switched to
//! RGBA8888 with a virtual height of three screens when opened. Frames are scanned out by
//! physical address through the vendor `MXCFB_UPDATE_SCREEN` request, drivers without it
//! are panned to the buffer offset inside the framebuffer memory instead.
//!
//! Output type and cable state come from the sysfs attributes of the device, vsync from
//! its `vsync` attribute.

use std::{
    fmt, io,
    os::unix::io::AsFd,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, error, info, info_span, instrument, warn};

use crate::{
    backend::{
        allocator::{Allocator, MemoryDesc, MemoryFlags, MemoryHandle, PixelFormat, Usage},
        sync,
        vsync::{VsyncSource, VsyncThread},
    },
    display::{self, DisplayBackend, DisplayConfig, DisplayType, EventSink, Frame, Limitations, PowerMode},
    utils::{read_sysfs, DevPath, DeviceFd},
};

pub mod ffi;

use self::ffi::{FbBitfield, FbFixScreeninfo, FbVarScreeninfo, MxcfbBuffer};

/// Render targets cycled through by device composition
pub const MAX_FRAMEBUFFERS: usize = 3;

/// Screens stacked in the virtual framebuffer
pub const NUM_FRAMEBUFFER_SCREENS: u32 = 3;

/// Where the framebuffer devices are listed in sysfs
pub const GRAPHICS_SYSFS_ROOT: &str = "/sys/class/graphics";

/// Refresh rate in mHz assumed when the driver reports no timing
const FALLBACK_REFRESH_MILLIHERTZ: u64 = 60_000;

/// Errors of the framebuffer backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device ioctl failed
    #[error("{errmsg} on framebuffer `{dev:?}` ({source})")]
    Access {
        /// What was attempted
        errmsg: &'static str,
        /// Device node
        dev: Option<PathBuf>,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
    /// The render target doesn't fit the active config
    #[error("Buffer {0} doesn't match the framebuffer config")]
    TargetMismatch(u64),
    /// The driver switched to another resolution than requested
    #[error("Framebuffer rejected config {0}")]
    ConfigRejected(usize),
}

/// The ioctls the framebuffer backend issues
pub trait FbDevice: fmt::Debug + Send {
    /// Path of the device node
    fn path(&self) -> Option<PathBuf>;

    /// `FBIOGET_VSCREENINFO`
    fn var_info(&self) -> io::Result<FbVarScreeninfo>;

    /// `FBIOPUT_VSCREENINFO`
    fn set_var_info(&self, info: &FbVarScreeninfo) -> io::Result<()>;

    /// `FBIOGET_FSCREENINFO`
    fn fix_info(&self) -> io::Result<FbFixScreeninfo>;

    /// `FBIOPAN_DISPLAY`
    fn pan(&self, info: &FbVarScreeninfo) -> io::Result<()>;

    /// `MXCFB_UPDATE_SCREEN`
    fn update_screen(&self, buffer: &MxcfbBuffer) -> io::Result<()>;

    /// `FBIOBLANK`
    fn blank(&self, level: u32) -> io::Result<()>;
}

/// An open framebuffer device node
#[derive(Debug, Clone)]
pub struct FbDeviceFd(DeviceFd);

impl FbDeviceFd {
    /// Open `/dev/graphics/fb{index}`, or `/dev/fb{index}` if that doesn't exist
    pub fn open(index: u32) -> io::Result<FbDeviceFd> {
        let android = PathBuf::from(format!("/dev/graphics/fb{index}"));
        let path = if android.exists() {
            android
        } else {
            PathBuf::from(format!("/dev/fb{index}"))
        };
        DeviceFd::open(path).map(FbDeviceFd)
    }
}

impl FbDevice for FbDeviceFd {
    fn path(&self) -> Option<PathBuf> {
        self.0.dev_path()
    }

    fn var_info(&self) -> io::Result<FbVarScreeninfo> {
        ffi::get_var(self.0.as_fd())
    }

    fn set_var_info(&self, info: &FbVarScreeninfo) -> io::Result<()> {
        ffi::put_var(self.0.as_fd(), info)
    }

    fn fix_info(&self) -> io::Result<FbFixScreeninfo> {
        ffi::get_fix(self.0.as_fd())
    }

    fn pan(&self, info: &FbVarScreeninfo) -> io::Result<()> {
        ffi::pan(self.0.as_fd(), info)
    }

    fn update_screen(&self, buffer: &MxcfbBuffer) -> io::Result<()> {
        ffi::update_screen(self.0.as_fd(), buffer)
    }

    fn blank(&self, level: u32) -> io::Result<()> {
        ffi::blank(self.0.as_fd(), level)
    }
}

/// Settings of an [`FbBackend`]
#[derive(Debug, Clone)]
pub struct FbOptions {
    /// sysfs directory holding the `fbN` attribute directories
    pub sysfs_root: PathBuf,
    /// Generate vsync with a timer instead of the kernel attribute
    pub fake_vsync: bool,
    /// Limitations of the display controller
    pub limitations: Limitations,
}

impl Default for FbOptions {
    fn default() -> Self {
        FbOptions {
            sysfs_root: PathBuf::from(GRAPHICS_SYSFS_ROOT),
            fake_vsync: false,
            limitations: Limitations::empty(),
        }
    }
}

/// Output kind reported by `fsl_disp_dev_property`
pub fn read_display_type(sysfs: &Path) -> DisplayType {
    match read_sysfs(sysfs.join("fsl_disp_dev_property")) {
        Ok(value) if value.contains("hdmi") => DisplayType::Hdmi,
        Ok(value) if value.contains("dvi") => DisplayType::Dvi,
        Ok(_) => DisplayType::Ldb,
        Err(err) => {
            debug!(path = %sysfs.display(), %err, "no display property, assuming panel");
            DisplayType::Ldb
        }
    }
}

/// Cable state of an external output, panels are always connected
pub fn read_connection(sysfs: &Path, kind: DisplayType) -> bool {
    if kind == DisplayType::Ldb {
        return true;
    }
    match read_sysfs(sysfs.join("disp_dev").join("cable_state")) {
        Ok(value) => value.contains("plugin"),
        Err(err) => {
            warn!(path = %sysfs.display(), %err, "unable to read cable state");
            false
        }
    }
}

/// Blank level of a power mode
pub fn blank_level(mode: PowerMode) -> u32 {
    match mode {
        PowerMode::On => ffi::FB_BLANK_UNBLANK,
        PowerMode::Doze => ffi::FB_BLANK_NORMAL,
        PowerMode::DozeSuspend => ffi::FB_BLANK_VSYNC_SUSPEND,
        PowerMode::Off => ffi::FB_BLANK_POWERDOWN,
    }
}

/// Config described by the screen info of the device
pub fn config_from_info(var: &FbVarScreeninfo, fix: &FbFixScreeninfo) -> DisplayConfig {
    let mut millihertz = var.refresh_millihertz();
    if millihertz == 0 {
        millihertz = FALLBACK_REFRESH_MILLIHERTZ;
    }
    let format = PixelFormat::from_fb_layout(var.bits_per_pixel, var.red.offset);
    let mut config = DisplayConfig::new(var.xres, var.yres, format)
        .with_refresh(millihertz as f32 / 1000.0)
        .with_dpi(
            display::config::dpi_from_size(var.xres, var.width),
            display::config::dpi_from_size(var.yres, var.height),
        );
    config.bytes_per_pixel = var.bits_per_pixel / 8;
    if fix.line_length != 0 {
        config.stride = fix.line_length;
    }
    config
}

/// A display driven through a legacy framebuffer device
#[derive(Debug)]
pub struct FbBackend {
    device: Box<dyn FbDevice>,
    index: u32,
    sysfs: PathBuf,
    kind: DisplayType,
    connected: bool,
    configs: Vec<DisplayConfig>,
    active: Option<usize>,
    smem_start: u64,
    allocator: Option<Arc<dyn Allocator>>,
    targets: Vec<MemoryHandle>,
    next_target: usize,
    limitations: Limitations,
    vsync: Option<VsyncThread>,
    span: tracing::Span,
}

impl FbBackend {
    /// Set up framebuffer `index` for scan-out
    ///
    /// Every framebuffer but the first is unblanked first, the boot loader leaves those
    /// powered down.
    pub fn open(
        device: Box<dyn FbDevice>,
        index: u32,
        sink: Arc<EventSink>,
        allocator: Option<Arc<dyn Allocator>>,
        options: &FbOptions,
    ) -> Result<FbBackend, Error> {
        let span = info_span!("fbdev", fb = index);
        let _guard = span.enter();

        if index != 0 {
            if let Err(err) = device.blank(ffi::FB_BLANK_UNBLANK) {
                warn!(%err, "failed to unblank framebuffer");
            }
        }
        set_default_format(&*device)?;

        let sysfs = options.sysfs_root.join(format!("fb{index}"));
        let kind = read_display_type(&sysfs);
        let connected = read_connection(&sysfs, kind);
        let source = if options.fake_vsync {
            VsyncSource::Software
        } else {
            VsyncSource::Kernel(sysfs.join("vsync"))
        };
        let vsync = VsyncThread::spawn(sink, source)
            .map_err(|err| warn!(%err, "failed to start vsync thread"))
            .ok();
        info!(?kind, connected, "framebuffer opened");

        drop(_guard);
        let mut backend = FbBackend {
            device,
            index,
            sysfs,
            kind,
            connected,
            configs: Vec::new(),
            active: None,
            smem_start: 0,
            allocator,
            targets: Vec::new(),
            next_target: 0,
            limitations: options.limitations,
            vsync,
            span,
        };
        backend.read_config()?;
        backend.prepare_targets();
        Ok(backend)
    }

    /// Index of the framebuffer device
    pub fn index(&self) -> u32 {
        self.index
    }

    fn access(&self, errmsg: &'static str) -> impl Fn(io::Error) -> Error + '_ {
        move |source| Error::Access {
            errmsg,
            dev: self.device.path(),
            source,
        }
    }

    /// Read the current mode, adding a config for it if it is new
    fn read_config(&mut self) -> Result<usize, Error> {
        let var = self
            .device
            .var_info()
            .map_err(self.access("FBIOGET_VSCREENINFO failed"))?;
        let fix = self
            .device
            .fix_info()
            .map_err(self.access("FBIOGET_FSCREENINFO failed"))?;
        let config = config_from_info(&var, &fix);
        debug!(
            parent: &self.span,
            width = config.width,
            height = config.height,
            fps = config.fps,
            bpp = var.bits_per_pixel,
            "framebuffer config"
        );

        let index = match self
            .configs
            .iter()
            .position(|c| c.width == config.width && c.height == config.height)
        {
            Some(index) => index,
            None => {
                self.configs.push(config.clone());
                self.configs.len() - 1
            }
        };
        for (i, item) in self.configs.iter_mut().enumerate() {
            if i == index {
                *item = config.clone();
            } else {
                item.xdpi = config.xdpi;
                item.ydpi = config.ydpi;
                item.vsync_period = config.vsync_period;
                item.format = config.format;
            }
        }
        self.smem_start = fix.smem_start as u64;
        self.active = Some(index);
        Ok(index)
    }

    fn active_config(&self) -> Option<&DisplayConfig> {
        self.active.and_then(|index| self.configs.get(index))
    }

    fn prepare_targets(&mut self) {
        self.targets.clear();
        self.next_target = 0;
        let (Some(allocator), Some(config)) = (self.allocator.as_ref(), self.active_config()) else {
            return;
        };
        let desc = MemoryDesc::new(config.width, config.height, config.format)
            .usage(Usage::HW_COMPOSER | Usage::HW_2D | Usage::HW_RENDER)
            .flags(MemoryFlags::FRAMEBUFFER);
        let stride = config.stride / config.bytes_per_pixel.max(1);
        let mut targets = Vec::with_capacity(MAX_FRAMEBUFFERS);
        for _ in 0..MAX_FRAMEBUFFERS {
            match allocator.allocate(&desc) {
                Ok(target) => {
                    if target.stride() != stride {
                        error!(
                            parent: &self.span,
                            stride = target.stride(),
                            expected = stride,
                            "render target stride mismatch"
                        );
                    }
                    targets.push(target);
                }
                Err(err) => {
                    warn!(parent: &self.span, %err, "failed to allocate render target");
                    return;
                }
            }
        }
        self.targets = targets;
    }
}

/// Switch the device to RGBA8888
fn set_default_format(device: &dyn FbDevice) -> Result<(), Error> {
    let access = |errmsg| {
        let dev = device.path();
        move |source| Error::Access { errmsg, dev, source }
    };
    let mut info = device.var_info().map_err(access("FBIOGET_VSCREENINFO failed"))?;
    info.bits_per_pixel = 32;
    info.red = FbBitfield::new(0, 8);
    info.green = FbBitfield::new(8, 8);
    info.blue = FbBitfield::new(16, 8);
    info.transp = FbBitfield::new(24, 8);
    info.yres_virtual = info.yres * NUM_FRAMEBUFFER_SCREENS;
    info.activate = ffi::FB_ACTIVATE_NOW;
    device
        .set_var_info(&info)
        .map_err(access("RGBA8888 not supported"))
}

impl DisplayBackend for FbBackend {
    fn display_type(&self) -> DisplayType {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn refresh_connection(&mut self) -> bool {
        self.connected = read_connection(&self.sysfs, self.kind);
        self.connected
    }

    fn read_configs(&mut self) -> (Vec<DisplayConfig>, Option<usize>) {
        (self.configs.clone(), self.active)
    }

    fn limitations(&self) -> Limitations {
        self.limitations
    }

    fn render_target(&mut self) -> Option<MemoryHandle> {
        if self.targets.is_empty() {
            return None;
        }
        let target = self.targets[self.next_target % self.targets.len()].clone();
        self.next_target = (self.next_target + 1) % self.targets.len();
        Some(target)
    }

    #[profiling::function]
    #[instrument(level = "trace", parent = &self.span, skip_all)]
    fn update_screen(&mut self, frame: Frame<'_>) -> Result<(), display::Error> {
        let target = frame.target;
        let Some(config) = self.active_config() else {
            error!("no active config");
            return Err(display::Error::NoRenderTarget);
        };
        if !target.flags().contains(MemoryFlags::FRAMEBUFFER)
            || !config.matches(target.width(), target.height(), target.format())
        {
            error!(
                buffer = target.id(),
                width = target.width(),
                height = target.height(),
                format = ?target.format(),
                "render target doesn't fit the framebuffer"
            );
            return Err(Error::TargetMismatch(target.id()).into());
        }
        let stride = config.stride;
        sync::wait_optional(frame.target_fence.as_ref());

        let buffer = MxcfbBuffer {
            xoffset: 0,
            yoffset: 0,
            stride,
            phys: target.phys(),
        };
        let Err(err) = self.device.update_screen(&buffer) else {
            return Ok(());
        };
        debug!(%err, "MXCFB_UPDATE_SCREEN failed, panning");

        let mut var = self
            .device
            .var_info()
            .map_err(self.access("FBIOGET_VSCREENINFO failed"))?;
        let offset = target.phys().checked_sub(self.smem_start).filter(|_| stride != 0);
        let Some(offset) = offset else {
            warn!(buffer = target.id(), "render target outside framebuffer memory");
            return Ok(());
        };
        var.xoffset = 0;
        var.yoffset = (offset / stride as u64) as u32;
        var.activate = ffi::FB_ACTIVATE_NOW;
        if let Err(err) = self.device.pan(&var) {
            warn!(%err, yoffset = var.yoffset, "FBIOPAN_DISPLAY failed");
        }
        Ok(())
    }

    fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), display::Error> {
        // blanking HDMI drops the link clock and with it audio
        if self.kind == DisplayType::Hdmi {
            debug!(parent: &self.span, ?mode, "HDMI stays unblanked");
            return Ok(());
        }
        self.device
            .blank(blank_level(mode))
            .map_err(self.access("FBIOBLANK failed"))?;
        debug!(parent: &self.span, ?mode, "power mode");
        Ok(())
    }

    fn set_vsync_enabled(&mut self, enabled: bool) {
        if let Some(vsync) = self.vsync.as_ref() {
            vsync.set_enabled(enabled);
        }
    }

    fn apply_config(&mut self, config: &DisplayConfig) -> Result<(), display::Error> {
        let Some(index) = self.configs.iter().position(|c| c == config) else {
            return Err(display::Error::BadConfig(self.configs.len()));
        };
        if self.active == Some(index) {
            return Ok(());
        }
        let mut var = self
            .device
            .var_info()
            .map_err(self.access("FBIOGET_VSCREENINFO failed"))?;
        var.xres = config.width;
        var.yres = config.height;
        var.xres_virtual = config.width;
        var.yres_virtual = config.height * NUM_FRAMEBUFFER_SCREENS;
        var.activate = ffi::FB_ACTIVATE_NOW;
        self.device
            .set_var_info(&var)
            .map_err(self.access("FBIOPUT_VSCREENINFO failed"))?;

        if self.read_config()? != index {
            error!(parent: &self.span, config = index, "framebuffer kept its resolution");
            return Err(Error::ConfigRejected(index).into());
        }
        self.prepare_targets();
        Ok(())
    }
}
