use std::{
    os::unix::io::AsRawFd,
    path::PathBuf,
    sync::{Arc, Weak},
};

use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::{
    atomic::{commit_with_retry, to_fixed, AtomicRequest, CommitFlags},
    backlight::{Backlight, BACKLIGHT_ROOT},
    config_thread::ConfigThread,
    device::{ConnectorInfo, ConnectorInterface, FramebufferDesc, KmsDevice, ModeInfo},
    error::{AccessError, Error},
    hdr::{HdrOutputMetadata, HdrState},
    mode::{configs_from_modes, select_mode, GuiResolution, ModeRequest},
    props::{plane_type, ConnectorProps, CrtcProps, PlaneProps, PlaneType},
};
use crate::{
    backend::{
        allocator::{
            Allocator, FramebufferRelease, KmsFramebuffer, Memory, MemoryDesc, MemoryFlags, MemoryHandle,
            Modifier, PixelFormat, Usage,
        },
        sync::Fence,
        vsync::{VsyncSource, VsyncThread},
    },
    display::{
        self, DisplayBackend, DisplayConfig, DisplayType, EventSink, Frame, Layer, Limitations, PowerMode,
        Transform, VsyncPeriodTimeline,
    },
    utils::{align_up, Rectangle, Size},
};

/// Render targets cycled through by device composition
pub const MAX_FRAMEBUFFERS: usize = 3;

/// Upscaling factor beyond which the overlay plane can't scale
const MAX_OVERLAY_UPSCALE: i32 = 7;

/// `Content Protection` property values
const CONTENT_PROTECTION_UNDESIRED: u64 = 0;
const CONTENT_PROTECTION_DESIRED: u64 = 1;

/// Settings of a [`KmsBackend`]
#[derive(Debug, Clone)]
pub struct KmsOptions {
    /// Requested mode, `None` picks the preferred one
    pub mode: Option<ModeRequest>,
    /// UI resolution override
    pub gui: Option<GuiResolution>,
    /// Format of the render targets
    pub format: PixelFormat,
    /// Generate vsync with a timer instead of vblank events
    pub fake_vsync: bool,
    /// Where to look for a backlight of built-in panels
    pub backlight_root: PathBuf,
    /// Limitations of the display pipeline
    pub limitations: Limitations,
}

impl Default for KmsOptions {
    fn default() -> Self {
        KmsOptions {
            mode: None,
            gui: None,
            format: PixelFormat::Rgba8888,
            fake_vsync: false,
            backlight_root: PathBuf::from(BACKLIGHT_ROOT),
            limitations: Limitations::empty(),
        }
    }
}

/// Removes framebuffers once their [`Memory`] is gone
#[derive(Debug)]
struct FramebufferReleaser(Arc<dyn KmsDevice>);

impl FramebufferRelease for FramebufferReleaser {
    fn release_framebuffer(&self, fb_id: u32, gem_handle: u32) {
        if let Err(err) = self.0.remove_framebuffer(fb_id) {
            warn!(fb = fb_id, %err, "failed to remove framebuffer");
        }
        if gem_handle != 0 {
            if let Err(err) = self.0.close_buffer(gem_handle) {
                warn!(handle = gem_handle, %err, "failed to close gem handle");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Plane {
    id: u32,
    props: PlaneProps,
}

/// Connectors of `device` that can be driven right now
pub fn usable_connectors(device: &dyn KmsDevice) -> Result<Vec<u32>, Error> {
    let access = |errmsg| {
        let dev = device.path();
        move |source| Error::Access(AccessError { errmsg, dev, source })
    };
    let mut usable = Vec::new();
    for id in device.connectors().map_err(access("Error loading resources"))? {
        let info = device.connector(id).map_err(access("Error loading connector info"))?;
        if info.is_usable() {
            usable.push(id);
        }
    }
    Ok(usable)
}

/// Kind of output of a connector interface
pub fn display_type(interface: ConnectorInterface) -> DisplayType {
    match interface {
        ConnectorInterface::Lvds => DisplayType::Ldb,
        ConnectorInterface::HdmiA | ConnectorInterface::HdmiB | ConnectorInterface::Tv => DisplayType::Hdmi,
        ConnectorInterface::Dvi => DisplayType::Dvi,
        _ => DisplayType::Ldb,
    }
}

/// A display driven through the DRM atomic API
///
/// Drives one connector through one CRTC and its primary plane. The first overlay
/// plane of the CRTC, if any, scans out the overlay layer chosen by
/// [`Display::verify_layers`](crate::display::Display::verify_layers).
#[derive(Debug)]
pub struct KmsBackend {
    device: Arc<dyn KmsDevice>,
    connector: ConnectorInfo,
    crtc: u32,
    pipe: u32,
    primary: Plane,
    overlay: Option<Plane>,
    crtc_props: CrtcProps,
    connector_props: ConnectorProps,

    mode: ModeInfo,
    request: Option<ModeRequest>,
    configs: Vec<DisplayConfig>,
    active: Option<usize>,
    modeset_pending: bool,
    power: PowerMode,

    overlay_request: AtomicRequest,
    overlay_shown: bool,
    hdr: HdrState,
    hdr_request: Option<HdrOutputMetadata>,
    content_protection: Option<bool>,
    present_fence: Option<Fence>,

    format: PixelFormat,
    gui: Option<GuiResolution>,
    limitations: Limitations,
    allocator: Option<Arc<dyn Allocator>>,
    targets: Vec<MemoryHandle>,
    next_target: usize,
    releaser: Arc<FramebufferReleaser>,

    backlight: Option<Backlight>,
    vsync: Option<VsyncThread>,
    config_thread: Option<ConfigThread>,
    span: tracing::Span,
}

impl KmsBackend {
    /// Open `connector` of `device`
    ///
    /// Picks the CRTC and the planes driving the connector, resolves their properties,
    /// selects the mode and starts the vsync and config threads. The mode is set with
    /// the first frame.
    pub fn open(
        device: Arc<dyn KmsDevice>,
        connector: u32,
        sink: Arc<EventSink>,
        allocator: Option<Arc<dyn Allocator>>,
        options: &KmsOptions,
    ) -> Result<KmsBackend, Error> {
        let span = info_span!("drm_kms", device = ?device.path(), connector);
        let _guard = span.enter();
        let dev_path = device.path();
        let access = |errmsg| {
            let dev = dev_path.clone();
            move |source| Error::Access(AccessError { errmsg, dev, source })
        };

        device
            .enable_atomic()
            .map_err(access("Error enabling atomic mode setting"))?;
        let info = device
            .connector(connector)
            .map_err(access("Error loading connector info"))?;
        let encoder = *info.encoders.first().ok_or(Error::NoCrtc(connector))?;
        let possible = device
            .encoder_possible_crtcs(encoder)
            .map_err(access("Error loading encoder info"))?;
        let crtcs = device.crtcs().map_err(access("Error loading resources"))?;
        let (pipe, crtc) = crtcs
            .iter()
            .enumerate()
            .find(|(index, _)| possible & (1 << index) != 0)
            .map(|(index, &crtc)| (index as u32, crtc))
            .ok_or(Error::NoCrtc(connector))?;

        let mut primary = None;
        let mut overlays = Vec::new();
        for plane in device.planes().map_err(access("Error loading planes"))? {
            if plane.possible_crtcs & (1 << pipe) == 0 {
                continue;
            }
            match plane_type(&*device, plane.id)? {
                Some(PlaneType::Primary) if primary.is_none() => primary = Some(plane.id),
                Some(PlaneType::Overlay) => overlays.push(plane.id),
                _ => {}
            }
        }
        let primary = primary.ok_or(Error::NoPrimaryPlane(crtc))?;
        let primary = Plane {
            id: primary,
            props: PlaneProps::discover(&*device, primary)?,
        };
        let overlay = match overlays.first() {
            Some(&id) => Some(Plane {
                id,
                props: PlaneProps::discover(&*device, id)?,
            }),
            None => None,
        };
        let crtc_props = CrtcProps::discover(&*device, crtc)?;
        let connector_props = ConnectorProps::discover(&*device, connector)?;
        info!(
            crtc,
            pipe,
            primary = primary.id,
            overlay = ?overlay.map(|p| p.id),
            "pipeline selected"
        );

        let vsync_source = if options.fake_vsync {
            VsyncSource::Software
        } else {
            VsyncSource::Drm {
                device: device.clone(),
                pipe,
            }
        };
        let vsync = VsyncThread::spawn(sink.clone(), vsync_source)
            .map_err(|err| warn!(%err, "failed to start vsync thread"))
            .ok();
        let config_thread = ConfigThread::spawn(sink)
            .map_err(|err| warn!(%err, "failed to start config thread"))
            .ok();
        let backlight = match display_type(info.interface) {
            DisplayType::Ldb => Backlight::discover(&options.backlight_root),
            _ => None,
        };

        drop(_guard);
        let mut backend = KmsBackend {
            releaser: Arc::new(FramebufferReleaser(device.clone())),
            hdr: HdrState::new(connector_props.hdr_output_metadata),
            device,
            connector: info,
            crtc,
            pipe,
            primary,
            overlay,
            crtc_props,
            connector_props,
            mode: ModeInfo::default(),
            request: options.mode,
            configs: Vec::new(),
            active: None,
            modeset_pending: true,
            power: PowerMode::On,
            overlay_request: AtomicRequest::new(),
            overlay_shown: false,
            hdr_request: None,
            content_protection: None,
            present_fence: None,
            format: options.format,
            gui: options.gui,
            limitations: options.limitations,
            allocator,
            targets: Vec::new(),
            next_target: 0,
            backlight,
            vsync,
            config_thread,
            span,
        };
        backend.select_mode()?;
        Ok(backend)
    }

    fn select_mode(&mut self) -> Result<(), Error> {
        let modes = &self.connector.modes;
        let selected =
            select_mode(modes, self.request.as_ref()).ok_or(Error::ModeNotFound(self.connector.id))?;
        let (configs, active) =
            configs_from_modes(modes, selected, self.connector.mm_size, self.format, self.gui);
        self.mode = modes[selected];
        self.configs = configs;
        self.active = active;
        self.modeset_pending = true;
        self.prepare_targets();
        Ok(())
    }

    fn access(&self, errmsg: &'static str) -> impl Fn(std::io::Error) -> Error + '_ {
        move |source| {
            Error::Access(AccessError {
                errmsg,
                dev: self.device.path(),
                source,
            })
        }
    }

    /// Id of the CRTC
    pub fn crtc(&self) -> u32 {
        self.crtc
    }

    /// Index of the CRTC, the pipe of vblank events
    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    /// Id of the connector
    pub fn connector(&self) -> u32 {
        self.connector.id
    }

    /// Id of the overlay plane
    pub fn overlay_plane(&self) -> Option<u32> {
        self.overlay.map(|plane| plane.id)
    }

    /// Mode scanned out
    pub fn mode(&self) -> ModeInfo {
        self.mode
    }

    /// Whether the next commit sets the mode
    pub fn is_modeset_pending(&self) -> bool {
        self.modeset_pending
    }

    fn ui_size(&self) -> Size<crate::utils::Physical> {
        match self.active.and_then(|index| self.configs.get(index)) {
            Some(config) => Size::new(config.width as i32, config.height as i32),
            None => Size::new(self.mode.hdisplay as i32, self.mode.vdisplay as i32),
        }
    }

    fn mode_size(&self) -> Size<crate::utils::Physical> {
        Size::new(self.mode.hdisplay as i32, self.mode.vdisplay as i32)
    }

    fn prepare_targets(&mut self) {
        let size = self.ui_size();
        if let Some(first) = self.targets.first() {
            if first.width() == size.w as u32 && first.height() == size.h as u32 {
                return;
            }
        }
        self.targets.clear();
        self.next_target = 0;
        let Some(allocator) = self.allocator.as_ref() else {
            return;
        };
        let desc = MemoryDesc::new(size.w as u32, size.h as u32, self.format)
            .usage(Usage::HW_2D | Usage::HW_COMPOSER | Usage::HW_RENDER)
            .flags(MemoryFlags::FRAMEBUFFER);
        for _ in 0..MAX_FRAMEBUFFERS {
            match allocator.allocate(&desc) {
                Ok(target) => self.targets.push(target),
                Err(err) => {
                    warn!(parent: &self.span, %err, "failed to allocate render target");
                    self.targets.clear();
                    return;
                }
            }
        }
        debug!(parent: &self.span, width = size.w, height = size.h, "render targets allocated");
    }

    /// Framebuffer of `buffer`, registered on first use
    fn framebuffer(&self, buffer: &Memory) -> Result<u32, Error> {
        if let Some(fb) = buffer.framebuffer() {
            return Ok(fb);
        }
        let (fourcc, modifier) = buffer.format().drm_format().ok_or(Error::InvalidBuffer(buffer.id()))?;
        let fd = buffer.fd().ok_or(Error::InvalidBuffer(buffer.id()))?;
        let gem = self
            .device
            .import_buffer(fd)
            .map_err(self.access("Failed to import buffer"))?;

        let (pitches, offsets) = plane_layout(buffer);
        let handles = pitches.map(|pitch| if pitch != 0 { gem } else { 0 });
        let desc = FramebufferDesc {
            size: (buffer.width(), buffer.height()),
            fourcc,
            modifier: (modifier != Modifier::Linear).then_some(modifier),
            handles,
            pitches,
            offsets,
        };
        let fb = match self.device.add_framebuffer(&desc) {
            Ok(fb) => fb,
            Err(source) => {
                let _ = self.device.close_buffer(gem);
                return Err(self.access("Failed to add framebuffer")(source));
            }
        };
        trace!(parent: &self.span, buffer = buffer.id(), fb, "framebuffer created");
        let releaser: Arc<dyn FramebufferRelease> = self.releaser.clone();
        let releaser: Weak<dyn FramebufferRelease> = Arc::downgrade(&releaser);
        buffer.attach_framebuffer(KmsFramebuffer::new(fb, gem, releaser));
        Ok(fb)
    }

    fn add_plane(
        &self,
        request: &mut AtomicRequest,
        plane: &Plane,
        fb: u32,
        src: Rectangle<crate::utils::Buffer>,
        dst: Rectangle<crate::utils::Physical>,
    ) {
        let props = &plane.props;
        request
            .add(plane.id, props.fb_id, fb as u64)
            .add(plane.id, props.crtc_id, self.crtc as u64)
            .add(plane.id, props.src_x, to_fixed(src.loc.x.max(0) as u32))
            .add(plane.id, props.src_y, to_fixed(src.loc.y.max(0) as u32))
            .add(plane.id, props.src_w, to_fixed(src.size.w as u32))
            .add(plane.id, props.src_h, to_fixed(src.size.h as u32))
            .add(plane.id, props.crtc_x, dst.loc.x as i64 as u64)
            .add(plane.id, props.crtc_y, dst.loc.y as i64 as u64)
            .add(plane.id, props.crtc_w, dst.size.w as u64)
            .add(plane.id, props.crtc_h, dst.size.h as u64);
    }

    fn disable_overlay(&mut self) {
        if let Some(plane) = self.overlay {
            self.overlay_request
                .add(plane.id, plane.props.fb_id, 0)
                .add(plane.id, plane.props.crtc_id, 0);
        }
    }

    fn commit(&mut self, request: &AtomicRequest, flags: CommitFlags) -> Result<(), Error> {
        let fence = commit_with_retry(&*self.device, request, flags)?;
        if let Some(fence) = fence {
            self.present_fence = Some(Fence::from(fence));
        }
        Ok(())
    }

    fn apply_mode(&mut self, index: usize) -> bool {
        let Some(config) = self.configs.get(index) else {
            return false;
        };
        let changed = match config.mode_index.and_then(|mode| self.connector.modes.get(mode)) {
            Some(mode) if *mode != self.mode => {
                self.mode = *mode;
                true
            }
            _ => false,
        };
        self.active = Some(index);
        self.prepare_targets();
        changed
    }
}

/// Pitches and offsets of the planes of `buffer`
///
/// Chroma planes of YUV buffers follow the luma plane padded to 16 rows.
fn plane_layout(buffer: &Memory) -> ([u32; 4], [u32; 4]) {
    let format = buffer.format();
    let pitch = buffer.stride() * format.bytes_per_pixel();
    let rows = if format.is_yuv() {
        align_up(buffer.height(), 16)
    } else {
        buffer.height()
    };
    let luma = pitch * rows;
    match format {
        PixelFormat::I420 | PixelFormat::Yv12 => {
            let chroma = align_up(buffer.stride() / 2, 16);
            let chroma_size = chroma * rows / 2;
            ([pitch, chroma, chroma, 0], [0, luma, luma + chroma_size, 0])
        }
        PixelFormat::Yuyv | PixelFormat::Uyvy => ([pitch, 0, 0, 0], [0; 4]),
        f if f.is_yuv() => ([pitch, pitch, 0, 0], [0, luma, 0, 0]),
        _ => ([pitch, 0, 0, 0], [0; 4]),
    }
}

/// Shrink to an even size, the display controller can't scan out odd sizes
fn align_even<Kind>(rect: Rectangle<Kind>) -> Rectangle<Kind> {
    Rectangle::from_loc_and_size(rect.loc, (rect.size.w & !1, rect.size.h & !1))
}

impl Drop for KmsBackend {
    fn drop(&mut self) {
        self.hdr.release_all(&*self.device);
    }
}

impl DisplayBackend for KmsBackend {
    fn display_type(&self) -> DisplayType {
        display_type(self.connector.interface)
    }

    fn is_connected(&self) -> bool {
        self.connector.is_usable()
    }

    fn refresh_connection(&mut self) -> bool {
        match self.device.connector(self.connector.id) {
            Ok(info) => {
                if info.modes != self.connector.modes {
                    debug!(parent: &self.span, modes = info.modes.len(), "connector modes changed");
                    // mode indices of the configs are stale
                    self.configs.clear();
                }
                self.connector = info;
            }
            Err(err) => warn!(parent: &self.span, %err, "failed to probe connector"),
        }
        self.connector.is_usable()
    }

    fn read_configs(&mut self) -> (Vec<DisplayConfig>, Option<usize>) {
        if self.configs.is_empty() {
            if let Err(err) = self.select_mode() {
                warn!(parent: &self.span, %err, "no mode available");
                return (Vec::new(), None);
            }
        }
        (self.configs.clone(), self.active)
    }

    fn limitations(&self) -> Limitations {
        self.limitations
    }

    fn check_overlay(&self, layer: &Layer) -> bool {
        if self.overlay.is_none() || layer.transform != Transform::empty() {
            return false;
        }
        let Some(buffer) = layer.handle.as_ref() else {
            return false;
        };
        let format = buffer.format();
        if !format.is_yuv() || format.drm_format().is_none() || buffer.fd().is_none() {
            return false;
        }
        let dst = layer.display_frame.scale_between(self.ui_size(), self.mode_size());
        let src = layer.source_crop;
        dst.size.w <= src.size.w * MAX_OVERLAY_UPSCALE && dst.size.h <= src.size.h * MAX_OVERLAY_UPSCALE
    }

    #[instrument(level = "trace", parent = &self.span, skip_all)]
    fn perform_overlay(
        &mut self,
        overlay: Option<&Layer>,
        _config: Option<&DisplayConfig>,
    ) -> Result<(), display::Error> {
        let Some(plane) = self.overlay else {
            return Ok(());
        };
        let Some(layer) = overlay else {
            if self.overlay_shown {
                debug!("overlay plane disabled");
                self.disable_overlay();
                self.overlay_shown = false;
                self.hdr.update(&*self.device, None)?;
            }
            return Ok(());
        };

        let buffer = layer.handle.as_ref().ok_or(Error::InvalidBuffer(0))?;
        let fb = self.framebuffer(buffer)?;
        let dst = align_even(layer.display_frame.scale_between(self.ui_size(), self.mode_size()));
        let src = align_even(layer.source_crop);

        let mut request = AtomicRequest::new();
        self.add_plane(&mut request, &plane, fb, src, dst);
        if let Some((y_offset, uv_offset)) = buffer.take_tile_offsets() {
            request.add(
                plane.id,
                plane.props.dtrc_table_ofs,
                y_offset as u64 | (uv_offset as u64) << 32,
            );
        }
        self.overlay_request.merge(&request);
        self.overlay_shown = true;

        let metadata = if layer.is_hdr { self.hdr_request } else { None };
        self.hdr.update(&*self.device, metadata)?;
        trace!(layer = layer.index, fb, ?src, ?dst, "overlay plane programmed");
        Ok(())
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
        if !target.flags().contains(MemoryFlags::FRAMEBUFFER) {
            error!(buffer = target.id(), "render target is not a framebuffer");
            return Err(Error::InvalidBuffer(target.id()).into());
        }
        let fb = self.framebuffer(target)?;

        if frame.history.needs_target_clear() && frame.composer.is_valid() {
            let full = Rectangle::from_loc_and_size((0, 0), (target.width() as i32, target.height() as i32));
            if let Err(err) = frame.composer.clear_rect(target, full) {
                warn!(%err, "failed to clear render target");
            }
        }

        let mut request = AtomicRequest::new();
        let mut flags = CommitFlags::NONBLOCK;
        let mut mode_blob = None;
        if self.modeset_pending {
            let blob = self
                .device
                .create_blob(&self.mode.to_bytes())
                .map_err(self.access("Failed to create mode blob"))?;
            debug!(mode = ?self.mode, blob, "setting mode");
            request
                .add(self.crtc, self.crtc_props.mode_id, blob as u64)
                .add(self.crtc, self.crtc_props.active, 1)
                .add(self.connector.id, self.connector_props.crtc_id, self.crtc as u64);
            flags = CommitFlags::ALLOW_MODESET;
            mode_blob = Some(blob);
        }

        let src = Rectangle::from_loc_and_size((0, 0), (target.width() as i32, target.height() as i32));
        let dst = Rectangle::from_loc_and_size((0, 0), self.mode_size());
        let primary = self.primary;
        self.add_plane(&mut request, &primary, fb, src, dst);

        // the fence has to stay open until the commit returned
        let target_fence = frame.target_fence;
        if let Some(fence) = target_fence.as_ref() {
            request.add(primary.id, primary.props.in_fence_fd, fence.as_raw_fd() as u64);
        }
        request.request_out_fence(self.crtc, self.crtc_props.out_fence_ptr);

        if let Some(enabled) = self.content_protection.take() {
            let value = if enabled {
                CONTENT_PROTECTION_DESIRED
            } else {
                CONTENT_PROTECTION_UNDESIRED
            };
            request.add(self.connector.id, self.connector_props.content_protection, value);
        }
        request.merge(&self.overlay_request);
        self.hdr.attach(&mut request, self.connector.id);

        let result = self.commit(&request, flags);
        drop(target_fence);
        if let Some(blob) = mode_blob {
            if let Err(err) = self.device.destroy_blob(blob) {
                warn!(blob, %err, "failed to destroy mode blob");
            }
        }

        match result {
            Ok(()) => {
                self.modeset_pending = false;
                self.overlay_request = AtomicRequest::new();
                self.hdr.release_retired(&*self.device);
            }
            Err(err) => error!(%err, "frame not presented"),
        }
        if let Some(thread) = self.config_thread.as_ref() {
            thread.frame_presented();
        }
        Ok(())
    }

    fn present_fence(&mut self) -> Option<Fence> {
        self.present_fence.take()
    }

    #[instrument(level = "debug", parent = &self.span, skip(self))]
    fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), display::Error> {
        match mode {
            PowerMode::Off => {
                let mut request = AtomicRequest::new();
                request
                    .add(self.crtc, self.crtc_props.active, 0)
                    .add(self.primary.id, self.primary.props.fb_id, 0)
                    .add(self.primary.id, self.primary.props.crtc_id, 0);
                if self.overlay_shown {
                    self.disable_overlay();
                    self.overlay_shown = false;
                }
                request.merge(&self.overlay_request);
                self.commit(&request, CommitFlags::ALLOW_MODESET)?;
                self.overlay_request = AtomicRequest::new();
                self.modeset_pending = true;
                info!("crtc disabled");
            }
            PowerMode::On if self.power == PowerMode::Off => {
                self.modeset_pending = true;
            }
            _ => {}
        }
        debug!(?mode, "power mode");
        self.power = mode;
        Ok(())
    }

    fn set_vsync_enabled(&mut self, enabled: bool) {
        if let Some(vsync) = self.vsync.as_ref() {
            vsync.set_enabled(enabled);
        }
    }

    fn apply_config(&mut self, config: &DisplayConfig) -> Result<(), display::Error> {
        let Some(index) = self.configs.iter().position(|c| c == config) else {
            // configs added by the caller have no mode of their own
            return Ok(());
        };
        if self.apply_mode(index) {
            self.modeset_pending = true;
        }
        Ok(())
    }

    fn schedule_config(
        &mut self,
        index: usize,
        config: &DisplayConfig,
        modeset: bool,
        desired_time: i64,
    ) -> Result<Option<VsyncPeriodTimeline>, display::Error> {
        let Some(thread) = self.config_thread.as_ref() else {
            return Ok(None);
        };
        Ok(Some(thread.schedule(index, config.vsync_period, modeset, desired_time)))
    }

    fn take_applied_config(&mut self) -> Option<usize> {
        let applied = self.config_thread.as_ref()?.take_applied()?;
        if self.apply_mode(applied.index) || applied.modeset {
            self.modeset_pending = true;
        }
        Some(applied.index)
    }

    fn set_hdr_metadata(&mut self, metadata: Option<HdrOutputMetadata>) -> Result<(), display::Error> {
        if !self.hdr.is_supported() {
            return Err(display::Error::Unsupported);
        }
        self.hdr_request = metadata;
        Ok(())
    }

    fn set_content_protection(&mut self, enabled: bool) -> Result<(), display::Error> {
        if self.connector_props.content_protection == 0 {
            return Err(display::Error::Unsupported);
        }
        self.content_protection = Some(enabled);
        Ok(())
    }

    fn set_brightness(&mut self, brightness: f32) -> Result<(), display::Error> {
        let backlight = self.backlight.as_ref().ok_or(display::Error::Unsupported)?;
        backlight
            .set(brightness)
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to set backlight",
                    dev: None,
                    source,
                })
            })?;
        Ok(())
    }
}
