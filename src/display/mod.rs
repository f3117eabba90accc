//! Displays and their composition state
//!
//! A [`Display`] owns the layer slots of one output, the table of its supported
//! configs and the render target handed over by the client. Every frame follows the
//! same sequence:
//!
//! 1. the caller claims layer slots with [`Display::get_free_layer`] and describes the
//!    frame through [`Display::with_layer`],
//! 2. [`Display::verify_layers`] decides the composition of every layer,
//! 3. the client composes the layers left to it and hands over the result through
//!    [`Display::set_render_target`],
//! 4. [`Display::compose_layers`] blits the device composited layers and programs
//!    the overlay plane,
//! 5. [`Display::update_screen`] presents the frame.
//!
//! What happens in the last two steps depends on the [`Backend`] of the display. All
//! state of a display is guarded by one mutex, so calls from different threads are
//! serialized.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

use tracing::{debug, error, info, info_span, instrument, trace, warn};

use crate::{
    backend::{
        allocator::{MemoryHandle, PixelFormat},
        composer::Composer,
        drm::{hdr::HdrOutputMetadata, KmsBackend},
        fbdev::FbBackend,
        sync::{self, Fence},
    },
    utils::{monotonic_nanos, next_vsync_in_phase, Rectangle},
};

pub mod buffer_slot;
pub mod config;
mod error;
pub mod layer;
pub mod verify;
pub mod virtual_display;

pub use self::buffer_slot::BufferSlot;
pub use self::config::{DisplayConfig, DisplayType, PowerMode};
pub use self::error::Error;
pub use self::layer::{BlendMode, Layer, LayerFlags, LayerType, Transform, MAX_LAYERS};
pub use self::verify::{ComposeHistory, Limitations, OverlayRule, Verdict};
pub use self::virtual_display::VirtualBackend;

/// Id of the primary display
pub const PRIMARY_DISPLAY: usize = 0;

/// Z-order of layers fed by a hardware producer, above everything else
const HW_LAYER_ZORDER: u32 = 0x7fff_ffff;

/// Timing of a scheduled refresh rate change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VsyncPeriodTimeline {
    /// Monotonic time in ns of the first vsync at the new period
    pub applied_time: i64,
    /// Whether a new frame has to be presented for the change to happen
    pub refresh_required: bool,
    /// Monotonic time in ns at which that frame has to be presented
    pub refresh_time: i64,
}

/// Receiver of display events
///
/// Callbacks are invoked from worker threads of the display and must not call back
/// into blocking display methods.
pub trait EventListener: Send + Sync {
    /// A vsync happened at `timestamp` (monotonic ns)
    fn on_vsync(&self, display: usize, timestamp: i64, period: i64);
    /// The display got plugged or unplugged
    fn on_hotplug(&self, display: usize, connected: bool);
    /// The display needs a new frame
    fn on_refresh(&self, display: usize);
    /// A scheduled refresh rate change got a new timeline
    fn on_vsync_period_timing_changed(&self, display: usize, timeline: VsyncPeriodTimeline);
    /// A seamless config change became possible again
    fn on_seamless_possible(&self, display: usize) {
        let _ = display;
    }
}

/// Event dispatch shared between a display and its worker threads
pub struct EventSink {
    display: usize,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
    vsync_enabled: AtomicBool,
    vsync_period: AtomicI64,
    last_vsync: AtomicI64,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("display", &self.display)
            .field("listener", &self.listener.read().unwrap().is_some())
            .field("vsync_enabled", &self.vsync_enabled)
            .field("vsync_period", &self.vsync_period)
            .finish()
    }
}

impl EventSink {
    /// Dispatch for the display `display`
    pub fn new(display: usize) -> Arc<EventSink> {
        Arc::new(EventSink {
            display,
            listener: RwLock::new(None),
            vsync_enabled: AtomicBool::new(false),
            vsync_period: AtomicI64::new(config::period_from_fps(config::DEFAULT_REFRESH_RATE as f32)),
            last_vsync: AtomicI64::new(0),
        })
    }

    /// Display id events are reported for
    pub fn display(&self) -> usize {
        self.display
    }

    fn listener(&self) -> Option<Arc<dyn EventListener>> {
        self.listener.read().unwrap().clone()
    }

    /// Replace the listener
    pub fn set_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        *self.listener.write().unwrap() = listener;
    }

    /// Frame length in ns
    pub fn vsync_period(&self) -> i64 {
        self.vsync_period.load(Ordering::Acquire)
    }

    /// Change the frame length
    pub fn set_vsync_period(&self, period: i64) {
        self.vsync_period.store(period, Ordering::Release);
    }

    /// Timestamp of the last vsync, 0 before the first one
    pub fn last_vsync(&self) -> i64 {
        self.last_vsync.load(Ordering::Acquire)
    }

    /// Whether vsync events are forwarded
    pub fn vsync_enabled(&self) -> bool {
        self.vsync_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_vsync_enabled(&self, enabled: bool) {
        self.vsync_enabled.store(enabled, Ordering::Release);
    }

    /// Record a vsync and forward it if enabled
    pub fn vsync(&self, timestamp: i64) {
        self.last_vsync.store(timestamp, Ordering::Release);
        if !self.vsync_enabled() {
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_vsync(self.display, timestamp, self.vsync_period());
        }
    }

    /// Ask for a new frame
    pub fn refresh(&self) {
        if let Some(listener) = self.listener() {
            listener.on_refresh(self.display);
        }
    }

    /// Report a connection change
    pub fn hotplug(&self, connected: bool) {
        if let Some(listener) = self.listener() {
            listener.on_hotplug(self.display, connected);
        }
    }

    /// Report a new refresh rate change timeline
    pub fn vsync_period_timing_changed(&self, timeline: VsyncPeriodTimeline) {
        if let Some(listener) = self.listener() {
            listener.on_vsync_period_timing_changed(self.display, timeline);
        }
    }

    /// Report that seamless config changes are possible again
    pub fn seamless_possible(&self) {
        if let Some(listener) = self.listener() {
            listener.on_seamless_possible(self.display);
        }
    }
}

/// Inputs of a [`DisplayBackend::update_screen`] call
#[derive(Debug)]
pub struct Frame<'a> {
    /// Buffer to scan out
    pub target: &'a MemoryHandle,
    /// Signaled once the client finished drawing into [`Frame::target`]
    pub target_fence: Option<Fence>,
    /// Whether the target was drawn by device composition
    pub composed: bool,
    /// Composition of this and the previous frame
    pub history: &'a ComposeHistory,
    /// Active config, the size the client renders at
    pub config: Option<&'a DisplayConfig>,
    /// Device composition engine
    pub composer: &'a Composer,
}

/// Hardware specific part of a display
pub trait DisplayBackend: fmt::Debug + Send {
    /// Kind of output
    fn display_type(&self) -> DisplayType;

    /// Whether the output is plugged
    fn is_connected(&self) -> bool;

    /// Re-read the connection state, returns the new state
    fn refresh_connection(&mut self) -> bool {
        self.is_connected()
    }

    /// Supported configs and the index of the one in use
    fn read_configs(&mut self) -> (Vec<DisplayConfig>, Option<usize>);

    /// Hardware limitations affecting device composition
    fn limitations(&self) -> Limitations {
        Limitations::empty()
    }

    /// Whether `layer` can be scanned out on an overlay plane
    fn check_overlay(&self, layer: &Layer) -> bool {
        let _ = layer;
        false
    }

    /// Program the overlay plane for the next [`DisplayBackend::update_screen`]
    fn perform_overlay(
        &mut self,
        overlay: Option<&Layer>,
        config: Option<&DisplayConfig>,
    ) -> Result<(), Error> {
        let _ = (overlay, config);
        Ok(())
    }

    /// Buffer to compose device composited layers into
    ///
    /// `None` makes device composition draw into the client target.
    fn render_target(&mut self) -> Option<MemoryHandle> {
        None
    }

    /// Present a frame
    fn update_screen(&mut self, frame: Frame<'_>) -> Result<(), Error>;

    /// Fence signaled once the last presented frame is on screen
    fn present_fence(&mut self) -> Option<Fence> {
        None
    }

    /// Change the power state
    fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), Error>;

    /// Start or stop the vsync source
    fn set_vsync_enabled(&mut self, enabled: bool) {
        let _ = enabled;
    }

    /// Switch to `config` immediately
    fn apply_config(&mut self, config: &DisplayConfig) -> Result<(), Error> {
        let _ = config;
        Ok(())
    }

    /// Switch to `config` at `desired_time`
    ///
    /// `Ok(None)` if the backend can't defer the change, the display applies it
    /// immediately then.
    fn schedule_config(
        &mut self,
        index: usize,
        config: &DisplayConfig,
        modeset: bool,
        desired_time: i64,
    ) -> Result<Option<VsyncPeriodTimeline>, Error> {
        let _ = (index, config, modeset, desired_time);
        Ok(None)
    }

    /// Config index a deferred change switched to since the last call
    fn take_applied_config(&mut self) -> Option<usize> {
        None
    }

    /// Send HDR metadata to the sink, `None` switches back to SDR
    fn set_hdr_metadata(&mut self, metadata: Option<HdrOutputMetadata>) -> Result<(), Error> {
        let _ = metadata;
        Err(Error::Unsupported)
    }

    /// Request or release link protection
    fn set_content_protection(&mut self, enabled: bool) -> Result<(), Error> {
        let _ = enabled;
        Err(Error::Unsupported)
    }

    /// Set the backlight, `0.0..=1.0`
    fn set_brightness(&mut self, brightness: f32) -> Result<(), Error> {
        let _ = brightness;
        Err(Error::Unsupported)
    }
}

/// The hardware a display drives
#[derive(Debug)]
pub enum Backend {
    /// Legacy framebuffer device
    Fb(FbBackend),
    /// DRM/KMS atomic pipeline
    Kms(KmsBackend),
    /// Memory only output
    Virtual(VirtualBackend),
}

impl Backend {
    fn inner(&self) -> &dyn DisplayBackend {
        match self {
            Backend::Fb(fb) => fb,
            Backend::Kms(kms) => kms,
            Backend::Virtual(virt) => virt,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DisplayBackend {
        match self {
            Backend::Fb(fb) => fb,
            Backend::Kms(kms) => kms,
            Backend::Virtual(virt) => virt,
        }
    }
}

#[derive(Debug)]
struct DisplayState {
    layers: Vec<Layer>,
    verdict: Verdict,
    history: ComposeHistory,
    configs: Vec<DisplayConfig>,
    active: Option<usize>,
    client_target: Option<MemoryHandle>,
    client_fence: Option<Fence>,
    composed_target: Option<MemoryHandle>,
    power: PowerMode,
    connected: bool,
    backend: Backend,
}

impl DisplayState {
    fn layer_mut(&mut self, index: usize) -> Result<&mut Layer, Error> {
        match self.layers.get_mut(index) {
            Some(layer) if layer.busy => Ok(layer),
            _ => {
                error!(layer = index, "invalid layer");
                Err(Error::InvalidLayer(index))
            }
        }
    }

    fn active_config(&self) -> Option<&DisplayConfig> {
        self.active.and_then(|index| self.configs.get(index))
    }

    fn sync_applied_config(&mut self, sink: &EventSink) {
        if let Some(index) = self.backend.inner_mut().take_applied_config() {
            if let Some(config) = self.configs.get(index) {
                debug!(config = index, "deferred config applied");
                sink.set_vsync_period(config.vsync_period);
                self.active = Some(index);
            }
        }
    }

    fn wait_fences(&mut self) {
        if let Some(fence) = self.client_fence.take() {
            sync::wait_optional(Some(&fence));
        }
        for layer in self.layers.iter_mut().filter(|l| l.busy) {
            if let Some(fence) = layer.acquire_fence.take() {
                sync::wait_optional(Some(&fence));
            }
        }
    }
}

/// One output
pub struct Display {
    id: usize,
    composer: Arc<Composer>,
    sink: Arc<EventSink>,
    secure_overlay: bool,
    state: Mutex<DisplayState>,
    span: tracing::Span,
}

impl fmt::Debug for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display")
            .field("id", &self.id)
            .field("secure_overlay", &self.secure_overlay)
            .finish_non_exhaustive()
    }
}

impl Display {
    /// Create a display around `backend`
    ///
    /// `sink` has to be the sink the backend reports its events to.
    pub fn new(
        sink: Arc<EventSink>,
        mut backend: Backend,
        composer: Arc<Composer>,
        secure_overlay: bool,
    ) -> Display {
        let id = sink.display();
        let span = info_span!("display", id);
        let _guard = span.enter();

        let (configs, active) = backend.inner_mut().read_configs();
        let active = active.filter(|&index| index < configs.len());
        if let Some(config) = active.and_then(|index| configs.get(index)) {
            sink.set_vsync_period(config.vsync_period);
            info!(
                kind = ?backend.inner().display_type(),
                width = config.width,
                height = config.height,
                fps = config.fps,
                "display created"
            );
        } else {
            info!(kind = ?backend.inner().display_type(), "display created without config");
        }
        let connected = backend.inner().is_connected();

        drop(_guard);
        Display {
            id,
            composer,
            sink,
            secure_overlay,
            state: Mutex::new(DisplayState {
                layers: (0..MAX_LAYERS).map(Layer::new).collect(),
                verdict: Verdict::default(),
                history: ComposeHistory::default(),
                configs,
                active,
                client_target: None,
                client_fence: None,
                composed_target: None,
                power: PowerMode::On,
                connected,
                backend,
            }),
            span,
        }
    }

    fn state(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap()
    }

    /// Display id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Kind of output
    pub fn display_type(&self) -> DisplayType {
        self.state().backend.inner().display_type()
    }

    /// Whether the output is plugged
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Re-read the connection state and report a change to the listener
    pub fn refresh_connection(&self) -> bool {
        let mut state = self.state();
        let connected = state.backend.inner_mut().refresh_connection();
        if connected != state.connected {
            info!(parent: &self.span, connected, "connection changed");
            state.connected = connected;
            if connected {
                let (configs, active) = state.backend.inner_mut().read_configs();
                state.configs = configs;
                state.active = active;
            }
            drop(state);
            self.sink.hotplug(connected);
        }
        connected
    }

    /// Event dispatch of this display
    pub fn events(&self) -> &Arc<EventSink> {
        &self.sink
    }

    /// Replace the listener receiving the events of this display
    pub fn set_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        self.sink.set_listener(listener);
    }

    /// Access to the backend
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut Backend) -> R) -> R {
        f(&mut self.state().backend)
    }

    /// Claim a free layer slot
    pub fn get_free_layer(&self) -> Option<usize> {
        let mut state = self.state();
        let layer = state.layers.iter_mut().find(|layer| !layer.busy)?;
        layer.busy = true;
        trace!(parent: &self.span, layer = layer.index, "layer claimed");
        Some(layer.index)
    }

    /// Access a claimed layer
    pub fn with_layer<R>(&self, index: usize, f: impl FnOnce(&mut Layer) -> R) -> Result<R, Error> {
        let mut state = self.state();
        state.layer_mut(index).map(f)
    }

    /// Return a claimed layer slot to the free pool
    pub fn release_layer(&self, index: usize) -> Result<(), Error> {
        let mut state = self.state();
        state.layer_mut(index)?.reset();
        state.verdict.layers.retain(|&i| i != index);
        if state.verdict.overlay == Some(index) {
            state.verdict.overlay = None;
        }
        trace!(parent: &self.span, layer = index, "layer released");
        Ok(())
    }

    /// The layer fed by `slot`
    pub fn layer_by_buffer_slot(&self, slot: &Arc<BufferSlot>) -> Option<usize> {
        let state = self.state();
        state
            .layers
            .iter()
            .find(|layer| layer.busy && layer.buffer_slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, slot)))
            .map(|layer| layer.index)
    }

    /// Reset every layer slot
    pub fn invalidate_layers(&self) {
        let mut state = self.state();
        for layer in state.layers.iter_mut() {
            layer.reset();
        }
        state.verdict = Verdict::default();
    }

    /// Set or clear [`LayerFlags::SKIP_LAYER`] on every slot
    pub fn set_skip_layer(&self, skip: bool) {
        let mut state = self.state();
        for layer in state.layers.iter_mut() {
            layer.flags.set(LayerFlags::SKIP_LAYER, skip);
        }
    }

    /// Claimed layers whose decided type differs from the requested one
    pub fn changed_types(&self) -> Vec<(usize, LayerType)> {
        self.state()
            .layers
            .iter()
            .filter(|layer| layer.busy && layer.type_ != layer.orig_type)
            .map(|layer| (layer.index, layer.type_))
            .collect()
    }

    /// Take the release fences of all claimed layers
    pub fn release_fences(&self) -> Vec<(usize, Fence)> {
        self.state()
            .layers
            .iter_mut()
            .filter(|layer| layer.busy)
            .filter_map(|layer| layer.release_fence.take().map(|fence| (layer.index, fence)))
            .collect()
    }

    /// Bind the next queued buffer of every hardware-fed layer
    ///
    /// A layer without a new buffer keeps showing the buffer it showed last.
    pub fn refresh_buffer_slot_layers(&self) {
        let mut state = self.state();
        for layer in state.layers.iter_mut().filter(|l| l.busy) {
            let Some(slot) = layer.buffer_slot.clone() else {
                continue;
            };
            if let Some(buffer) = slot.present_slot().and_then(|index| slot.buffer(index)) {
                layer.handle = Some(buffer);
            }
        }
    }

    /// Decide the composition of every claimed layer
    ///
    /// Returns whether the 2D engine composes this frame. Every layer it doesn't
    /// compose and that isn't scanned out on an overlay plane is left to the client.
    #[profiling::function]
    pub fn verify_layers(&self) -> bool {
        let _guard = self.span.enter();
        let mut guard = self.state();
        let state = &mut *guard;
        let backend = state.backend.inner();
        let check_overlay = |layer: &Layer| backend.check_overlay(layer);
        let ctx = verify::VerifyContext {
            composer: &self.composer,
            check_overlay: &check_overlay,
            secure_overlay: self.secure_overlay,
            limitations: backend.limitations(),
        };
        let verdict = verify::verify_layers(&mut state.layers, &ctx, &mut state.history);
        let device_compose = verdict.device_compose;
        state.verdict = verdict;
        device_compose
    }

    /// Result of the last [`Display::verify_layers`]
    pub fn verdict(&self) -> Verdict {
        self.state().verdict.clone()
    }

    /// Whether the last verified frame differs from the one before
    pub fn ui_update(&self) -> bool {
        self.state().verdict.ui_update
    }

    /// Composition history of the last verified frames
    pub fn compose_history(&self) -> ComposeHistory {
        self.state().history.clone()
    }

    /// Hand over the buffer the client composed into
    pub fn set_render_target(&self, target: Option<MemoryHandle>, fence: Option<Fence>) {
        let mut state = self.state();
        state.client_target = target;
        state.client_fence = fence;
    }

    /// Blit the device composited layers and program the overlay plane
    ///
    /// Waits for the client and layer fences first.
    #[profiling::function]
    pub fn compose_layers(&self) -> Result<(), Error> {
        let _guard = self.span.enter();
        let mut guard = self.state();
        let state = &mut *guard;
        state.wait_fences();
        state.composed_target = None;

        if !state.connected && self.id != PRIMARY_DISPLAY {
            error!("compose on unplugged display");
            return Err(Error::Disconnected);
        }

        let overlay = state.verdict.overlay.map(|index| &state.layers[index]);
        let config = state.active.and_then(|index| state.configs.get(index));
        if let Err(err) = state.backend.inner_mut().perform_overlay(overlay, config) {
            warn!(%err, "failed to program overlay plane");
        }

        if state.verdict.layers.is_empty() {
            return Ok(());
        }

        let target = state
            .backend
            .inner_mut()
            .render_target()
            .or_else(|| state.client_target.clone())
            .ok_or(Error::NoRenderTarget)?;
        let layers: Vec<&Layer> = state.verdict.layers.iter().map(|&index| &state.layers[index]).collect();

        self.composer.clear_worm_hole(&target, &layers)?;
        let mut result = Ok(());
        for (i, layer) in layers.iter().enumerate() {
            if !layer.busy {
                error!(layer = layer.index, "compose invalid layer");
                continue;
            }
            if layer.orig_type == LayerType::Sideband {
                continue;
            }
            if let Err(err) = self.composer.compose_layer(&target, layer, i == 0) {
                error!(layer = layer.index, %err, "compose layer failed");
                result = Err(err.into());
                break;
            }
        }
        self.composer.finish()?;
        state.composed_target = Some(target);
        result
    }

    /// Present the frame
    #[profiling::function]
    #[instrument(level = "trace", parent = &self.span, skip_all)]
    pub fn update_screen(&self) -> Result<(), Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.sync_applied_config(&self.sink);

        if !state.connected {
            error!("update screen on unplugged display");
            return Err(Error::Disconnected);
        }
        if state.power != PowerMode::On {
            debug!(power = ?state.power, "update screen while not powered on");
            return Err(Error::PoweredOff);
        }

        let (target, target_fence, composed) = match state.composed_target.take() {
            Some(target) => (target, None, true),
            None => (
                state.client_target.clone().ok_or(Error::NoRenderTarget)?,
                state.client_fence.take(),
                false,
            ),
        };
        let config = state.active.and_then(|index| state.configs.get(index));
        state.backend.inner_mut().update_screen(Frame {
            target: &target,
            target_fence,
            composed,
            history: &state.history,
            config,
            composer: &self.composer,
        })
    }

    /// Fence signaled once the last presented frame is on screen
    pub fn present_fence(&self) -> Option<Fence> {
        self.state().backend.inner_mut().present_fence()
    }

    /// Queue `buffer` of a hardware producer for presentation
    ///
    /// The first call for a `slot` creates a full screen layer on top of all others.
    /// With `trigger_composition` the frame is composed and presented right away,
    /// otherwise the first queued buffer asks the listener for a refresh.
    pub fn present_hw_layer(
        &self,
        slot: &Arc<BufferSlot>,
        index: usize,
        buffer: &MemoryHandle,
        trigger_composition: bool,
    ) -> Result<(), Error> {
        if self.layer_by_buffer_slot(slot).is_none() {
            let layer = self.get_free_layer().ok_or_else(|| {
                error!(parent: &self.span, "no free layer for hardware producer");
                Error::InvalidLayer(MAX_LAYERS)
            })?;
            let (width, height) = self
                .active_config()
                .map(|config| (config.width as i32, config.height as i32))
                .unwrap_or((buffer.width() as i32, buffer.height() as i32));
            self.with_layer(layer, |layer| {
                layer.orig_type = LayerType::Device;
                layer.transform = Transform::empty();
                layer.blend_mode = BlendMode::Premultiplied;
                layer.plane_alpha = 0xff;
                layer.color = 0;
                layer.source_crop =
                    Rectangle::from_loc_and_size((0, 0), (buffer.width() as i32, buffer.height() as i32));
                layer.display_frame = Rectangle::from_loc_and_size((0, 0), (width, height));
                layer.visible_region = vec![layer.display_frame];
                layer.zorder = HW_LAYER_ZORDER;
                layer.flags |= LayerFlags::BUFFER_SLOT;
                layer.buffer_slot = Some(slot.clone());
            })?;
        }

        slot.add_present_slot(index, buffer);
        if trigger_composition {
            self.refresh_buffer_slot_layers();
            self.verify_layers();
            self.compose_layers()?;
            self.update_screen()?;
            if let Some(fence) = self.present_fence() {
                sync::wait_optional(Some(&fence));
            }
        } else if slot.present_total() == 1 {
            self.sink.refresh();
        }
        Ok(())
    }

    /// Number of configs
    pub fn config_count(&self) -> usize {
        self.state().configs.len()
    }

    /// Config at `index`
    pub fn config(&self, index: usize) -> Option<DisplayConfig> {
        self.state().configs.get(index).cloned()
    }

    /// All configs
    pub fn configs(&self) -> Vec<DisplayConfig> {
        self.state().configs.clone()
    }

    /// Config group of the config at `index`
    pub fn config_group(&self, index: usize) -> Option<i32> {
        self.state().configs.get(index).map(|config| config.group_id)
    }

    /// Config in use
    pub fn active_config(&self) -> Option<DisplayConfig> {
        let mut state = self.state();
        state.sync_applied_config(&self.sink);
        state.active_config().cloned()
    }

    /// Index of the config in use
    pub fn active_config_index(&self) -> Option<usize> {
        let mut state = self.state();
        state.sync_applied_config(&self.sink);
        state.active
    }

    /// Index of the config with the given resolution and format
    pub fn find_config(&self, width: u32, height: u32, format: PixelFormat) -> Option<usize> {
        self.state()
            .configs
            .iter()
            .position(|config| config.matches(width, height, format))
    }

    /// Append a config, returns its index
    pub fn add_config(&self, config: DisplayConfig) -> usize {
        let mut state = self.state();
        state.configs.push(config);
        state.configs.len() - 1
    }

    /// Make the config with the given resolution and format active, creating it if needed
    pub fn set_config(&self, width: u32, height: u32, format: PixelFormat) -> usize {
        let mut state = self.state();
        let index = match state.configs.iter().position(|c| c.matches(width, height, format)) {
            Some(index) => index,
            None => {
                state.configs.push(DisplayConfig::new(width, height, format));
                state.configs.len() - 1
            }
        };
        state.active = Some(index);
        self.sink.set_vsync_period(state.configs[index].vsync_period);
        index
    }

    /// Drop every config
    pub fn clear_configs(&self) {
        let mut state = self.state();
        state.configs.clear();
        state.active = None;
    }

    /// Switch to the config at `index` immediately
    pub fn set_active_config(&self, index: usize) -> Result<(), Error> {
        let mut state = self.state();
        let Some(config) = state.configs.get(index).cloned() else {
            error!(parent: &self.span, config = index, "invalid config");
            return Err(Error::BadConfig(index));
        };
        if state.active == Some(index) {
            return Ok(());
        }
        state.backend.inner_mut().apply_config(&config)?;
        state.active = Some(index);
        self.sink.set_vsync_period(config.vsync_period);
        info!(
            parent: &self.span,
            config = index,
            width = config.width,
            height = config.height,
            fps = config.fps,
            "config changed"
        );
        Ok(())
    }

    /// Switch to the config at `index` at `desired_time` (monotonic ns)
    ///
    /// A config of the same group only changes the refresh rate. A config of another
    /// group needs a mode set and fails if `seamless_required` is set.
    pub fn set_active_config_with_constraints(
        &self,
        index: usize,
        desired_time: i64,
        seamless_required: bool,
    ) -> Result<VsyncPeriodTimeline, Error> {
        let mut state = self.state();
        let Some(config) = state.configs.get(index).cloned() else {
            error!(parent: &self.span, config = index, "invalid config");
            return Err(Error::BadConfig(index));
        };

        let now = monotonic_nanos();
        if state.active == Some(index) {
            return Ok(VsyncPeriodTimeline {
                applied_time: now.max(desired_time),
                ..Default::default()
            });
        }

        let same_group = state
            .active_config()
            .map(|active| active.group_id == config.group_id)
            .unwrap_or(false);
        if !same_group && seamless_required {
            debug!(parent: &self.span, config = index, "seamless change across config groups");
            return Err(Error::SeamlessNotAllowed);
        }

        if let Some(timeline) = state
            .backend
            .inner_mut()
            .schedule_config(index, &config, !same_group, desired_time)?
        {
            return Ok(timeline);
        }

        state.backend.inner_mut().apply_config(&config)?;
        state.active = Some(index);
        self.sink.set_vsync_period(config.vsync_period);
        let applied_time =
            next_vsync_in_phase(config.vsync_period, self.sink.last_vsync(), now.max(desired_time));
        Ok(VsyncPeriodTimeline {
            applied_time,
            ..Default::default()
        })
    }

    /// Power state
    pub fn power_mode(&self) -> PowerMode {
        self.state().power
    }

    /// Change the power state
    pub fn set_power_mode(&self, mode: PowerMode) -> Result<(), Error> {
        let mut state = self.state();
        if state.power == mode {
            return Ok(());
        }
        state.backend.inner_mut().set_power_mode(mode)?;
        debug!(parent: &self.span, ?mode, "power mode changed");
        state.power = mode;
        Ok(())
    }

    /// Start or stop vsync events
    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.sink.set_vsync_enabled(enabled);
        self.state().backend.inner_mut().set_vsync_enabled(enabled);
    }

    /// Send HDR metadata to the sink
    pub fn set_hdr_metadata(&self, metadata: Option<HdrOutputMetadata>) -> Result<(), Error> {
        self.state().backend.inner_mut().set_hdr_metadata(metadata)
    }

    /// Request or release link protection
    pub fn set_content_protection(&self, enabled: bool) -> Result<(), Error> {
        self.state().backend.inner_mut().set_content_protection(enabled)
    }

    /// Set the backlight, `0.0..=1.0`
    pub fn set_brightness(&self, brightness: f32) -> Result<(), Error> {
        self.state().backend.inner_mut().set_brightness(brightness)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::backend::{
        allocator::test::buffer,
        composer::{
            engine::test::{MockEngine, Op},
            test::composer,
            ComposerPolicy,
        },
        sync::test::pipe_fence,
    };

    /// Listener recording every event
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub events: Mutex<Vec<String>>,
    }

    impl Recorder {
        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl EventListener for Recorder {
        fn on_vsync(&self, display: usize, _timestamp: i64, period: i64) {
            self.events.lock().unwrap().push(format!("vsync {display} {period}"));
        }
        fn on_hotplug(&self, display: usize, connected: bool) {
            self.events.lock().unwrap().push(format!("hotplug {display} {connected}"));
        }
        fn on_refresh(&self, display: usize) {
            self.events.lock().unwrap().push(format!("refresh {display}"));
        }
        fn on_vsync_period_timing_changed(&self, display: usize, timeline: VsyncPeriodTimeline) {
            self.events
                .lock()
                .unwrap()
                .push(format!("timing {display} {}", timeline.refresh_required));
        }
    }

    fn virtual_display(engine: &Arc<MockEngine>) -> Display {
        let sink = EventSink::new(12);
        let backend = VirtualBackend::new(1280, 720, PixelFormat::Rgba8888);
        Display::new(sink, Backend::Virtual(backend), Arc::new(composer(engine)), false)
    }

    fn fill(display: &Display, zorder: u32, kind: LayerType) -> usize {
        let index = display.get_free_layer().unwrap();
        display
            .with_layer(index, |layer| {
                layer.zorder = zorder;
                layer.orig_type = kind;
                layer.blend_mode = BlendMode::Premultiplied;
                layer.handle = Some(buffer(1280, 720, PixelFormat::Rgba8888));
                layer.source_crop = Rectangle::from_loc_and_size((0, 0), (1280, 720));
                layer.display_frame = Rectangle::from_loc_and_size((0, 0), (1280, 720));
                layer.visible_region = vec![layer.display_frame];
            })
            .unwrap();
        index
    }

    #[test]
    fn layer_slots() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        let claimed: Vec<_> = (0..MAX_LAYERS).map(|_| display.get_free_layer().unwrap()).collect();
        assert_eq!(claimed, (0..MAX_LAYERS).collect::<Vec<_>>());
        assert_eq!(display.get_free_layer(), None);

        display.with_layer(5, |layer| layer.zorder = 3).unwrap();
        display.release_layer(5).unwrap();
        assert!(matches!(display.with_layer(5, |_| ()), Err(Error::InvalidLayer(5))));
        assert!(matches!(display.release_layer(MAX_LAYERS), Err(Error::InvalidLayer(_))));
        assert_eq!(display.get_free_layer(), Some(5));
        assert_eq!(display.with_layer(5, |layer| layer.zorder).unwrap(), 0);
    }

    #[test]
    fn changed_types_and_release_fences() {
        crate::utils::init_test_logging();
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        let client = fill(&display, 0, LayerType::Client);
        let device = fill(&display, 1, LayerType::Device);
        let (fence, _writer) = pipe_fence();
        display.with_layer(device, |layer| layer.release_fence = Some(fence)).unwrap();

        assert!(!display.verify_layers());
        assert_eq!(display.changed_types(), vec![(device, LayerType::Client)]);
        let fences = display.release_fences();
        assert_eq!(fences.len(), 1);
        assert_eq!(fences[0].0, device);
        assert!(display.release_fences().is_empty());
        let _ = client;
    }

    #[test]
    fn skip_layer_flag() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        fill(&display, 0, LayerType::Device);
        assert!(display.verify_layers());
        display.set_skip_layer(true);
        assert!(!display.verify_layers());
        display.set_skip_layer(false);
        assert!(display.verify_layers());

        display.invalidate_layers();
        assert!(display.verdict().layers.is_empty());
        assert_eq!(display.get_free_layer(), Some(0));
    }

    #[test]
    fn compose_into_client_target() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        fill(&display, 0, LayerType::Device);
        fill(&display, 1, LayerType::Device);
        assert!(display.verify_layers());
        engine.take();

        assert!(matches!(display.compose_layers(), Err(Error::NoRenderTarget)));

        let target = buffer(1280, 720, PixelFormat::Rgba8888);
        let (fence, mut writer) = pipe_fence();
        writer.write_all(b"x").unwrap();
        display.set_render_target(Some(target.clone()), Some(fence));
        display.compose_layers().unwrap();
        let ops = engine.take();
        assert_eq!(ops.iter().filter(|op| matches!(op, Op::Blit { .. })).count(), 2);
        assert_eq!(ops.last(), Some(&Op::Finish));

        display.update_screen().unwrap();
        display.with_backend(|backend| match backend {
            Backend::Virtual(virt) => assert_eq!(virt.output().map(|b| b.id()), Some(target.id())),
            _ => unreachable!(),
        });
    }

    #[test]
    fn sideband_layers_are_not_blitted() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        fill(&display, 0, LayerType::Device);
        fill(&display, 1, LayerType::Sideband);
        assert!(display.verify_layers());
        assert_eq!(display.verdict().layers.len(), 2);
        display.set_render_target(Some(buffer(1280, 720, PixelFormat::Rgba8888)), None);
        engine.take();
        display.compose_layers().unwrap();
        assert_eq!(
            engine.take().iter().filter(|op| matches!(op, Op::Blit { .. })).count(),
            1
        );
    }

    #[test]
    fn powered_off_display_does_not_present() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        display.set_render_target(Some(buffer(1280, 720, PixelFormat::Rgba8888)), None);
        display.set_power_mode(PowerMode::Off).unwrap();
        assert!(matches!(display.update_screen(), Err(Error::PoweredOff)));
        display.set_power_mode(PowerMode::On).unwrap();
        display.update_screen().unwrap();
    }

    #[test]
    fn config_table() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        assert_eq!(display.config_count(), 1);
        assert_eq!(display.active_config_index(), Some(0));

        assert_eq!(display.set_config(1280, 720, PixelFormat::Rgba8888), 0);
        assert_eq!(display.set_config(640, 480, PixelFormat::Rgba8888), 1);
        assert_eq!(display.active_config().map(|c| c.width), Some(640));
        assert_eq!(display.find_config(1280, 720, PixelFormat::Rgba8888), Some(0));
        assert_eq!(display.find_config(1280, 720, PixelFormat::Rgb565), None);

        assert!(matches!(display.set_active_config(7), Err(Error::BadConfig(7))));
        assert_eq!(display.active_config_index(), Some(1));
        display.set_active_config(0).unwrap();
        assert_eq!(display.active_config_index(), Some(0));

        display.clear_configs();
        assert_eq!(display.config_count(), 0);
        assert_eq!(display.active_config(), None);
    }

    #[test]
    fn config_change_constraints() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        let half_rate = DisplayConfig::new(1280, 720, PixelFormat::Rgba8888).with_refresh(30.0);
        let fast = display.add_config(half_rate);
        let other = display.add_config(DisplayConfig::new(1920, 1080, PixelFormat::Rgba8888).with_group(1));

        let now = monotonic_nanos();
        let timeline = display.set_active_config_with_constraints(0, now, true).unwrap();
        assert!(!timeline.refresh_required);

        assert!(matches!(
            display.set_active_config_with_constraints(other, now, true),
            Err(Error::SeamlessNotAllowed)
        ));
        let timeline = display.set_active_config_with_constraints(fast, now, true).unwrap();
        assert!(timeline.applied_time >= now);
        assert_eq!(display.active_config_index(), Some(fast));
        assert_eq!(display.events().vsync_period(), 33_333_333);

        display.set_active_config_with_constraints(other, now, false).unwrap();
        assert_eq!(display.active_config_index(), Some(other));
    }

    #[test]
    fn hardware_fed_layer() {
        let engine = Arc::new(MockEngine::default());
        let display = virtual_display(&engine);
        let recorder = Arc::new(Recorder::default());
        display.set_listener(Some(recorder.clone()));
        display.set_render_target(Some(buffer(1280, 720, PixelFormat::Rgba8888)), None);

        let slot = Arc::new(BufferSlot::new(3));
        let frames: Vec<_> = (0..3).map(|_| buffer(640, 360, PixelFormat::Nv12)).collect();

        let index = slot.free_slot();
        display.present_hw_layer(&slot, index, &frames[index], false).unwrap();
        assert_eq!(recorder.take(), vec!["refresh 12".to_owned()]);
        let layer = display.layer_by_buffer_slot(&slot).unwrap();
        let (zorder, frame) = display
            .with_layer(layer, |l| (l.zorder, l.display_frame))
            .unwrap();
        assert_eq!(zorder, HW_LAYER_ZORDER);
        assert_eq!(frame, Rectangle::from_loc_and_size((0, 0), (1280, 720)));

        let index = slot.free_slot();
        engine.take();
        display.present_hw_layer(&slot, index, &frames[index], true).unwrap();
        assert!(recorder.take().is_empty());
        assert_eq!(display.layer_by_buffer_slot(&slot), Some(layer));
        let shown = display.with_layer(layer, |l| l.handle.as_ref().map(|h| h.id())).unwrap();
        assert_eq!(shown, Some(frames[0].id()));
        assert!(engine.take().iter().any(|op| matches!(op, Op::Blit { .. })));
    }

    #[test]
    fn disabled_engine_leaves_composition_to_client() {
        let engine = Arc::new(MockEngine::default());
        let sink = EventSink::new(11);
        let composer = Composer::new(
            Some(engine.clone() as Arc<_>),
            None,
            ComposerPolicy {
                disabled: true,
                force_2d: false,
            },
        );
        let display = Display::new(
            sink,
            Backend::Virtual(VirtualBackend::new(640, 480, PixelFormat::Rgba8888)),
            Arc::new(composer),
            false,
        );
        fill(&display, 0, LayerType::Device);
        assert!(!display.verify_layers());
        assert_eq!(display.changed_types(), vec![(0, LayerType::Client)]);
    }
}
