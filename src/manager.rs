//! Display enumeration and ownership
//!
//! The [`DisplayManager`] finds the outputs of the system, wraps each of them in a
//! [`Display`] and hands them out by id. Physical displays take the ids
//! `0..MAX_PHYSICAL_DISPLAY`, the first connected one becomes the primary display `0`.
//! Virtual displays are created on demand and take the ids from `MAX_PHYSICAL_DISPLAY`.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use tracing::{debug, error, info, info_span, warn};

#[cfg(feature = "backend_udev")]
use crate::backend::udev::{HotplugEvent, HotplugMonitor};
use crate::{
    backend::{
        allocator::PixelFormat,
        drm::{self, KmsBackend, KmsDevice, KmsOptions},
        fbdev::{self, FbBackend, FbDeviceFd, FbOptions},
    },
    context::{BackendKind, ServiceContext},
    display::{Backend, Display, EventListener, EventSink, VirtualBackend},
    utils::read_sysfs,
};

/// Number of ids reserved for physical displays
pub const MAX_PHYSICAL_DISPLAY: usize = 10;

/// Number of virtual display slots
pub const MAX_VIRTUAL_DISPLAY: usize = 16;

/// Framebuffer devices probed
const MAX_FB_DEVICES: u32 = 10;

/// Errors of the display enumeration
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable output was found
    #[error("No display found")]
    NoDisplay,
    /// All physical display ids are taken
    #[error("Too many physical displays")]
    TooManyDisplays,
    /// Opening a KMS display failed
    #[error(transparent)]
    Drm(#[from] drm::Error),
    /// Opening a framebuffer display failed
    #[error(transparent)]
    Fbdev(#[from] fbdev::Error),
    /// Device scanning failed
    #[error("Failed to scan for devices")]
    Io(#[from] io::Error),
}

/// Owner of all displays of the process
pub struct DisplayManager {
    context: ServiceContext,
    sysfs_root: PathBuf,
    physical: RwLock<Vec<Arc<Display>>>,
    virtuals: Mutex<Vec<Option<Arc<Display>>>>,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
    #[cfg(feature = "backend_udev")]
    hotplug: Mutex<Option<HotplugMonitor>>,
    span: tracing::Span,
}

impl std::fmt::Debug for DisplayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayManager")
            .field("context", &self.context)
            .field("sysfs_root", &self.sysfs_root)
            .field("physical", &self.physical)
            .field("virtuals", &self.virtuals)
            .finish_non_exhaustive()
    }
}

impl DisplayManager {
    /// A manager without displays
    pub fn new(context: ServiceContext) -> DisplayManager {
        DisplayManager {
            context,
            sysfs_root: PathBuf::from(fbdev::GRAPHICS_SYSFS_ROOT),
            physical: RwLock::new(Vec::new()),
            virtuals: Mutex::new(vec![None; MAX_VIRTUAL_DISPLAY]),
            listener: RwLock::new(None),
            #[cfg(feature = "backend_udev")]
            hotplug: Mutex::new(None),
            span: info_span!("display_manager"),
        }
    }

    /// Use another sysfs directory for the framebuffer attributes
    pub fn with_sysfs_root(mut self, root: impl AsRef<Path>) -> DisplayManager {
        self.sysfs_root = root.as_ref().to_path_buf();
        self
    }

    /// The services shared by the displays
    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    /// Open the outputs of the backend chosen at boot
    ///
    /// Returns the number of physical displays.
    pub fn enumerate(&self) -> Result<usize, Error> {
        let _guard = self.span.enter();
        match self.context.boot_config().backend {
            BackendKind::Fb => self.enumerate_fb()?,
            BackendKind::Drm => self.enumerate_drm()?,
        }
        let count = self.physical.read().unwrap().len();
        if count == 0 {
            error!("no display found");
            return Err(Error::NoDisplay);
        }
        info!(count, "displays enumerated");
        Ok(count)
    }

    fn enumerate_fb(&self) -> Result<(), Error> {
        let mut candidates = Vec::new();
        for index in 0..MAX_FB_DEVICES {
            let sysfs = self.sysfs_root.join(format!("fb{index}"));
            if !sysfs.exists() {
                continue;
            }
            // overlay framebuffers share the output of their base framebuffer
            if read_sysfs(sysfs.join("name")).map_or(false, |name| name.contains("FG")) {
                debug!(index, "skipping overlay framebuffer");
                continue;
            }
            let kind = fbdev::read_display_type(&sysfs);
            candidates.push((index, fbdev::read_connection(&sysfs, kind)));
        }
        // the first connected output is primary
        candidates.sort_by_key(|&(_, connected)| !connected);

        let boot = self.context.boot_config();
        let options = FbOptions {
            sysfs_root: self.sysfs_root.clone(),
            fake_vsync: boot.fake_vsync,
            limitations: boot.limitations(),
        };
        for (index, _) in candidates {
            let device = match FbDeviceFd::open(index) {
                Ok(device) => device,
                Err(err) => {
                    warn!(index, %err, "failed to open framebuffer");
                    continue;
                }
            };
            let allocator = self.context.allocator().cloned();
            let result = self.add_physical_display(|sink| {
                FbBackend::open(Box::new(device), index, sink, allocator, &options).map(Backend::Fb)
            });
            if let Err(err) = result {
                warn!(index, %err, "failed to set up framebuffer");
            }
        }
        Ok(())
    }

    #[cfg(feature = "backend_drm")]
    fn enumerate_drm(&self) -> Result<(), Error> {
        for path in drm_cards()? {
            let device: Arc<dyn KmsDevice> = match drm::open_device(&path) {
                Ok(device) => Arc::new(device),
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to open card");
                    continue;
                }
            };
            if let Err(err) = self.add_kms_device(device) {
                warn!(path = %path.display(), %err, "failed to set up card");
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "backend_drm"))]
    fn enumerate_drm(&self) -> Result<(), Error> {
        warn!("built without KMS support");
        Ok(())
    }

    /// Add a display for every usable connector of `device`
    ///
    /// The boot mode request applies to every connector, the UI resolution override only
    /// to the primary display.
    pub fn add_kms_device(&self, device: Arc<dyn KmsDevice>) -> Result<Vec<usize>, Error> {
        let boot = self.context.boot_config();
        let mut ids = Vec::new();
        for connector in drm::usable_connectors(&*device)? {
            let primary = self.physical.read().unwrap().is_empty();
            let options = KmsOptions {
                mode: boot.display_mode,
                gui: boot.gui_resolution.filter(|_| primary),
                fake_vsync: boot.fake_vsync,
                limitations: boot.limitations(),
                ..Default::default()
            };
            let allocator = self.context.allocator().cloned();
            let device = device.clone();
            let id = self.add_physical_display(|sink| {
                KmsBackend::open(device, connector, sink, allocator, &options).map(Backend::Kms)
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Add a physical display, `open` creates its backend reporting to the given sink
    pub fn add_physical_display<E>(
        &self,
        open: impl FnOnce(Arc<EventSink>) -> Result<Backend, E>,
    ) -> Result<usize, Error>
    where
        Error: From<E>,
    {
        let mut physical = self.physical.write().unwrap();
        let id = physical.len();
        if id >= MAX_PHYSICAL_DISPLAY {
            return Err(Error::TooManyDisplays);
        }
        let sink = EventSink::new(id);
        sink.set_listener(self.listener.read().unwrap().clone());
        let backend = open(sink.clone())?;
        let composer = self.context.composer().clone();
        let display = Display::new(sink, backend, composer, self.secure_overlay());
        physical.push(Arc::new(display));
        Ok(id)
    }

    fn secure_overlay(&self) -> bool {
        self.context.boot_config().secure_overlay
    }

    /// Create a memory backed display
    ///
    /// `None` when all [`MAX_VIRTUAL_DISPLAY`] slots are taken.
    pub fn create_virtual_display(&self, width: u32, height: u32, format: PixelFormat) -> Option<usize> {
        let mut virtuals = self.virtuals.lock().unwrap();
        let Some(slot) = virtuals.iter().position(Option::is_none) else {
            warn!(parent: &self.span, "no free virtual display");
            return None;
        };
        let id = MAX_PHYSICAL_DISPLAY + slot;
        let sink = EventSink::new(id);
        sink.set_listener(self.listener.read().unwrap().clone());
        let backend = Backend::Virtual(VirtualBackend::new(width, height, format));
        let display = Display::new(sink, backend, self.context.composer().clone(), false);
        virtuals[slot] = Some(Arc::new(display));
        info!(parent: &self.span, id, width, height, "virtual display created");
        Some(id)
    }

    /// Free a virtual display, false if `id` names none
    pub fn destroy_virtual_display(&self, id: usize) -> bool {
        let mut virtuals = self.virtuals.lock().unwrap();
        let slot = id.checked_sub(MAX_PHYSICAL_DISPLAY).and_then(|slot| virtuals.get_mut(slot));
        match slot.and_then(Option::take) {
            Some(display) => {
                display.set_listener(None);
                info!(parent: &self.span, id, "virtual display destroyed");
                true
            }
            None => {
                error!(parent: &self.span, id, "invalid virtual display");
                false
            }
        }
    }

    /// Any display by id
    pub fn display(&self, id: usize) -> Option<Arc<Display>> {
        if id < MAX_PHYSICAL_DISPLAY {
            self.physical_display(id)
        } else {
            self.virtual_display(id)
        }
    }

    /// A physical display by id
    pub fn physical_display(&self, id: usize) -> Option<Arc<Display>> {
        let display = self.physical.read().unwrap().get(id).cloned();
        if display.is_none() {
            error!(parent: &self.span, id, "invalid physical display");
        }
        display
    }

    /// A virtual display by id
    pub fn virtual_display(&self, id: usize) -> Option<Arc<Display>> {
        let display = id
            .checked_sub(MAX_PHYSICAL_DISPLAY)
            .and_then(|slot| self.virtuals.lock().unwrap().get(slot).cloned().flatten());
        if display.is_none() {
            error!(parent: &self.span, id, "invalid virtual display");
        }
        display
    }

    /// The primary display
    pub fn primary_display(&self) -> Option<Arc<Display>> {
        self.physical.read().unwrap().first().cloned()
    }

    /// Number of physical displays
    pub fn physical_count(&self) -> usize {
        self.physical.read().unwrap().len()
    }

    /// All displays, physical ones first
    pub fn displays(&self) -> Vec<Arc<Display>> {
        let mut displays = self.physical.read().unwrap().clone();
        displays.extend(self.virtuals.lock().unwrap().iter().flatten().cloned());
        displays
    }

    /// Set the listener of every current and future display
    pub fn set_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        *self.listener.write().unwrap() = listener.clone();
        for display in self.displays() {
            display.set_listener(listener.clone());
        }
    }

    /// Re-read the connection state of every physical display
    ///
    /// Changes are reported through `on_hotplug`. Returns the ids whose state changed.
    pub fn handle_hotplug(&self) -> Vec<usize> {
        let physical = self.physical.read().unwrap().clone();
        physical
            .iter()
            .filter_map(|display| {
                let before = display.is_connected();
                (display.refresh_connection() != before).then(|| display.id())
            })
            .collect()
    }

    /// Watch for device events and refresh the displays on each one
    ///
    /// The monitor stops when the manager is dropped.
    #[cfg(feature = "backend_udev")]
    pub fn start_hotplug_monitor(self: &Arc<Self>) -> io::Result<()> {
        let subsystems: &[&str] = match self.context.boot_config().backend {
            BackendKind::Drm => &["drm"],
            BackendKind::Fb => &["switch", "graphics"],
        };
        let manager = Arc::downgrade(self);
        let monitor = HotplugMonitor::spawn(subsystems, move |event: HotplugEvent| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let changed = manager.handle_hotplug();
            debug!(?event.kind, ?changed, "hotplug handled");
        })?;
        *self.hotplug.lock().unwrap() = Some(monitor);
        Ok(())
    }
}

/// DRM card nodes, in card order
#[cfg(feature = "backend_drm")]
fn drm_cards() -> io::Result<Vec<PathBuf>> {
    #[cfg(feature = "backend_udev")]
    {
        match crate::backend::udev::all_cards("seat0") {
            Ok(cards) if !cards.is_empty() => return Ok(cards),
            Ok(_) => debug!("udev knows no cards, probing /dev/dri"),
            Err(err) => warn!(%err, "udev enumeration failed, probing /dev/dri"),
        }
    }
    Ok((0..MAX_PHYSICAL_DISPLAY)
        .map(|index| PathBuf::from(format!("/dev/dri/card{index}")))
        .filter(|path| path.exists())
        .collect())
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::{
        backend::{
            allocator::test::buffer,
            composer::{engine::test::MockEngine, test::composer},
            drm::{device::test::MockKmsDevice, ModeInfo},
        },
        context::BootConfig,
        display::{test::Recorder, BlendMode, DisplayType, LayerType},
        utils::Rectangle,
    };

    fn manager(boot: BootConfig) -> DisplayManager {
        let engine = Arc::new(MockEngine::default());
        let context = ServiceContext::new(boot, None, Arc::new(composer(&engine)));
        DisplayManager::new(context)
    }

    fn fake_vsync() -> BootConfig {
        BootConfig {
            fake_vsync: true,
            ..Default::default()
        }
    }

    fn hdmi() -> Arc<dyn KmsDevice> {
        Arc::new(MockKmsDevice::hdmi(vec![ModeInfo::new(1920, 1080, 60).preferred()]))
    }

    #[test]
    fn kms_connectors_become_displays() {
        let manager = manager(fake_vsync());
        let ids = manager.add_kms_device(hdmi()).unwrap();
        assert_eq!(ids, vec![0]);
        assert_eq!(manager.physical_count(), 1);

        let primary = manager.primary_display().unwrap();
        assert_eq!(primary.id(), 0);
        assert_eq!(primary.display_type(), DisplayType::Hdmi);
        assert!(manager.display(1).is_none());
    }

    #[test]
    fn virtual_display_slots() {
        let manager = manager(BootConfig::default());
        let ids: Vec<usize> = (0..MAX_VIRTUAL_DISPLAY)
            .map(|_| manager.create_virtual_display(640, 480, PixelFormat::Rgba8888).unwrap())
            .collect();
        assert_eq!(ids.first(), Some(&MAX_PHYSICAL_DISPLAY));
        assert_eq!(ids.last(), Some(&(MAX_PHYSICAL_DISPLAY + MAX_VIRTUAL_DISPLAY - 1)));
        assert!(manager.create_virtual_display(640, 480, PixelFormat::Rgba8888).is_none());

        let display = manager.virtual_display(MAX_PHYSICAL_DISPLAY + 3).unwrap();
        assert_eq!(display.display_type(), DisplayType::Virtual);
        assert_eq!(display.active_config().unwrap().width, 640);

        assert!(manager.destroy_virtual_display(MAX_PHYSICAL_DISPLAY + 3));
        assert!(!manager.destroy_virtual_display(MAX_PHYSICAL_DISPLAY + 3));
        assert!(manager.virtual_display(MAX_PHYSICAL_DISPLAY + 3).is_none());
        assert!(!manager.destroy_virtual_display(2));
        assert_eq!(
            manager.create_virtual_display(320, 240, PixelFormat::Rgb565),
            Some(MAX_PHYSICAL_DISPLAY + 3)
        );
    }

    #[test]
    fn listener_reaches_every_display() {
        let manager = manager(fake_vsync());
        manager.add_kms_device(hdmi()).unwrap();
        let recorder = Arc::new(Recorder::default());
        manager.set_listener(Some(recorder.clone()));
        let id = manager.create_virtual_display(640, 480, PixelFormat::Rgba8888).unwrap();

        manager.primary_display().unwrap().events().refresh();
        manager.display(id).unwrap().events().refresh();
        assert_eq!(recorder.take(), vec!["refresh 0".to_string(), format!("refresh {id}")]);
    }

    #[test]
    fn hotplug_reports_changed_displays() {
        crate::utils::init_test_logging();
        let manager = manager(fake_vsync());
        let device = Arc::new(MockKmsDevice::hdmi(vec![ModeInfo::new(1280, 720, 60)]));
        manager.add_kms_device(device.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        manager.set_listener(Some(recorder.clone()));
        assert!(manager.handle_hotplug().is_empty());

        device.unplug(50);
        assert_eq!(manager.handle_hotplug(), vec![0]);
        assert_eq!(recorder.take(), vec!["hotplug 0 false".to_string()]);
    }

    #[test]
    fn boot_limitations_reach_the_displays() {
        let blended = |manager: &DisplayManager| {
            manager.add_kms_device(hdmi()).unwrap();
            let display = manager.primary_display().unwrap();
            let index = display.get_free_layer().unwrap();
            display
                .with_layer(index, |layer| {
                    layer.orig_type = LayerType::Device;
                    layer.blend_mode = BlendMode::Premultiplied;
                    layer.plane_alpha = 0x80;
                    layer.handle = Some(buffer(1920, 1080, PixelFormat::Rgba8888));
                    layer.display_frame = Rectangle::from_loc_and_size((0, 0), (1920, 1080));
                    layer.visible_region = vec![layer.display_frame];
                })
                .unwrap();
            display.verify_layers()
        };

        assert!(blended(&manager(fake_vsync())));
        let erratum = BootConfig {
            alpha_blend_erratum: true,
            ..fake_vsync()
        };
        assert!(!blended(&manager(erratum)));
    }

    #[test]
    fn framebuffer_overlays_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("fb1")).unwrap();
        fs::write(root.join("fb1/name"), "DISP4 FG\n").unwrap();

        let manager = manager(BootConfig {
            backend: BackendKind::Fb,
            ..fake_vsync()
        })
        .with_sysfs_root(root);
        // no device nodes in the sandbox, only the probing is exercised
        assert!(matches!(manager.enumerate(), Err(Error::NoDisplay)));
    }
}
