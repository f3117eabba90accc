//! The ioctl surface of a KMS device
//!
//! [`KmsDevice`] is everything the KMS backend needs from the kernel, expressed with raw
//! object ids. [`DrmDeviceFd`] implements it on top of the `drm` crate.

use std::{
    fmt, io,
    os::unix::io::{BorrowedFd, OwnedFd},
    path::PathBuf,
};

use super::atomic::{AtomicRequest, CommitFlags};
use crate::backend::allocator::{Fourcc, Modifier};

/// `DRM_MODE_TYPE_PREFERRED`
pub const MODE_TYPE_PREFERRED: u32 = 1 << 3;

/// Kind of a mode object, for property lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A connector
    Connector,
    /// A CRTC
    Crtc,
    /// A plane
    Plane,
}

/// Physical interface of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorInterface {
    /// LVDS panel
    Lvds,
    /// DVI-I, DVI-D or DVI-A
    Dvi,
    /// HDMI type A
    HdmiA,
    /// HDMI type B
    HdmiB,
    /// TV out
    Tv,
    /// DisplayPort
    DisplayPort,
    /// MIPI DSI panel
    Dsi,
    /// Anything else
    Other,
}

/// A display mode, laid out as `drm_mode_modeinfo`
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    /// Refresh rate in Hz
    pub vrefresh: u32,
    pub flags: u32,
    /// `DRM_MODE_TYPE_*` bits
    pub type_: u32,
    /// NUL padded mode name
    pub name: [u8; 32],
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}{}",
            self.hdisplay,
            self.vdisplay,
            self.vrefresh,
            if self.is_preferred() { " (preferred)" } else { "" }
        )
    }
}

impl ModeInfo {
    /// Size of `drm_mode_modeinfo`
    pub const SIZE: usize = 68;

    /// A mode with the given timing, for tests and synthesized modes
    pub fn new(hdisplay: u16, vdisplay: u16, vrefresh: u32) -> ModeInfo {
        let mut mode = ModeInfo {
            hdisplay,
            vdisplay,
            vrefresh,
            ..Default::default()
        };
        let name = format!("{hdisplay}x{vdisplay}");
        let len = name.len().min(mode.name.len() - 1);
        mode.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        mode
    }

    /// Mark as the mode preferred by the sink
    pub fn preferred(mut self) -> ModeInfo {
        self.type_ |= MODE_TYPE_PREFERRED;
        self
    }

    /// Whether the sink prefers this mode
    pub fn is_preferred(&self) -> bool {
        self.type_ & MODE_TYPE_PREFERRED != 0
    }

    /// Refresh rate in Hz, computed from the timing if not reported
    pub fn refresh_rate(&self) -> f32 {
        if self.vrefresh != 0 {
            return self.vrefresh as f32;
        }
        let total = self.htotal as u64 * self.vtotal as u64;
        if total == 0 {
            return 0.0;
        }
        (self.clock as u64 * 1000) as f32 / total as f32
    }

    /// Contents of a `MODE_ID` property blob
    pub fn to_bytes(&self) -> [u8; ModeInfo::SIZE] {
        let mut out = [0u8; ModeInfo::SIZE];
        out[0..4].copy_from_slice(&self.clock.to_ne_bytes());
        let timings = [
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.hskew,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vscan,
        ];
        for (i, value) in timings.iter().enumerate() {
            out[4 + i * 2..6 + i * 2].copy_from_slice(&value.to_ne_bytes());
        }
        out[24..28].copy_from_slice(&self.vrefresh.to_ne_bytes());
        out[28..32].copy_from_slice(&self.flags.to_ne_bytes());
        out[32..36].copy_from_slice(&self.type_.to_ne_bytes());
        out[36..68].copy_from_slice(&self.name);
        out
    }
}

/// State of a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Object id
    pub id: u32,
    /// Physical interface
    pub interface: ConnectorInterface,
    /// Whether a sink is attached
    pub connected: bool,
    /// Modes the sink supports
    pub modes: Vec<ModeInfo>,
    /// Encoder ids able to drive the connector
    pub encoders: Vec<u32>,
    /// Physical size in millimeters, 0 if unknown
    pub mm_size: (u32, u32),
}

impl ConnectorInfo {
    /// Whether the connector can be driven right now
    pub fn is_usable(&self) -> bool {
        self.connected && !self.modes.is_empty() && !self.encoders.is_empty()
    }
}

/// A plane and the CRTCs it can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Object id
    pub id: u32,
    /// Bit `n` is set if the plane works with the CRTC of index `n`
    pub possible_crtcs: u32,
}

/// A property of a mode object and its current value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property id
    pub id: u32,
    /// Property name
    pub name: String,
    /// Raw value
    pub value: u64,
}

/// Parameters of a framebuffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Size in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub fourcc: Fourcc,
    /// Layout modifier, `None` for implicit linear
    pub modifier: Option<Modifier>,
    /// GEM handle per plane, 0 for unused planes
    pub handles: [u32; 4],
    /// Line length in bytes per plane
    pub pitches: [u32; 4],
    /// Offset in bytes per plane
    pub offsets: [u32; 4],
}

/// The ioctls the KMS backend issues
pub trait KmsDevice: fmt::Debug + Send + Sync {
    /// Path of the device node
    fn path(&self) -> Option<PathBuf>;

    /// Enable universal planes and atomic mode setting
    fn enable_atomic(&self) -> io::Result<()>;

    /// Ids of all connectors
    fn connectors(&self) -> io::Result<Vec<u32>>;

    /// Ids of all CRTCs, in index order
    fn crtcs(&self) -> io::Result<Vec<u32>>;

    /// State of a connector, probing the sink
    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;

    /// Bit mask of the CRTC indices `encoder` can drive
    fn encoder_possible_crtcs(&self, encoder: u32) -> io::Result<u32>;

    /// All planes
    fn planes(&self) -> io::Result<Vec<PlaneInfo>>;

    /// Properties of a mode object
    fn properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<PropertyInfo>>;

    /// Create a property blob, returns its id
    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;

    /// Destroy a property blob
    fn destroy_blob(&self, id: u32) -> io::Result<()>;

    /// Import a dma-buf, returns the GEM handle
    fn import_buffer(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;

    /// Register a framebuffer object, returns its id
    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32>;

    /// Remove a framebuffer object
    fn remove_framebuffer(&self, id: u32) -> io::Result<()>;

    /// Close a GEM handle
    fn close_buffer(&self, handle: u32) -> io::Result<()>;

    /// Apply an atomic request, returns the out fence if one was requested
    fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<Option<OwnedFd>>;

    /// Block until the next vertical blank of the CRTC with index `pipe`
    ///
    /// Returns its monotonic timestamp in ns.
    fn wait_vblank(&self, pipe: u32) -> io::Result<i64>;
}

#[cfg(feature = "backend_drm")]
pub use self::fd::DrmDeviceFd;

#[cfg(feature = "backend_drm")]
mod fd {
    use std::{
        io,
        os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        path::PathBuf,
        sync::Arc,
        time::Duration,
    };

    use drm::{
        buffer::{self, PlanarBuffer},
        control::{
            atomic::AtomicModeReq, connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags,
            Device as ControlDevice, FbCmd2Flags, RawResourceHandle, ResourceHandle, ResourceHandles,
        },
        ClientCapability, Device as BasicDevice, VblankWaitFlags, VblankWaitTarget,
    };
    use tracing::{info, warn};

    use super::*;
    use crate::utils::{monotonic_nanos, DevPath, DeviceFd};

    #[derive(Debug)]
    struct InternalDrmDeviceFd {
        fd: DeviceFd,
        privileged: bool,
    }

    impl Drop for InternalDrmDeviceFd {
        fn drop(&mut self) {
            info!("Dropping device: {:?}", self.fd.dev_path());
            if self.privileged {
                if let Err(err) = self.release_master_lock() {
                    tracing::error!("Failed to drop drm master state. Error: {}", err);
                }
            }
        }
    }

    impl AsFd for InternalDrmDeviceFd {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.fd.as_fd()
        }
    }
    impl BasicDevice for InternalDrmDeviceFd {}
    impl ControlDevice for InternalDrmDeviceFd {}

    /// Ref-counted file descriptor of an open drm device
    #[derive(Debug, Clone)]
    pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

    impl AsFd for DrmDeviceFd {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.0.fd.as_fd()
        }
    }

    impl AsRawFd for DrmDeviceFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.fd.as_raw_fd()
        }
    }

    impl BasicDevice for DrmDeviceFd {}
    impl ControlDevice for DrmDeviceFd {}

    impl DrmDeviceFd {
        /// Create a new `DrmDeviceFd`.
        ///
        /// Tries to acquire the master lock of the device and releases it again on drop.
        /// Clone the `DrmDeviceFd` instead of creating several from the same `DeviceFd`.
        pub fn new(fd: DeviceFd) -> DrmDeviceFd {
            let mut dev = InternalDrmDeviceFd { fd, privileged: false };

            // Newer kernels grant mode setting without master if nobody else holds it.
            if dev.acquire_master_lock().is_err() {
                warn!("Unable to become drm master, assuming unprivileged mode");
            } else {
                dev.privileged = true;
            }

            DrmDeviceFd(Arc::new(dev))
        }

        /// Returns the underlying `DeviceFd`
        pub fn device_fd(&self) -> DeviceFd {
            self.0.fd.clone()
        }

        fn resources(&self) -> io::Result<ResourceHandles> {
            self.resource_handles()
        }

        fn crtc_mask(&self, filter: drm::control::CrtcListFilter) -> io::Result<u32> {
            let resources = self.resources()?;
            let allowed = resources.filter_crtcs(filter);
            Ok(resources
                .crtcs()
                .iter()
                .enumerate()
                .filter(|(_, crtc)| allowed.contains(crtc))
                .fold(0, |mask, (index, _)| mask | 1 << index))
        }

        fn property_list<H: ResourceHandle>(&self, handle: H) -> io::Result<Vec<PropertyInfo>> {
            let props = self.get_properties(handle)?;
            let (ids, values) = props.as_props_and_values();
            Ok(ids
                .iter()
                .zip(values.iter())
                .filter_map(|(&id, &value)| {
                    let info = self.get_property(id).ok()?;
                    Some(PropertyInfo {
                        id: id.into(),
                        name: info.name().to_string_lossy().into_owned(),
                        value,
                    })
                })
                .collect())
        }
    }

    fn handle<H: From<RawResourceHandle>>(id: u32) -> io::Result<H> {
        drm::control::from_u32(id).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn interface(interface: connector::Interface) -> ConnectorInterface {
        match interface {
            connector::Interface::LVDS => ConnectorInterface::Lvds,
            connector::Interface::DVII | connector::Interface::DVID | connector::Interface::DVIA => {
                ConnectorInterface::Dvi
            }
            connector::Interface::HDMIA => ConnectorInterface::HdmiA,
            connector::Interface::HDMIB => ConnectorInterface::HdmiB,
            connector::Interface::TV => ConnectorInterface::Tv,
            connector::Interface::DisplayPort | connector::Interface::EmbeddedDisplayPort => {
                ConnectorInterface::DisplayPort
            }
            connector::Interface::DSI => ConnectorInterface::Dsi,
            _ => ConnectorInterface::Other,
        }
    }

    fn mode_info(mode: &drm::control::Mode) -> ModeInfo {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, htotal) = mode.hsync();
        let (vsync_start, vsync_end, vtotal) = mode.vsync();
        let mut info = ModeInfo {
            clock: mode.clock(),
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: mode.hskew(),
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: mode.vscan(),
            vrefresh: mode.vrefresh(),
            flags: mode.flags().bits(),
            type_: mode.mode_type().bits(),
            name: [0; 32],
        };
        let name = mode.name().to_bytes();
        let len = name.len().min(info.name.len() - 1);
        info.name[..len].copy_from_slice(&name[..len]);
        info
    }

    struct Planar<'a>(&'a FramebufferDesc);

    impl PlanarBuffer for Planar<'_> {
        fn size(&self) -> (u32, u32) {
            self.0.size
        }
        fn format(&self) -> Fourcc {
            self.0.fourcc
        }
        fn modifier(&self) -> Option<Modifier> {
            self.0.modifier
        }
        fn pitches(&self) -> [u32; 4] {
            self.0.pitches
        }
        fn handles(&self) -> [Option<buffer::Handle>; 4] {
            self.0.handles.map(drm::control::from_u32)
        }
        fn offsets(&self) -> [u32; 4] {
            self.0.offsets
        }
    }

    impl KmsDevice for DrmDeviceFd {
        fn path(&self) -> Option<PathBuf> {
            self.dev_path()
        }

        fn enable_atomic(&self) -> io::Result<()> {
            self.set_client_capability(ClientCapability::UniversalPlanes, true)?;
            self.set_client_capability(ClientCapability::Atomic, true)
        }

        fn connectors(&self) -> io::Result<Vec<u32>> {
            Ok(self.resources()?.connectors().iter().map(|&c| c.into()).collect())
        }

        fn crtcs(&self) -> io::Result<Vec<u32>> {
            Ok(self.resources()?.crtcs().iter().map(|&c| c.into()).collect())
        }

        fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
            let info = self.get_connector(handle::<connector::Handle>(id)?, true)?;
            Ok(ConnectorInfo {
                id,
                interface: interface(info.interface()),
                connected: info.state() == connector::State::Connected,
                modes: info.modes().iter().map(mode_info).collect(),
                encoders: info.encoders().iter().map(|&e| e.into()).collect(),
                mm_size: info.size().unwrap_or((0, 0)),
            })
        }

        fn encoder_possible_crtcs(&self, encoder: u32) -> io::Result<u32> {
            let info = self.get_encoder(handle::<encoder::Handle>(encoder)?)?;
            self.crtc_mask(info.possible_crtcs())
        }

        fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
            self.plane_handles()?
                .into_iter()
                .map(|plane| {
                    let info = self.get_plane(plane)?;
                    Ok(PlaneInfo {
                        id: plane.into(),
                        possible_crtcs: self.crtc_mask(info.possible_crtcs())?,
                    })
                })
                .collect()
        }

        fn properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<PropertyInfo>> {
            match kind {
                ObjectKind::Connector => self.property_list(handle::<connector::Handle>(id)?),
                ObjectKind::Crtc => self.property_list(handle::<crtc::Handle>(id)?),
                ObjectKind::Plane => self.property_list(handle::<plane::Handle>(id)?),
            }
        }

        fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
            let mut data = data.to_vec();
            let blob = drm_ffi::mode::create_property_blob(self.as_fd(), &mut data)?;
            Ok(blob.blob_id)
        }

        fn destroy_blob(&self, id: u32) -> io::Result<()> {
            self.destroy_property_blob(id as u64)
        }

        fn import_buffer(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
            Ok(self.prime_fd_to_buffer(fd)?.into())
        }

        fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32> {
            let flags = if desc.modifier.is_some() {
                FbCmd2Flags::MODIFIERS
            } else {
                FbCmd2Flags::empty()
            };
            Ok(self.add_planar_framebuffer(&Planar(desc), flags)?.into())
        }

        fn remove_framebuffer(&self, id: u32) -> io::Result<()> {
            self.destroy_framebuffer(handle::<framebuffer::Handle>(id)?)
        }

        fn close_buffer(&self, id: u32) -> io::Result<()> {
            ControlDevice::close_buffer(self, handle::<buffer::Handle>(id)?)
        }

        fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<Option<OwnedFd>> {
            let mut req = AtomicModeReq::new();
            for &(object, prop, value) in request.properties() {
                req.add_property(
                    handle::<crtc::Handle>(object)?,
                    handle::<property::Handle>(prop)?,
                    property::Value::UnsignedRange(value),
                );
            }
            // the kernel writes the fence fd through this pointer during the ioctl
            let mut out_fence: i32 = -1;
            if let Some((crtc, prop)) = request.out_fence() {
                req.add_property(
                    handle::<crtc::Handle>(crtc)?,
                    handle::<property::Handle>(prop)?,
                    property::Value::UnsignedRange(&mut out_fence as *mut i32 as u64),
                );
            }
            self.atomic_commit(AtomicCommitFlags::from_bits_truncate(flags.bits()), req)?;
            // SAFETY: a non negative value is a fresh fd owned by us
            Ok((out_fence >= 0).then(|| unsafe { OwnedFd::from_raw_fd(out_fence) }))
        }

        fn wait_vblank(&self, pipe: u32) -> io::Result<i64> {
            let reply = BasicDevice::wait_vblank(
                self,
                VblankWaitTarget::Relative(1),
                VblankWaitFlags::empty(),
                pipe,
                0,
            )?;
            Ok(reply
                .time()
                .map(|time: Duration| time.as_nanos() as i64)
                .unwrap_or_else(monotonic_nanos))
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use super::*;

    /// Scripted in-memory KMS device
    #[derive(Debug, Default)]
    pub struct MockKmsDevice {
        pub connectors: Vec<ConnectorInfo>,
        pub crtcs: Vec<u32>,
        pub encoders: HashMap<u32, u32>,
        pub planes: Vec<PlaneInfo>,
        pub properties: HashMap<(ObjectKind, u32), Vec<PropertyInfo>>,
        results: Mutex<VecDeque<io::Result<()>>>,
        commits: Mutex<Vec<(AtomicRequest, CommitFlags)>>,
        blobs: Mutex<Vec<(u32, Vec<u8>)>>,
        destroyed_blobs: Mutex<Vec<u32>>,
        framebuffers: Mutex<Vec<(u32, FramebufferDesc)>>,
        removed: Mutex<Vec<u32>>,
        unplugged: Mutex<Vec<u32>>,
        next_id: Mutex<u32>,
    }

    impl MockKmsDevice {
        /// One HDMI connector driven by the second CRTC, a primary and an overlay plane
        pub fn hdmi(modes: Vec<ModeInfo>) -> MockKmsDevice {
            let mut device = MockKmsDevice {
                connectors: vec![ConnectorInfo {
                    id: 50,
                    interface: ConnectorInterface::HdmiA,
                    connected: true,
                    modes,
                    encoders: vec![60],
                    mm_size: (520, 290),
                }],
                crtcs: vec![30, 31],
                encoders: HashMap::from([(60, 0b10)]),
                planes: vec![
                    PlaneInfo {
                        id: 39,
                        possible_crtcs: 0b01,
                    },
                    PlaneInfo {
                        id: 40,
                        possible_crtcs: 0b10,
                    },
                    PlaneInfo {
                        id: 41,
                        possible_crtcs: 0b11,
                    },
                ],
                ..Default::default()
            };
            let props = |names: &[&str], first: u32| {
                names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| PropertyInfo {
                        id: first + i as u32,
                        name: name.to_string(),
                        value: 0,
                    })
                    .collect::<Vec<_>>()
            };
            device.properties.insert(
                (ObjectKind::Connector, 50),
                props(&["CRTC_ID", "DPMS", "HDR_OUTPUT_METADATA", "Content Protection"], 1),
            );
            device
                .properties
                .insert((ObjectKind::Crtc, 31), props(&["MODE_ID", "ACTIVE", "OUT_FENCE_PTR"], 10));
            let plane = [
                "type",
                "FB_ID",
                "CRTC_ID",
                "CRTC_X",
                "CRTC_Y",
                "CRTC_W",
                "CRTC_H",
                "SRC_X",
                "SRC_Y",
                "SRC_W",
                "SRC_H",
                "IN_FENCE_FD",
                "dtrc_table_ofs",
            ];
            for (id, kind) in [(39, 1), (40, 1), (41, 0)] {
                let mut list = props(&plane, 100 + id * 20);
                list[0].value = kind;
                device.properties.insert((ObjectKind::Plane, id), list);
            }
            device
        }

        /// Results of the next commits, later commits succeed
        pub fn script(&self, results: impl IntoIterator<Item = io::Result<()>>) {
            self.results.lock().unwrap().extend(results);
        }

        pub fn unplug(&self, connector: u32) {
            self.unplugged.lock().unwrap().push(connector);
        }

        pub fn commits(&self) -> Vec<(AtomicRequest, CommitFlags)> {
            self.commits.lock().unwrap().clone()
        }

        pub fn last_commit(&self) -> Option<AtomicRequest> {
            self.commits.lock().unwrap().last().map(|(r, _)| r.clone())
        }

        pub fn blobs(&self) -> Vec<(u32, Vec<u8>)> {
            self.blobs.lock().unwrap().clone()
        }

        pub fn destroyed_blobs(&self) -> Vec<u32> {
            self.destroyed_blobs.lock().unwrap().clone()
        }

        pub fn framebuffers(&self) -> Vec<(u32, FramebufferDesc)> {
            self.framebuffers.lock().unwrap().clone()
        }

        pub fn removed_framebuffers(&self) -> Vec<u32> {
            self.removed.lock().unwrap().clone()
        }

        fn next_id(&self) -> u32 {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            1000 + *id
        }
    }

    impl KmsDevice for MockKmsDevice {
        fn path(&self) -> Option<PathBuf> {
            Some("/dev/dri/card-mock".into())
        }

        fn enable_atomic(&self) -> io::Result<()> {
            Ok(())
        }

        fn connectors(&self) -> io::Result<Vec<u32>> {
            Ok(self.connectors.iter().map(|c| c.id).collect())
        }

        fn crtcs(&self) -> io::Result<Vec<u32>> {
            Ok(self.crtcs.clone())
        }

        fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
            let mut info = self
                .connectors
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            if self.unplugged.lock().unwrap().contains(&id) {
                info.connected = false;
            }
            Ok(info)
        }

        fn encoder_possible_crtcs(&self, encoder: u32) -> io::Result<u32> {
            self.encoders
                .get(&encoder)
                .copied()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
        }

        fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
            Ok(self.planes.clone())
        }

        fn properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<PropertyInfo>> {
            Ok(self.properties.get(&(kind, id)).cloned().unwrap_or_default())
        }

        fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
            let id = self.next_id();
            self.blobs.lock().unwrap().push((id, data.to_vec()));
            Ok(id)
        }

        fn destroy_blob(&self, id: u32) -> io::Result<()> {
            self.destroyed_blobs.lock().unwrap().push(id);
            Ok(())
        }

        fn import_buffer(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
            Ok(self.next_id())
        }

        fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32> {
            let id = self.next_id();
            self.framebuffers.lock().unwrap().push((id, *desc));
            Ok(id)
        }

        fn remove_framebuffer(&self, id: u32) -> io::Result<()> {
            self.removed.lock().unwrap().push(id);
            Ok(())
        }

        fn close_buffer(&self, _handle: u32) -> io::Result<()> {
            Ok(())
        }

        fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<Option<OwnedFd>> {
            self.commits.lock().unwrap().push((request.clone(), flags));
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(())).map(|()| None)
        }

        fn wait_vblank(&self, _pipe: u32) -> io::Result<i64> {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    #[test]
    fn mode_blob_layout() {
        let mut mode = ModeInfo::new(1920, 1080, 60).preferred();
        mode.clock = 148_500;
        mode.htotal = 2200;
        let bytes = mode.to_bytes();
        assert_eq!(&bytes[0..4], &148_500u32.to_ne_bytes());
        assert_eq!(&bytes[4..6], &1920u16.to_ne_bytes());
        assert_eq!(&bytes[10..12], &2200u16.to_ne_bytes());
        assert_eq!(&bytes[14..16], &1080u16.to_ne_bytes());
        assert_eq!(&bytes[24..28], &60u32.to_ne_bytes());
        assert_eq!(&bytes[32..36], &MODE_TYPE_PREFERRED.to_ne_bytes());
        assert_eq!(&bytes[36..45], b"1920x1080");
        assert_eq!(std::mem::size_of::<ModeInfo>(), ModeInfo::SIZE);
    }

    #[test]
    fn refresh_from_timing() {
        let mut mode = ModeInfo::new(1920, 1080, 0);
        mode.clock = 148_500;
        mode.htotal = 2200;
        mode.vtotal = 1125;
        assert!((mode.refresh_rate() - 60.0).abs() < 0.01);
    }
}
