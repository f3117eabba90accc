//! DRM/KMS atomic display backend
//!
//! This module drives one connector of a KMS device through the atomic API.
//!
//! ## Structure
//!
//! The kernel side is hidden behind the [`KmsDevice`] trait, which speaks in raw object ids.
//! [`DrmDeviceFd`] implements it on top of the `drm` crate, tests use a scripted in-memory
//! device. Everything above it only ever sees ids and [`AtomicRequest`]s:
//!
//! - property ids are resolved once by name, see the `props` module,
//! - the mode is picked from the connector modes by a [`ModeRequest`],
//! - a [`KmsBackend`] owns the CRTC, the primary plane and at most one overlay plane
//!   of the connector and presents frames with one atomic commit each.
//!
//! ## Frames
//!
//! The first frame after opening the device, after a power cycle or after a config change
//! carries the mode set. Every later frame is a non-blocking commit of the primary plane,
//! the overlay plane if it changed, and the connector properties that changed. A commit
//! hitting a busy kernel is retried by [`commit_with_retry`].
//!
//! Framebuffer objects are created lazily the first time a buffer is scanned out and live
//! as long as the buffer itself.
//!
//! ## Config changes
//!
//! Config changes requested for a later point in time are held back by a per display
//! thread until the first vsync after that time, see [`config_thread`].

pub(crate) mod atomic;
pub(crate) mod backlight;
pub mod config_thread;
pub(crate) mod device;
mod error;
pub mod hdr;
pub(crate) mod mode;
pub(crate) mod props;
mod surface;

pub use self::atomic::{commit_with_retry, to_fixed, AtomicRequest, CommitFlags, MAX_COMMIT_RETRY_COUNT};
pub use self::backlight::{Backlight, BACKLIGHT_ROOT};
#[cfg(feature = "backend_drm")]
pub use self::device::DrmDeviceFd;
pub use self::device::{
    ConnectorInfo, ConnectorInterface, FramebufferDesc, KmsDevice, ModeInfo, ObjectKind, PlaneInfo,
    PropertyInfo,
};
pub use self::error::{AccessError, Error};
pub use self::mode::{select_mode, GuiResolution, ModeRequest, ParseModeError};
pub use self::props::{ConnectorProps, CrtcProps, PlaneProps, PlaneType};
pub use self::surface::{display_type, usable_connectors, KmsBackend, KmsOptions, MAX_FRAMEBUFFERS};

#[cfg(feature = "backend_drm")]
use std::path::Path;

#[cfg(feature = "backend_drm")]
use crate::utils::DeviceFd;

/// Open the device node at `path` for mode setting
#[cfg(feature = "backend_drm")]
pub fn open_device(path: impl AsRef<Path>) -> Result<DrmDeviceFd, Error> {
    let path = path.as_ref();
    let fd = DeviceFd::open(path).map_err(|source| {
        Error::Access(AccessError {
            errmsg: "Failed to open device",
            dev: Some(path.to_path_buf()),
            source,
        })
    })?;
    Ok(DrmDeviceFd::new(fd))
}
