use std::{io, path::PathBuf};

/// Failed ioctl on a KMS device
#[derive(Debug, thiserror::Error)]
#[error("{errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// What was attempted
    pub errmsg: &'static str,
    /// Device the ioctl was issued on
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Errors of the KMS backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device ioctl failed
    #[error("DRM access error: {0}")]
    Access(#[from] AccessError),
    /// The device lacks a property the operation needs
    #[error("Missing property `{name}` on object {object}")]
    UnknownProperty {
        /// Object id
        object: u32,
        /// Property name
        name: &'static str,
    },
    /// The device has no connector to drive
    #[error("No usable connector found")]
    NoConnector,
    /// No CRTC can drive the connector
    #[error("No CRTC available for connector {0}")]
    NoCrtc(u32),
    /// No primary plane is attached to the CRTC
    #[error("No primary plane found for CRTC {0}")]
    NoPrimaryPlane(u32),
    /// The connector reports no mode
    #[error("No mode available on connector {0}")]
    ModeNotFound(u32),
    /// The kernel stayed busy for every attempt
    #[error("Atomic commit still busy after {0} attempts")]
    CommitRetriesExhausted(usize),
    /// The config change can't happen without a mode set
    #[error("Config change requires a mode set")]
    SeamlessNotAllowed,
    /// The config index is unknown
    #[error("Invalid config {0}")]
    BadConfig(usize),
    /// The buffer can't be scanned out
    #[error("Buffer {0} can't be used as a framebuffer")]
    InvalidBuffer(u64),
}

impl Error {
    /// Whether the underlying ioctl failed with `errno`
    pub fn is_errno(&self, errno: i32) -> bool {
        matches!(self, Error::Access(AccessError { source, .. }) if source.raw_os_error() == Some(errno))
    }
}
