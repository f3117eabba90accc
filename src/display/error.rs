use crate::backend::{composer, drm, fbdev};

/// Errors of a [`Display`](super::Display)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The layer index is out of range or the slot is not claimed
    #[error("Invalid layer {0}")]
    InvalidLayer(usize),
    /// Nothing to compose into or to present
    #[error("No render target set")]
    NoRenderTarget,
    /// The output is unplugged
    #[error("The display is disconnected")]
    Disconnected,
    /// The output is powered off
    #[error("The display is not powered on")]
    PoweredOff,
    /// The config index is out of range
    #[error("Invalid display config {0}")]
    BadConfig(usize),
    /// The config change would require a mode set
    #[error("A seamless config change is not possible")]
    SeamlessNotAllowed,
    /// The backend lacks the capability
    #[error("The operation is not supported by this display")]
    Unsupported,
    /// The KMS backend failed
    #[error(transparent)]
    Drm(#[from] drm::Error),
    /// The framebuffer backend failed
    #[error(transparent)]
    Fbdev(#[from] fbdev::Error),
    /// Device composition failed
    #[error(transparent)]
    Composer(#[from] composer::Error),
}
