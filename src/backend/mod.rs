//! Hardware interaction
//!
//! - [`allocator`] describes and allocates the buffers the displays work on,
//! - [`composer`] drives the 2D blit engine,
//! - [`sync`] wraps the kernel fences handed along with buffers,
//! - [`vsync`] turns hardware or timer vsync into listener events,
//! - [`drm`] and [`fbdev`] present frames through DRM/KMS or a framebuffer device,
//! - [`udev`] reports hotplug events.

pub mod allocator;
pub mod composer;
pub mod drm;
pub mod fbdev;
pub mod sync;
#[cfg(feature = "backend_udev")]
pub mod udev;
pub mod vsync;
