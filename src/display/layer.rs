//! Layer records
//!
//! A [`Layer`] describes one surface handed over by the window system for the next
//! frame. Every display owns [`MAX_LAYERS`] slots. A free slot is claimed, filled by
//! the caller and later released, which restores it to the state of a freshly
//! constructed slot.

use std::sync::Arc;

use crate::{
    backend::{allocator::MemoryHandle, sync::Fence},
    utils::{Buffer, Physical, Rectangle},
};

use super::buffer_slot::BufferSlot;

/// Number of layer slots of every display
pub const MAX_LAYERS: usize = 64;

/// Composition mode of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum LayerType {
    /// Unset or unrecognized
    #[default]
    Invalid = 0,
    /// Composited by the client before handing over the render target
    Client = 1,
    /// Composited by the device
    Device = 2,
    /// A plain colour fill
    SolidColor = 3,
    /// A cursor image
    Cursor = 4,
    /// A stream fed directly by a hardware producer
    Sideband = 5,
}

impl From<i32> for LayerType {
    fn from(value: i32) -> Self {
        match value {
            1 => LayerType::Client,
            2 => LayerType::Device,
            3 => LayerType::SolidColor,
            4 => LayerType::Cursor,
            5 => LayerType::Sideband,
            _ => LayerType::Invalid,
        }
    }
}

bitflags::bitflags! {
    /// Rotation and flips of a layer, applied flips first
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Transform: u32 {
        /// horizontal flip
        const FLIP_H = 0x01;
        /// vertical flip
        const FLIP_V = 0x02;
        /// 90 degrees clockwise
        const ROT_90 = 0x04;
        /// 180 degrees
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        /// 270 degrees clockwise
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
    }
}

/// Blending of a layer with the layers below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum BlendMode {
    /// Not set by the caller
    #[default]
    Unset = 0,
    /// Opaque, replaces what is below
    None = 0x0100,
    /// Premultiplied alpha
    Premultiplied = 0x0105,
    /// Non-premultiplied alpha
    Coverage = 0x0405,
    /// Darkening with the layer colour
    Dim = 0x0805,
}

bitflags::bitflags! {
    /// Per layer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerFlags: u32 {
        /// The window system asked to composite this layer itself
        const SKIP_LAYER = 0x0000_0001;
        /// The buffer is fed by a hardware producer through a [`BufferSlot`]
        const BUFFER_SLOT = 0x4000_0000;
    }
}

/// One compositing unit
#[derive(Debug, Default)]
pub struct Layer {
    /// Slot number, stable for the lifetime of the display
    pub index: usize,
    /// Whether the slot is claimed
    pub busy: bool,
    /// Paint order, larger values are painted on top
    pub zorder: u32,
    /// Composition mode requested by the caller
    pub orig_type: LayerType,
    /// Composition mode decided for the current frame
    pub type_: LayerType,
    /// Buffer to sample
    pub handle: Option<MemoryHandle>,
    /// Sampled area in buffer coordinates
    pub source_crop: Rectangle<Buffer>,
    /// Destination area in output coordinates
    pub display_frame: Rectangle<Physical>,
    /// Parts of the destination not covered by layers above
    pub visible_region: Vec<Rectangle<Physical>>,
    /// Rotation and flips
    pub transform: Transform,
    /// Blending with the layers below
    pub blend_mode: BlendMode,
    /// Alpha applied to the whole layer, 255 is opaque
    pub plane_alpha: u8,
    /// ARGB colour of [`LayerType::SolidColor`] layers
    pub color: u32,
    /// Flags
    pub flags: LayerFlags,
    /// Signaled once the producer finished writing [`Layer::handle`]
    pub acquire_fence: Option<Fence>,
    /// Signaled once the display stopped reading [`Layer::handle`]
    pub release_fence: Option<Fence>,
    /// Whether the layer is scanned out on an overlay plane this frame
    pub is_overlay: bool,
    /// Whether the layer carries HDR content
    pub is_hdr: bool,
    /// Producer queue of a hardware-fed layer
    pub buffer_slot: Option<Arc<BufferSlot>>,
    /// Id of the buffer presented in the previous frame
    pub last_handle: Option<u64>,
    /// Source crop of the previous frame
    pub last_source_crop: Rectangle<Buffer>,
    /// Display frame of the previous frame
    pub last_display_frame: Rectangle<Physical>,
}

impl Layer {
    /// A free slot
    pub fn new(index: usize) -> Layer {
        Layer {
            index,
            plane_alpha: 0xff,
            ..Default::default()
        }
    }

    /// Return the slot to the free pool, keeping only its index
    pub fn reset(&mut self) {
        *self = Layer::new(self.index);
    }

    /// Whether this is a colour fill without a buffer
    pub fn is_solid_color(&self) -> bool {
        self.type_ == LayerType::SolidColor
    }

    /// Whether the buffer is protected content
    pub fn is_secure(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_secure()).unwrap_or(false)
    }

    /// Whether buffer, crop or destination changed since the last frame
    ///
    /// Refreshes the `last_*` fields.
    pub(crate) fn take_update(&mut self) -> bool {
        let handle = self.handle.as_ref().map(|h| h.id());
        let changed = handle != self.last_handle
            || self.source_crop != self.last_source_crop
            || self.display_frame != self.last_display_frame;
        self.last_handle = handle;
        self.last_source_crop = self.source_crop;
        self.last_display_frame = self.display_frame;
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::allocator::{test::buffer, PixelFormat};

    #[test]
    fn unknown_types_decode_as_invalid() {
        assert_eq!(LayerType::from(2), LayerType::Device);
        assert_eq!(LayerType::from(5), LayerType::Sideband);
        assert_eq!(LayerType::from(17), LayerType::Invalid);
        assert_eq!(LayerType::from(-1), LayerType::Invalid);
    }

    #[test]
    fn rotations_are_flip_combinations() {
        assert_eq!(Transform::ROT_180.bits(), 3);
        assert_eq!(Transform::ROT_270.bits(), 7);
    }

    #[test]
    fn reset_keeps_only_index() {
        let mut layer = Layer::new(9);
        layer.busy = true;
        layer.zorder = 4;
        layer.orig_type = LayerType::Device;
        layer.handle = Some(buffer(32, 32, PixelFormat::Rgba8888));
        layer.blend_mode = BlendMode::Premultiplied;
        layer.flags = LayerFlags::SKIP_LAYER;
        layer.is_hdr = true;
        layer.visible_region.push(Rectangle::from_loc_and_size((0, 0), (32, 32)));
        layer.reset();

        assert_eq!(layer.index, 9);
        assert!(!layer.busy);
        assert!(layer.handle.is_none());
        assert!(layer.visible_region.is_empty());
        assert_eq!(layer.blend_mode, BlendMode::Unset);
        assert_eq!(layer.flags, LayerFlags::empty());
        assert!(!layer.is_hdr);
        assert_eq!(layer.plane_alpha, 0xff);
    }

    #[test]
    fn update_tracking() {
        let mut layer = Layer::new(0);
        layer.handle = Some(buffer(32, 32, PixelFormat::Rgba8888));
        layer.display_frame = Rectangle::from_loc_and_size((0, 0), (32, 32));
        assert!(layer.take_update());
        assert!(!layer.take_update());
        layer.source_crop = Rectangle::from_loc_and_size((0, 0), (16, 16));
        assert!(layer.take_update());
        layer.handle = Some(buffer(32, 32, PixelFormat::Rgba8888));
        assert!(layer.take_update());
        assert!(!layer.take_update());
    }
}
