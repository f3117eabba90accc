//! Graphics memory shared between producers, the 2D engine and the display controller.
//!
//! A [`Memory`] describes one physically backed buffer. Ownership is shared through
//! [`MemoryHandle`]: the allocator hands out the first reference, layers and render
//! targets clone it, and the buffer is released exactly once when the last clone is
//! dropped. Display backends may attach a KMS framebuffer to any buffer they present,
//! which is removed from the device together with the buffer.
//!
//! The [`Allocator`] trait is the seam towards the platform allocation service,
//! [`dma_heap::DmaHeapAllocator`] implements it on top of the linux dma-heap interface.

use std::{
    fmt,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use tracing::{trace, warn};

pub mod dma_heap;
pub mod format;

pub use self::format::{Fourcc, Modifier, PixelFormat};
use crate::utils::align_up;

bitflags::bitflags! {
    /// Intended usage of a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        /// CPU reads often
        const SW_READ_OFTEN = 0x0000_0003;
        /// CPU writes often
        const SW_WRITE_OFTEN = 0x0000_0030;
        /// sampled by the GPU
        const HW_TEXTURE = 0x0000_0100;
        /// rendered into by the GPU
        const HW_RENDER = 0x0000_0200;
        /// read or written by the 2D blit engine
        const HW_2D = 0x0000_0400;
        /// consumed by the composer
        const HW_COMPOSER = 0x0000_0800;
        /// protected content, must never be read back by the CPU
        const PROTECTED = 0x0000_4000;
        /// consumed by the video encoder
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

bitflags::bitflags! {
    /// Allocation flags of a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryFlags: u32 {
        /// allocated from the secure heap
        const SECURE = 0x0000_0001;
        /// physically contiguous
        const CONTIGUOUS = 0x0000_0002;
        /// CPU cacheable
        const CACHEABLE = 0x0000_0004;
        /// tiles carry DTRC compression
        const COMPRESSED = 0x0000_0100;
        /// the DTRC table offsets changed and must be sent to the display controller
        const COMPRESSED_OFFSET = 0x0000_0200;
        /// the 1x1 fill buffer of the composer
        const DIM_BUFFER = 0x0100_0000;
        /// may be scanned out directly
        const FRAMEBUFFER = 0x1000_0000;
    }
}

/// Parameters of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    /// width in pixels
    pub width: u32,
    /// height in pixels
    pub height: u32,
    /// pixel layout
    pub format: PixelFormat,
    /// intended usage
    pub usage: Usage,
    /// allocation flags
    pub flags: MemoryFlags,
}

impl MemoryDesc {
    /// Describe a buffer of the given size and format
    pub fn new(width: u32, height: u32, format: PixelFormat) -> MemoryDesc {
        MemoryDesc {
            width,
            height,
            format,
            usage: Usage::empty(),
            flags: MemoryFlags::CONTIGUOUS,
        }
    }

    /// Add usage bits
    pub fn usage(mut self, usage: Usage) -> MemoryDesc {
        self.usage |= usage;
        self
    }

    /// Add allocation flags
    pub fn flags(mut self, flags: MemoryFlags) -> MemoryDesc {
        self.flags |= flags;
        self
    }

    /// Row length in pixels
    ///
    /// YUV and tiled buffers are padded to 16 pixels for the VPU and the 2D engine.
    pub fn stride(&self) -> u32 {
        if self.format.is_yuv() || self.format.is_tiled() {
            align_up(self.width, 16)
        } else {
            self.width
        }
    }

    /// Total byte size of all planes
    pub fn size(&self) -> usize {
        let stride = self.stride() as usize;
        let height = if self.format.is_yuv() {
            align_up(self.height, 16) as usize
        } else {
            self.height as usize
        };
        let luma = stride * height * self.format.bytes_per_pixel() as usize;
        match self.format {
            PixelFormat::Nv16 => luma * 2,
            f if f.is_yuv() && f.bpp() == 8 => luma * 3 / 2,
            PixelFormat::P010 | PixelFormat::P010Tiled | PixelFormat::P010TiledCompressed => luma * 3 / 2,
            _ => luma,
        }
    }
}

/// Device that can remove framebuffer objects it created for a [`Memory`]
pub trait FramebufferRelease: Send + Sync {
    /// Remove the framebuffer and close the GEM handle of an imported buffer
    fn release_framebuffer(&self, fb_id: u32, gem_handle: u32);
}

/// A KMS framebuffer registered for a [`Memory`]
///
/// Removed from the device once dropped.
pub struct KmsFramebuffer {
    fb_id: u32,
    gem_handle: u32,
    device: Weak<dyn FramebufferRelease>,
}

impl fmt::Debug for KmsFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsFramebuffer")
            .field("fb_id", &self.fb_id)
            .field("gem_handle", &self.gem_handle)
            .finish()
    }
}

impl KmsFramebuffer {
    /// Wrap a framebuffer id created on `device`
    pub fn new(fb_id: u32, gem_handle: u32, device: Weak<dyn FramebufferRelease>) -> Self {
        KmsFramebuffer {
            fb_id,
            gem_handle,
            device,
        }
    }

    /// Framebuffer object id
    pub fn id(&self) -> u32 {
        self.fb_id
    }
}

impl Drop for KmsFramebuffer {
    fn drop(&mut self) {
        trace!(fb = self.fb_id, "destroying framebuffer");
        if let Some(device) = self.device.upgrade() {
            device.release_framebuffer(self.fb_id, self.gem_handle);
        }
    }
}

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// A graphics buffer
pub struct Memory {
    id: u64,
    fd: Option<OwnedFd>,
    phys: u64,
    size: usize,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    usage: Usage,
    flags: Mutex<MemoryFlags>,
    tile_offsets: Option<(u32, u32)>,
    kms: Mutex<Option<KmsFramebuffer>>,
}

/// Shared ownership of a [`Memory`]
pub type MemoryHandle = Arc<Memory>;

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id)
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &(self.width, self.height))
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("usage", &self.usage)
            .field("flags", &self.flags())
            .finish()
    }
}

impl Memory {
    /// Wrap an allocated buffer
    pub fn new(desc: &MemoryDesc, fd: Option<OwnedFd>, phys: u64) -> Memory {
        Memory {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            phys,
            size: desc.size(),
            width: desc.width,
            height: desc.height,
            stride: desc.stride(),
            format: desc.format,
            usage: desc.usage,
            flags: Mutex::new(desc.flags),
            tile_offsets: None,
            kms: Mutex::new(None),
        }
    }

    /// Attach the DTRC table offsets of a compressed tiled buffer
    pub fn with_tile_offsets(mut self, y_offset: u32, uv_offset: u32) -> Memory {
        self.tile_offsets = Some((y_offset, uv_offset));
        *self.flags.get_mut().unwrap() |= MemoryFlags::COMPRESSED | MemoryFlags::COMPRESSED_OFFSET;
        self
    }

    /// Process-unique id of this buffer
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Physical address of the first plane
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Byte size of the allocation
    pub fn size(&self) -> usize {
        self.size
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row length in pixels
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel layout
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Intended usage
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Current allocation flags
    pub fn flags(&self) -> MemoryFlags {
        *self.flags.lock().unwrap()
    }

    /// Whether the buffer holds protected content
    pub fn is_secure(&self) -> bool {
        self.flags().contains(MemoryFlags::SECURE) || self.usage.contains(Usage::PROTECTED)
    }

    /// Underlying dma-buf file descriptor
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// DTRC table offsets if they changed since they were last consumed
    ///
    /// Consuming clears [`MemoryFlags::COMPRESSED_OFFSET`].
    pub fn take_tile_offsets(&self) -> Option<(u32, u32)> {
        let mut flags = self.flags.lock().unwrap();
        if flags.contains(MemoryFlags::COMPRESSED_OFFSET) {
            flags.remove(MemoryFlags::COMPRESSED_OFFSET);
            self.tile_offsets
        } else {
            None
        }
    }

    /// Framebuffer object id if the buffer was already registered with KMS
    pub fn framebuffer(&self) -> Option<u32> {
        self.kms.lock().unwrap().as_ref().map(KmsFramebuffer::id)
    }

    /// Register a KMS framebuffer for this buffer, replacing any earlier one
    pub fn attach_framebuffer(&self, fb: KmsFramebuffer) {
        let old = self.kms.lock().unwrap().replace(fb);
        if let Some(old) = old {
            warn!(buffer = self.id, fb = old.id(), "replacing framebuffer of buffer");
        }
    }
}

/// Errors of the [`Allocator`]
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The allocation request can't be served
    #[error("Unsupported allocation request: {0}")]
    Unsupported(&'static str),
    /// The buffer has no file descriptor to map
    #[error("Buffer {0} has no file descriptor")]
    NoFd(u64),
    /// The kernel rejected the request
    #[error("Allocation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// CPU mapping of a [`Memory`], unmapped on drop
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    unmap: Option<Box<dyn FnOnce(NonNull<u8>, usize) + Send>>,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Mapping {
    /// Wrap a mapping, `unmap` is called exactly once on drop
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until `unmap` runs.
    pub unsafe fn new(
        ptr: NonNull<u8>,
        len: usize,
        unmap: impl FnOnce(NonNull<u8>, usize) + Send + 'static,
    ) -> Mapping {
        Mapping {
            ptr,
            len,
            unmap: Some(Box::new(unmap)),
        }
    }

    /// Mapped bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap(self.ptr, self.len);
        }
    }
}

/// Platform buffer allocation service
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate a new buffer
    fn allocate(&self, desc: &MemoryDesc) -> Result<MemoryHandle, AllocError>;

    /// Map a buffer for CPU access, the mapping is released on drop
    fn lock(&self, memory: &Memory) -> Result<Mapping, AllocError>;
}
