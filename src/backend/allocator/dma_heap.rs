//! Buffer allocation through the linux dma-heap interface
//!
//! Buffers are taken from `/dev/dma_heap/<heap>`. The heap is chosen from the
//! requested [`MemoryFlags`]:
//!
//! | flags | heap |
//! |---|---|
//! | `SECURE` | `secure` |
//! | `CONTIGUOUS \| CACHEABLE` | `reserved` |
//! | `CONTIGUOUS` | `reserved-uncached` |
//! | none | `system` |
//!
//! Physical addresses are resolved through the `/dev/dmabuf_imx` helper device. Buffers
//! whose address can't be resolved are still returned with a physical address of 0,
//! the 2D engine and the display controller reject them later.

use std::{
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::Arc,
};

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, trace, warn};

use super::{AllocError, Allocator, Memory, MemoryDesc, MemoryFlags, MemoryHandle, Mapping};
use crate::utils::DeviceFd;

const PAGE_SIZE: usize = 4096;
/// Allocations are rounded up to this granularity
pub const ALLOCATION_ALIGN: usize = PAGE_SIZE << 3;

const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xC018_4800;
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;
const DMABUF_GET_PHYS: libc::c_ulong = 0xC010_4D20;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
#[derive(Debug, Default)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DmaBufPhys {
    dmafd: u32,
    phys: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DmaBufSync {
    flags: u64,
}

/// [`Allocator`] backed by `/dev/dma_heap`
#[derive(Debug)]
pub struct DmaHeapAllocator {
    heap_dir: PathBuf,
    phys_helper: Option<DeviceFd>,
}

impl DmaHeapAllocator {
    /// Use the heaps in `/dev/dma_heap`
    pub fn new() -> DmaHeapAllocator {
        Self::with_heap_dir("/dev/dma_heap")
    }

    /// Use the heaps in a custom directory
    pub fn with_heap_dir(dir: impl AsRef<Path>) -> DmaHeapAllocator {
        let phys_helper = match DeviceFd::open("/dev/dmabuf_imx") {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!(?err, "physical address helper unavailable");
                None
            }
        };
        DmaHeapAllocator {
            heap_dir: dir.as_ref().to_path_buf(),
            phys_helper,
        }
    }

    fn heap_name(flags: MemoryFlags) -> &'static str {
        if flags.contains(MemoryFlags::SECURE) {
            "secure"
        } else if flags.contains(MemoryFlags::CONTIGUOUS | MemoryFlags::CACHEABLE) {
            "reserved"
        } else if flags.contains(MemoryFlags::CONTIGUOUS) {
            "reserved-uncached"
        } else {
            "system"
        }
    }

    fn phys_address(&self, fd: &OwnedFd) -> u64 {
        let Some(helper) = self.phys_helper.as_ref() else {
            return 0;
        };
        let mut data = DmaBufPhys {
            dmafd: fd.as_raw_fd() as u32,
            phys: 0,
        };
        let ret = unsafe { libc::ioctl(helper.as_raw_fd(), DMABUF_GET_PHYS as _, &mut data) };
        if ret < 0 {
            warn!(err = ?std::io::Error::last_os_error(), "failed to resolve physical address");
            return 0;
        }
        data.phys
    }
}

impl Default for DmaHeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn sync(fd: &impl AsRawFd, flags: u64) {
    let mut data = DmaBufSync { flags };
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC as _, &mut data) };
    if ret < 0 {
        debug!(err = ?std::io::Error::last_os_error(), "dma-buf sync failed");
    }
}

impl Allocator for DmaHeapAllocator {
    fn allocate(&self, desc: &MemoryDesc) -> Result<MemoryHandle, AllocError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(AllocError::Unsupported("zero sized buffer"));
        }
        let size = (desc.size() + ALLOCATION_ALIGN - 1) / ALLOCATION_ALIGN * ALLOCATION_ALIGN;
        let heap = self.heap_dir.join(Self::heap_name(desc.flags));
        let heap_fd = DeviceFd::open(&heap)?;

        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        let ret = unsafe { libc::ioctl(heap_fd.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC as _, &mut data) };
        if ret < 0 {
            return Err(AllocError::Io(std::io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as i32) };
        let phys = self.phys_address(&fd);
        trace!(?heap, size, phys, "allocated buffer");

        Ok(Arc::new(Memory::new(desc, Some(fd), phys)))
    }

    fn lock(&self, memory: &Memory) -> Result<Mapping, AllocError> {
        let fd = memory.fd().ok_or(AllocError::NoFd(memory.id()))?;
        if memory.is_secure() {
            return Err(AllocError::Unsupported("secure buffers can't be mapped"));
        }
        let len = memory.size();
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(std::io::Error::from)?
        };
        let ptr = NonNull::new(ptr as *mut u8).ok_or(AllocError::Unsupported("null mapping"))?;
        let sync_fd = fd.try_clone_to_owned()?;
        sync(&sync_fd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE);

        let unmap = move |ptr: NonNull<u8>, len: usize| {
            sync(&sync_fd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE);
            if let Err(err) = unsafe { munmap(ptr.as_ptr() as *mut _, len) } {
                warn!(?err, "failed to unmap buffer");
            }
        };
        Ok(unsafe { Mapping::new(ptr, len, unmap) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_selection() {
        assert_eq!(DmaHeapAllocator::heap_name(MemoryFlags::SECURE), "secure");
        assert_eq!(
            DmaHeapAllocator::heap_name(MemoryFlags::CONTIGUOUS | MemoryFlags::CACHEABLE),
            "reserved"
        );
        assert_eq!(
            DmaHeapAllocator::heap_name(MemoryFlags::CONTIGUOUS),
            "reserved-uncached"
        );
        assert_eq!(DmaHeapAllocator::heap_name(MemoryFlags::empty()), "system");
    }

    #[test]
    fn ioctl_layouts() {
        assert_eq!(std::mem::size_of::<DmaHeapAllocationData>(), 24);
        assert_eq!(std::mem::size_of::<DmaBufPhys>(), 16);
    }
}
