//! Layouts and request codes of `linux/fb.h` and the i.MX `mxcfb.h` extension

#![allow(missing_docs)]

use std::{io, mem, os::unix::io::BorrowedFd, os::unix::io::AsRawFd};

pub const FBIOGET_VSCREENINFO: u32 = 0x4600;
pub const FBIOPUT_VSCREENINFO: u32 = 0x4601;
pub const FBIOGET_FSCREENINFO: u32 = 0x4602;
pub const FBIOPAN_DISPLAY: u32 = 0x4606;
pub const FBIOBLANK: u32 = 0x4611;

pub const FB_ACTIVATE_NOW: u32 = 0;
pub const FB_ACTIVATE_FORCE: u32 = 128;

pub const FB_BLANK_UNBLANK: u32 = 0;
pub const FB_BLANK_NORMAL: u32 = 1;
pub const FB_BLANK_VSYNC_SUSPEND: u32 = 2;
pub const FB_BLANK_POWERDOWN: u32 = 4;

const IOC_WRITE: u32 = 1;

const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    (IOC_WRITE << 30) | ((size as u32 & 0x3fff) << 16) | ((ty as u32) << 8) | nr as u32
}

/// `MXCFB_UPDATE_SCREEN`, scan out a buffer by physical address
pub const MXCFB_UPDATE_SCREEN: u32 = iow(b'F', 0x4D, mem::size_of::<MxcfbBuffer>());

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

impl FbBitfield {
    pub const fn new(offset: u32, length: u32) -> FbBitfield {
        FbBitfield {
            offset,
            length,
            msb_right: 0,
        }
    }
}

/// `struct fb_var_screeninfo`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbVarScreeninfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    /// height of the picture in mm
    pub height: u32,
    /// width of the picture in mm
    pub width: u32,
    pub accel_flags: u32,
    /// pixel clock in ps
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

impl FbVarScreeninfo {
    /// Refresh rate in mHz from the timing, 0 if the driver reports no pixel clock
    pub fn refresh_millihertz(&self) -> u64 {
        let vtotal = (self.upper_margin + self.lower_margin + self.yres + self.vsync_len) as u64;
        let htotal = (self.left_margin + self.right_margin + self.xres + self.hsync_len) as u64;
        let total = vtotal * htotal * self.pixclock as u64;
        if total == 0 {
            return 0;
        }
        1_000_000_000_000_000 / total
    }
}

/// `struct fb_fix_screeninfo`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbFixScreeninfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

/// `struct mxcfb_buffer`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MxcfbBuffer {
    pub xoffset: u32,
    pub yoffset: u32,
    pub stride: u32,
    pub phys: u64,
}

/// Issue a framebuffer ioctl
///
/// # Safety
///
/// `arg` has to point to a value of the layout `request` expects.
unsafe fn ioctl_ptr<T>(fd: BorrowedFd<'_>, request: u32, arg: *mut T) -> io::Result<()> {
    // SAFETY: forwarded to the caller
    if unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn get_var(fd: BorrowedFd<'_>) -> io::Result<FbVarScreeninfo> {
    let mut info = FbVarScreeninfo::default();
    // SAFETY: FBIOGET_VSCREENINFO writes a fb_var_screeninfo
    unsafe { ioctl_ptr(fd, FBIOGET_VSCREENINFO, &mut info) }?;
    Ok(info)
}

pub fn put_var(fd: BorrowedFd<'_>, info: &FbVarScreeninfo) -> io::Result<()> {
    let mut info = *info;
    // SAFETY: FBIOPUT_VSCREENINFO reads and updates a fb_var_screeninfo
    unsafe { ioctl_ptr(fd, FBIOPUT_VSCREENINFO, &mut info) }
}

pub fn get_fix(fd: BorrowedFd<'_>) -> io::Result<FbFixScreeninfo> {
    let mut info = FbFixScreeninfo::default();
    // SAFETY: FBIOGET_FSCREENINFO writes a fb_fix_screeninfo
    unsafe { ioctl_ptr(fd, FBIOGET_FSCREENINFO, &mut info) }?;
    Ok(info)
}

pub fn pan(fd: BorrowedFd<'_>, info: &FbVarScreeninfo) -> io::Result<()> {
    let mut info = *info;
    // SAFETY: FBIOPAN_DISPLAY reads a fb_var_screeninfo
    unsafe { ioctl_ptr(fd, FBIOPAN_DISPLAY, &mut info) }
}

pub fn update_screen(fd: BorrowedFd<'_>, buffer: &MxcfbBuffer) -> io::Result<()> {
    let mut buffer = *buffer;
    // SAFETY: MXCFB_UPDATE_SCREEN reads a mxcfb_buffer
    unsafe { ioctl_ptr(fd, MXCFB_UPDATE_SCREEN, &mut buffer) }
}

pub fn blank(fd: BorrowedFd<'_>, mode: u32) -> io::Result<()> {
    // SAFETY: FBIOBLANK takes the blank level by value
    if unsafe { libc::ioctl(fd.as_raw_fd(), FBIOBLANK as _, mode as libc::c_ulong) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
