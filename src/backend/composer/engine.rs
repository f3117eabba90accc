//! Capability interface of the 2D blit engine
//!
//! The surface and enum layouts match the vendor `g2d.h` ABI so that
//! [`G2dSurfaceEx`] can be handed to the library unchanged.

use std::{fmt, os::raw::c_int};

use super::Error;

/// Engine pixel format codes
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub enum G2dFormat {
    Rgb565 = 0,
    #[default]
    Rgba8888 = 1,
    Rgbx8888 = 2,
    Bgra8888 = 3,
    Bgrx8888 = 4,
    Nv12 = 20,
    I420 = 21,
    Yv12 = 22,
    Nv21 = 23,
    Yuyv = 24,
    Nv16 = 28,
}

/// Rotation and flip applied to a surface
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub enum G2dRotation {
    #[default]
    Rotation0 = 0,
    Rotation90 = 1,
    Rotation180 = 2,
    Rotation270 = 3,
    FlipH = 4,
    FlipV = 5,
}

/// Blend factors
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub enum G2dBlendFunc {
    #[default]
    Zero = 0,
    One = 1,
    SrcAlpha = 2,
    OneMinusSrcAlpha = 3,
}

/// Engine state toggled around a blit
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum G2dCap {
    Blend = 0,
    Dither = 1,
    GlobalAlpha = 2,
}

/// Optional engine features
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum G2dFeature {
    Scaling = 0,
    Rotation = 1,
    SrcYuv = 2,
    DstYuv = 3,
    MultiSourceBlt = 4,
    FastClear = 5,
}

/// Memory layout of a surface
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub enum G2dTiling {
    #[default]
    Linear = 0x1,
    Tiled = 0x2,
    SuperTiled = 0x4,
    AmphionTiled = 0x8,
}

/// Surface descriptor
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct G2dSurface {
    pub format: G2dFormat,
    pub planes: [std::os::raw::c_long; 3],
    pub left: c_int,
    pub top: c_int,
    pub right: c_int,
    pub bottom: c_int,
    pub stride: c_int,
    pub width: c_int,
    pub height: c_int,
    pub blendfunc: G2dBlendFunc,
    pub global_alpha: c_int,
    pub clrcolor: c_int,
    pub rot: G2dRotation,
}

/// Surface descriptor with tiling information
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct G2dSurfaceEx {
    pub base: G2dSurface,
    pub tiling: G2dTiling,
    pub reserved: [c_int; 8],
}

/// Per thread handle of an opened engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub usize);

/// A 2D blit engine implementation
///
/// Every method but [`BlitEngine::open`] operates on a handle opened by the calling thread.
pub trait BlitEngine: fmt::Debug + Send + Sync {
    /// Open a handle for the calling thread
    fn open(&self) -> Result<EngineHandle, Error>;

    /// Close a handle opened by [`BlitEngine::open`]
    fn close(&self, handle: EngineHandle);

    /// Copy `src` into `dst`, scaling, rotating and blending as described
    fn blit(&self, handle: EngineHandle, src: &G2dSurfaceEx, dst: &G2dSurfaceEx) -> Result<(), Error>;

    /// Fill the crop rectangle of `area` with its clear colour
    fn clear(&self, handle: EngineHandle, area: &G2dSurface) -> Result<(), Error>;

    /// Toggle an engine capability
    fn set_capability(&self, handle: EngineHandle, cap: G2dCap, enable: bool) -> Result<(), Error>;

    /// Restrict following blits to the given destination rectangle
    fn set_clipping(
        &self,
        handle: EngineHandle,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> Result<(), Error>;

    /// Wait for all queued operations
    fn finish(&self, handle: EngineHandle) -> Result<(), Error>;

    /// Whether an optional feature is available
    fn query_feature(&self, handle: EngineHandle, feature: G2dFeature) -> bool;

    /// Size a tiled buffer of `format` has to be allocated with
    ///
    /// `None` if the engine can't tell, the caller keeps its own alignment.
    fn align_tile(&self, width: u32, height: u32, format: i32, usage: u32) -> Option<(u32, u32)> {
        let _ = (width, height, format, usage);
        None
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use super::*;

    /// Operation recorded by [`MockEngine`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum Op {
        Open,
        Close,
        Blit { src: G2dSurfaceEx, dst: G2dSurfaceEx },
        Clear(G2dSurface),
        Capability(G2dCap, bool),
        Clip(i32, i32, i32, i32),
        Finish,
    }

    /// Engine recording every call
    #[derive(Debug)]
    pub struct MockEngine {
        pub ops: Mutex<Vec<Op>>,
        pub rotation: bool,
        pub fail_open: bool,
    }

    impl Default for MockEngine {
        fn default() -> Self {
            MockEngine {
                ops: Mutex::new(Vec::new()),
                rotation: true,
                fail_open: false,
            }
        }
    }

    impl MockEngine {
        pub fn take(&self) -> Vec<Op> {
            std::mem::take(&mut *self.ops.lock().unwrap())
        }

        fn push(&self, op: Op) {
            self.ops.lock().unwrap().push(op);
        }
    }

    impl BlitEngine for MockEngine {
        fn open(&self) -> Result<EngineHandle, Error> {
            if self.fail_open {
                return Err(Error::NoHandle);
            }
            self.push(Op::Open);
            Ok(EngineHandle(0x1000))
        }

        fn close(&self, _handle: EngineHandle) {
            self.push(Op::Close);
        }

        fn blit(&self, _handle: EngineHandle, src: &G2dSurfaceEx, dst: &G2dSurfaceEx) -> Result<(), Error> {
            self.push(Op::Blit { src: *src, dst: *dst });
            Ok(())
        }

        fn clear(&self, _handle: EngineHandle, area: &G2dSurface) -> Result<(), Error> {
            self.push(Op::Clear(*area));
            Ok(())
        }

        fn set_capability(&self, _handle: EngineHandle, cap: G2dCap, enable: bool) -> Result<(), Error> {
            self.push(Op::Capability(cap, enable));
            Ok(())
        }

        fn set_clipping(
            &self,
            _handle: EngineHandle,
            left: i32,
            top: i32,
            right: i32,
            bottom: i32,
        ) -> Result<(), Error> {
            self.push(Op::Clip(left, top, right, bottom));
            Ok(())
        }

        fn finish(&self, _handle: EngineHandle) -> Result<(), Error> {
            self.push(Op::Finish);
            Ok(())
        }

        fn query_feature(&self, _handle: EngineHandle, feature: G2dFeature) -> bool {
            match feature {
                G2dFeature::Rotation => self.rotation,
                _ => true,
            }
        }
    }

    #[test]
    fn abi_layout() {
        use std::mem::size_of;
        // format + 3 planes + 7 ints + blendfunc + 2 ints + rot on LP64
        if size_of::<std::os::raw::c_long>() == 8 {
            assert_eq!(size_of::<G2dSurface>(), 80);
            assert_eq!(size_of::<G2dSurfaceEx>(), 80 + 4 + 32 + 4);
        }
    }
}
