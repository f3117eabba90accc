//! [`BlitEngine`] implementation on top of the vendor `libg2d.so`
//!
//! The library is loaded at runtime. Only `g2d_open` and one of `g2d_blitEx` or
//! `g2d_blit` are required, every other missing entry point turns the matching
//! operation into an error without disabling the engine as a whole. The optional
//! `libgpuhelper.so` provides tile alignment for allocations.

use std::{
    ffi::c_void,
    os::raw::c_int,
    path::{Path, PathBuf},
};

use libloading::Library;
use tracing::{debug, info, warn};

use super::{
    engine::{BlitEngine, EngineHandle, G2dCap, G2dFeature, G2dSurface, G2dSurfaceEx},
    Error,
};

#[cfg(target_pointer_width = "64")]
const SEARCH_PATHS: &[&str] = &["/vendor/lib64", "/system/lib64"];
#[cfg(not(target_pointer_width = "64"))]
const SEARCH_PATHS: &[&str] = &["/vendor/lib", "/system/lib"];

const G2D_LIBRARY: &str = "libg2d.so";
const HELPER_LIBRARY: &str = "libgpuhelper.so";

type OpenFn = unsafe extern "C" fn(*mut *mut c_void) -> c_int;
type CloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type BlitFn = unsafe extern "C" fn(*mut c_void, *const G2dSurfaceEx, *const G2dSurfaceEx) -> c_int;
type ClearFn = unsafe extern "C" fn(*mut c_void, *const G2dSurface) -> c_int;
type CapFn = unsafe extern "C" fn(*mut c_void, G2dCap) -> c_int;
type ClipFn = unsafe extern "C" fn(*mut c_void, c_int, c_int, c_int, c_int) -> c_int;
type FinishFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type QueryFn = unsafe extern "C" fn(*mut c_void, G2dFeature, *mut c_int) -> c_int;
type AlignTileFn = unsafe extern "C" fn(*mut c_int, *mut c_int, c_int, c_int) -> c_int;

#[derive(Debug, Clone, Copy)]
struct G2dFns {
    open: OpenFn,
    close: Option<CloseFn>,
    blit: BlitFn,
    clear: Option<ClearFn>,
    enable: Option<CapFn>,
    disable: Option<CapFn>,
    set_clipping: Option<ClipFn>,
    finish: Option<FinishFn>,
    query_feature: Option<QueryFn>,
}

/// The vendor 2D engine
#[derive(Debug)]
pub struct G2dEngine {
    fns: G2dFns,
    align_tile: Option<AlignTileFn>,
    // the function pointers above stay valid as long as the libraries are loaded
    _g2d: Library,
    _helper: Option<Library>,
}

/// Find `name` in the first search path containing it
pub fn find_module(name: &str) -> Option<PathBuf> {
    find_module_in(SEARCH_PATHS.iter().map(Path::new), name)
}

fn find_module_in<'a>(dirs: impl IntoIterator<Item = &'a Path>, name: &str) -> Option<PathBuf> {
    dirs.into_iter().map(|dir| dir.join(name)).find(|path| path.exists())
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Option<T> {
    match lib.get::<T>(name) {
        Ok(sym) => Some(*sym),
        Err(err) => {
            debug!(symbol = %String::from_utf8_lossy(name), %err, "symbol not found");
            None
        }
    }
}

fn check(ret: c_int) -> Result<(), Error> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Engine(ret))
    }
}

impl G2dEngine {
    /// Load the engine from the default library locations
    pub fn load() -> Result<G2dEngine, Error> {
        let path = find_module(G2D_LIBRARY).ok_or(Error::NotLoaded)?;
        let g2d = unsafe { Library::new(&path) }.map_err(|err| {
            info!(?path, %err, "can't load 2D engine library");
            Error::NotLoaded
        })?;
        info!(?path, "loaded 2D engine library");

        let fns = unsafe {
            let blit = symbol::<BlitFn>(&g2d, b"g2d_blitEx\0").or_else(|| symbol(&g2d, b"g2d_blit\0"));
            G2dFns {
                open: symbol(&g2d, b"g2d_open\0").ok_or(Error::MissingSymbol("g2d_open"))?,
                close: symbol(&g2d, b"g2d_close\0"),
                blit: blit.ok_or(Error::MissingSymbol("g2d_blit"))?,
                clear: symbol(&g2d, b"g2d_clear\0"),
                enable: symbol(&g2d, b"g2d_enable\0"),
                disable: symbol(&g2d, b"g2d_disable\0"),
                set_clipping: symbol(&g2d, b"g2d_set_clipping\0"),
                finish: symbol(&g2d, b"g2d_finish\0"),
                query_feature: symbol(&g2d, b"g2d_query_feature\0"),
            }
        };

        let helper = find_module(HELPER_LIBRARY).and_then(|path| match unsafe { Library::new(&path) } {
            Ok(lib) => Some(lib),
            Err(err) => {
                warn!(?path, %err, "can't load gpu helper library");
                None
            }
        });
        let align_tile = helper
            .as_ref()
            .and_then(|lib| unsafe { symbol::<AlignTileFn>(lib, b"hwc_align_tile\0") });

        Ok(G2dEngine {
            fns,
            align_tile,
            _g2d: g2d,
            _helper: helper,
        })
    }

    fn raw(handle: EngineHandle) -> *mut c_void {
        handle.0 as *mut c_void
    }
}

impl BlitEngine for G2dEngine {
    fn open(&self) -> Result<EngineHandle, Error> {
        let mut handle = std::ptr::null_mut();
        check(unsafe { (self.fns.open)(&mut handle) })?;
        if handle.is_null() {
            return Err(Error::NoHandle);
        }
        Ok(EngineHandle(handle as usize))
    }

    fn close(&self, handle: EngineHandle) {
        if let Some(close) = self.fns.close {
            if let Err(err) = check(unsafe { close(Self::raw(handle)) }) {
                warn!(%err, "failed to close 2D engine handle");
            }
        }
    }

    fn blit(&self, handle: EngineHandle, src: &G2dSurfaceEx, dst: &G2dSurfaceEx) -> Result<(), Error> {
        check(unsafe { (self.fns.blit)(Self::raw(handle), src, dst) })
    }

    fn clear(&self, handle: EngineHandle, area: &G2dSurface) -> Result<(), Error> {
        let clear = self.fns.clear.ok_or(Error::MissingSymbol("g2d_clear"))?;
        check(unsafe { clear(Self::raw(handle), area) })
    }

    fn set_capability(&self, handle: EngineHandle, cap: G2dCap, enable: bool) -> Result<(), Error> {
        let (Some(enable_fn), Some(disable_fn)) = (self.fns.enable, self.fns.disable) else {
            return Err(Error::MissingSymbol("g2d_enable"));
        };
        let func = if enable { enable_fn } else { disable_fn };
        check(unsafe { func(Self::raw(handle), cap) })
    }

    fn set_clipping(
        &self,
        handle: EngineHandle,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> Result<(), Error> {
        let clip = self.fns.set_clipping.ok_or(Error::MissingSymbol("g2d_set_clipping"))?;
        check(unsafe { clip(Self::raw(handle), left, top, right, bottom) })
    }

    fn finish(&self, handle: EngineHandle) -> Result<(), Error> {
        let finish = self.fns.finish.ok_or(Error::MissingSymbol("g2d_finish"))?;
        check(unsafe { finish(Self::raw(handle)) })
    }

    fn query_feature(&self, handle: EngineHandle, feature: G2dFeature) -> bool {
        let Some(query) = self.fns.query_feature else {
            return false;
        };
        let mut enabled: c_int = 0;
        unsafe { query(Self::raw(handle), feature, &mut enabled) };
        enabled != 0
    }

    fn align_tile(&self, width: u32, height: u32, format: i32, usage: u32) -> Option<(u32, u32)> {
        let align = self.align_tile?;
        let (mut w, mut h) = (width as c_int, height as c_int);
        let ret = unsafe { align(&mut w, &mut h, format, usage as c_int) };
        (ret == 0).then_some((w as u32, h as u32))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn module_search_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let (first, second) = (first.path(), second.path());
        std::fs::write(second.join(G2D_LIBRARY), b"").unwrap();

        let dirs = [first, second];
        assert_eq!(find_module_in(dirs, G2D_LIBRARY), Some(second.join(G2D_LIBRARY)));
        std::fs::write(first.join(G2D_LIBRARY), b"").unwrap();
        assert_eq!(find_module_in(dirs, G2D_LIBRARY), Some(first.join(G2D_LIBRARY)));
        assert_eq!(find_module_in(dirs, HELPER_LIBRARY), None);
    }
}
