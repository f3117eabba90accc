//! 2D blit composition
//!
//! The [`Composer`] translates layers into blits of a [`BlitEngine`] against a render
//! target. It is the device side of device composition: everything the decision engine
//! kept out of client composition and off the overlay planes is drawn here.
//!
//! Engine handles are per thread. The first call of a thread opens one, thread exit
//! closes it again.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::allocator::{
        AllocError, Allocator, Memory, MemoryDesc, MemoryFlags, MemoryHandle, PixelFormat, Usage,
    },
    display::layer::{BlendMode, Layer, Transform},
    utils::{align_up, Physical, Rectangle},
};

pub mod engine;
#[cfg(feature = "backend_g2d")]
pub mod g2d;

pub use self::engine::{
    BlitEngine, EngineHandle, G2dBlendFunc, G2dCap, G2dFeature, G2dFormat, G2dRotation, G2dSurface,
    G2dSurfaceEx, G2dTiling,
};

/// Opaque black in the engine's clear colour layout
pub const CLEAR_COLOR: u32 = 0xff << 24;

/// Errors of the [`Composer`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No engine library is loaded
    #[error("The 2D engine is not loaded")]
    NotLoaded,
    /// The engine library lacks an entry point
    #[error("The 2D engine library lacks `{0}`")]
    MissingSymbol(&'static str),
    /// No engine handle could be opened for this thread
    #[error("No 2D engine handle for the current thread")]
    NoHandle,
    /// The engine returned an error code
    #[error("The 2D engine failed with code {0}")]
    Engine(i32),
    /// A layer has neither a buffer nor a colour to sample
    #[error("Layer {0} has nothing to sample")]
    NoSource(usize),
    /// The fill buffer could not be allocated
    #[error("Failed to allocate the fill buffer")]
    Alloc(#[from] AllocError),
}

/// Policy switches of the [`Composer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComposerPolicy {
    /// Never use the engine
    pub disabled: bool,
    /// Prefer device composition even where the engine is slower than the client
    pub force_2d: bool,
}

#[derive(Debug)]
struct DimBuffer {
    memory: MemoryHandle,
    color: u32,
}

#[derive(Default)]
struct ThreadHandles(HashMap<u64, (Arc<dyn BlitEngine>, EngineHandle)>);

impl Drop for ThreadHandles {
    fn drop(&mut self) {
        for (_, (engine, handle)) in self.0.drain() {
            engine.close(handle);
        }
    }
}

thread_local! {
    static HANDLES: RefCell<ThreadHandles> = RefCell::new(ThreadHandles::default());
}

static NEXT_COMPOSER_ID: AtomicU64 = AtomicU64::new(1);

/// Device composition through a 2D blit engine
pub struct Composer {
    id: u64,
    engine: Option<Arc<dyn BlitEngine>>,
    allocator: Option<Arc<dyn Allocator>>,
    policy: ComposerPolicy,
    dim: Mutex<Option<DimBuffer>>,
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Composer {
    /// Create a composer around an engine
    ///
    /// Without an engine every operation fails and [`Composer::is_valid`] is false.
    pub fn new(
        engine: Option<Arc<dyn BlitEngine>>,
        allocator: Option<Arc<dyn Allocator>>,
        policy: ComposerPolicy,
    ) -> Composer {
        if policy.disabled {
            info!("2D composition disabled");
        } else if policy.force_2d {
            info!("2D composition forced");
        }
        Composer {
            id: NEXT_COMPOSER_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            allocator,
            policy,
            dim: Mutex::new(None),
        }
    }

    /// Load the platform engine, falling back to a composer without engine
    pub fn load(allocator: Option<Arc<dyn Allocator>>, policy: ComposerPolicy) -> Composer {
        #[cfg(feature = "backend_g2d")]
        let engine = match g2d::G2dEngine::load() {
            Ok(engine) => Some(Arc::new(engine) as Arc<dyn BlitEngine>),
            Err(err) => {
                info!(%err, "2D engine unavailable");
                None
            }
        };
        #[cfg(not(feature = "backend_g2d"))]
        let engine = None;

        Composer::new(engine, allocator, policy)
    }

    fn engine(&self) -> Result<&Arc<dyn BlitEngine>, Error> {
        self.engine.as_ref().ok_or(Error::NotLoaded)
    }

    /// Engine handle of the calling thread, opened on first use
    fn handle(&self) -> Result<EngineHandle, Error> {
        let engine = self.engine()?;
        HANDLES.with(|handles| {
            let mut handles = handles.borrow_mut();
            if let Some((_, handle)) = handles.0.get(&self.id) {
                return Ok(*handle);
            }
            let handle = engine.open()?;
            trace!(composer = self.id, ?handle, "opened 2D engine handle");
            handles.0.insert(self.id, (engine.clone(), handle));
            Ok(handle)
        })
    }

    /// Whether the engine can be used from the calling thread
    pub fn is_valid(&self) -> bool {
        self.handle().is_ok()
    }

    /// Whether policy disables the engine
    pub fn is_disabled(&self) -> bool {
        self.policy.disabled
    }

    /// Whether policy forces device composition
    pub fn is_2d_forced(&self) -> bool {
        self.policy.force_2d
    }

    /// Whether the engine offers an optional feature
    pub fn is_feature_supported(&self, feature: G2dFeature) -> bool {
        match (self.engine(), self.handle()) {
            (Ok(engine), Ok(handle)) => engine.query_feature(handle, feature),
            _ => false,
        }
    }

    /// Whether the engine can sample buffers of `format`
    pub fn can_read(&self, format: PixelFormat) -> bool {
        engine_format(format).is_some()
    }

    /// Allocation size of a tiled buffer
    pub fn align_tile(&self, width: u32, height: u32, format: i32, usage: Usage) -> Option<(u32, u32)> {
        self.engine.as_ref()?.align_tile(width, height, format, usage.bits())
    }

    /// Clear `rect` of `target` to opaque black
    pub fn clear_rect(&self, target: &Memory, rect: Rectangle<Physical>) -> Result<(), Error> {
        if rect.is_empty() {
            return Ok(());
        }
        let engine = self.engine()?;
        let handle = self.handle()?;
        let mut surface = surface(target, ltrb(&rect));
        surface.base.clrcolor = CLEAR_COLOR as i32;
        trace!(?rect, "clear rect");
        engine.clear(handle, &surface.base)
    }

    /// Clear every part of `target` not covered by an opaque layer
    ///
    /// `layers` are in paint order. A layer is opaque if it doesn't blend, if it is the
    /// bottom-most premultiplied layer or if it is a dim layer of full alpha above the
    /// bottom-most one.
    #[profiling::function]
    pub fn clear_worm_hole(&self, target: &Memory, layers: &[&Layer]) -> Result<(), Error> {
        let mut opaque = Vec::new();
        for (i, layer) in layers.iter().enumerate() {
            if !layer.busy {
                error!(layer = layer.index, "clear worm hole: invalid layer");
                continue;
            }
            if is_opaque(layer, i == 0) {
                opaque.extend(layer.visible_region.iter().copied());
            }
        }

        let screen = Rectangle::from_loc_and_size((0, 0), (target.width() as i32, target.height() as i32));
        for hole in screen.subtract_rects(opaque) {
            if hole.is_empty() {
                continue;
            }
            trace!(?hole, "clear hole");
            self.clear_rect(target, hole)?;
        }
        Ok(())
    }

    /// Blit `layer` into `target`
    ///
    /// `bypass` is set for the bottom-most layer, which is drawn without blending and
    /// skipped entirely if it is a colour fill.
    #[profiling::function]
    pub fn compose_layer(&self, target: &Memory, layer: &Layer, bypass: bool) -> Result<(), Error> {
        if bypass && layer.is_solid_color() {
            trace!(layer = layer.index, "dim layer bypassed");
            return Ok(());
        }

        let srect = layer.source_crop;
        let drect = layer.display_frame;
        if (srect.is_empty() && !layer.is_solid_color()) || drect.is_empty() {
            error!(layer = layer.index, ?srect, ?drect, "invalid source crop or display frame");
            return Ok(());
        }

        let engine = self.engine()?;
        let handle = self.handle()?;

        let source = if layer.is_solid_color() {
            match self.dim_buffer(layer.color) {
                Ok(Some(memory)) => Some((memory, [0, 0, 1, 1])),
                Ok(None) => None,
                Err(err) => {
                    warn!(%err, "no fill buffer, clearing instead");
                    None
                }
            }
        } else {
            match layer.handle.as_ref() {
                Some(memory) => Some((memory.clone(), ltrb(&srect))),
                None => return Err(Error::NoSource(layer.index)),
            }
        };

        let dst_template = surface(target, ltrb(&drect));
        let (src_rot, dst_rot) = rotation(layer.transform);
        let (src_blend, dst_blend) = blend_funcs(layer.blend_mode);
        let blend = layer.blend_mode != BlendMode::None && !bypass;

        for visible in &layer.visible_region {
            let Some(clip) = visible.intersection(drect).filter(|clip| !clip.is_empty()) else {
                trace!(layer = layer.index, ?visible, "clip outside display frame");
                continue;
            };
            let (left, top, right, bottom) = (clip.left(), clip.top(), clip.right(), clip.bottom());
            if let Err(err) = engine.set_clipping(handle, left, top, right, bottom) {
                debug!(%err, "clipping unavailable");
            }
            trace!(
                layer = layer.index,
                ?srect,
                ?clip,
                ?drect,
                transform = ?layer.transform,
                blend = ?layer.blend_mode,
                alpha = layer.plane_alpha,
                "compose layer"
            );

            let Some((memory, rect)) = source.as_ref() else {
                // no fill buffer, draw the colour directly
                let mut area = surface(target, ltrb(&clip)).base;
                area.clrcolor = layer.color as i32;
                engine.clear(handle, &area)?;
                continue;
            };

            let mut dst = dst_template;
            let mut src = surface(memory, *rect);
            src.base.rot = src_rot;
            dst.base.rot = dst_rot;
            if !bypass {
                src.base.blendfunc = src_blend;
                dst.base.blendfunc = dst_blend;
            }
            src.base.global_alpha = layer.plane_alpha as i32;

            if blend {
                engine.set_capability(handle, G2dCap::GlobalAlpha, true)?;
                engine.set_capability(handle, G2dCap::Blend, true)?;
            }
            let result = engine.blit(handle, &src, &dst);
            if blend {
                engine.set_capability(handle, G2dCap::Blend, false)?;
                engine.set_capability(handle, G2dCap::GlobalAlpha, false)?;
            }
            result?;
        }

        Ok(())
    }

    /// Wait until all queued blits are done
    pub fn finish(&self) -> Result<(), Error> {
        let engine = self.engine()?;
        engine.finish(self.handle()?)
    }

    /// The cached 1x1 fill buffer, cleared to `color`
    fn dim_buffer(&self, color: u32) -> Result<Option<MemoryHandle>, Error> {
        let Some(allocator) = self.allocator.as_ref() else {
            return Ok(None);
        };
        let mut dim = self.dim.lock().unwrap();
        if let Some(dim) = dim.as_ref().filter(|dim| dim.color == color) {
            return Ok(Some(dim.memory.clone()));
        }

        let memory = match dim.take() {
            Some(dim) => dim.memory,
            None => {
                let desc = MemoryDesc::new(1, 1, PixelFormat::Rgba8888)
                    .usage(Usage::HW_COMPOSER | Usage::HW_2D | Usage::HW_RENDER)
                    .flags(MemoryFlags::DIM_BUFFER);
                allocator.allocate(&desc)?
            }
        };
        let mut area = surface(&memory, [0, 0, 1, 1]).base;
        area.clrcolor = color as i32;
        self.engine()?.clear(self.handle()?, &area)?;
        *dim = Some(DimBuffer {
            memory: memory.clone(),
            color,
        });
        Ok(Some(memory))
    }
}

fn is_opaque(layer: &Layer, bottom: bool) -> bool {
    match layer.blend_mode {
        BlendMode::None => true,
        BlendMode::Premultiplied => bottom,
        BlendMode::Dim => !bottom && (layer.color >> 24) & 0xff == 0xff,
        _ => false,
    }
}

fn ltrb<Kind>(rect: &Rectangle<Kind>) -> [i32; 4] {
    [rect.left(), rect.top(), rect.right(), rect.bottom()]
}

/// Engine format of a pixel format, `None` for formats the engine can't read
pub fn engine_format(format: PixelFormat) -> Option<G2dFormat> {
    Some(match format {
        PixelFormat::Rgba8888 => G2dFormat::Rgba8888,
        PixelFormat::Rgbx8888 => G2dFormat::Rgbx8888,
        PixelFormat::Rgb565 => G2dFormat::Rgb565,
        PixelFormat::Bgra8888 => G2dFormat::Bgra8888,
        PixelFormat::Nv21 => G2dFormat::Nv21,
        PixelFormat::Nv12 | PixelFormat::Nv12Tiled => G2dFormat::Nv12,
        PixelFormat::I420 => G2dFormat::I420,
        PixelFormat::Yv12 => G2dFormat::Yv12,
        PixelFormat::Nv16 => G2dFormat::Nv16,
        PixelFormat::Yuyv => G2dFormat::Yuyv,
        _ => return None,
    })
}

/// Describe `memory` with the crop rectangle `[left, top, right, bottom]`
pub fn surface(memory: &Memory, [left, top, right, bottom]: [i32; 4]) -> G2dSurfaceEx {
    let format = engine_format(memory.format()).unwrap_or_else(|| {
        error!(format = ?memory.format(), "unsupported 2D engine format");
        G2dFormat::Rgba8888
    });
    let stride = memory.stride() as i64;
    let height = memory.height() as i64;
    let aligned_height = if memory.format().is_yuv() {
        align_up(memory.height(), 16) as i64
    } else {
        height
    };

    let mut surface = G2dSurfaceEx {
        tiling: if memory.format() == PixelFormat::Nv12Tiled {
            G2dTiling::AmphionTiled
        } else {
            G2dTiling::Linear
        },
        ..Default::default()
    };
    let base = &mut surface.base;
    base.format = format;
    base.stride = stride as i32;
    base.planes[0] = memory.phys() as _;

    let p0 = base.planes[0] as i64;
    match format {
        G2dFormat::Nv12 | G2dFormat::Nv21 | G2dFormat::Nv16 => {
            base.planes[1] = (p0 + stride * aligned_height) as _;
        }
        G2dFormat::I420 | G2dFormat::Yv12 => {
            let c_stride = (stride / 2 + 15) / 16 * 16;
            let first_chroma = p0 + stride * height;
            let second_chroma = first_chroma + c_stride * height / 2;
            if format == G2dFormat::I420 {
                base.planes[1] = first_chroma as _;
                base.planes[2] = second_chroma as _;
            } else {
                base.planes[2] = first_chroma as _;
                base.planes[1] = second_chroma as _;
            }
        }
        _ => {}
    }

    base.left = left;
    base.top = top;
    base.right = right;
    base.bottom = bottom;
    base.width = memory.width() as i32;
    base.height = memory.height() as i32;
    surface
}

/// `(source, destination)` rotation for a layer transform
///
/// Flips combined with a 90 degree rotation flip the source and rotate the destination.
pub fn rotation(transform: Transform) -> (G2dRotation, G2dRotation) {
    use G2dRotation::*;

    const FLIP_H: u32 = Transform::FLIP_H.bits();
    const FLIP_V: u32 = Transform::FLIP_V.bits();
    const ROT_90: u32 = Transform::ROT_90.bits();

    match transform.bits() {
        0 => (Rotation0, Rotation0),
        ROT_90 => (Rotation0, Rotation90),
        b if b == FLIP_H | FLIP_V => (Rotation0, Rotation180),
        b if b == FLIP_H | FLIP_V | ROT_90 => (Rotation0, Rotation270),
        FLIP_H => (Rotation0, FlipH),
        FLIP_V => (Rotation0, FlipV),
        b if b == FLIP_H | ROT_90 => (FlipH, Rotation90),
        b if b == FLIP_V | ROT_90 => (FlipV, Rotation90),
        _ => (Rotation0, Rotation0),
    }
}

/// `(source, destination)` blend factors for a blend mode
pub fn blend_funcs(mode: BlendMode) -> (G2dBlendFunc, G2dBlendFunc) {
    match mode {
        BlendMode::Coverage => (G2dBlendFunc::SrcAlpha, G2dBlendFunc::OneMinusSrcAlpha),
        _ => (G2dBlendFunc::One, G2dBlendFunc::OneMinusSrcAlpha),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Arc;

    use super::{engine::test::*, *};
    use crate::{
        backend::allocator::{test::*, Memory, MemoryDesc},
        display::layer::{LayerType, Transform},
    };

    pub fn composer(engine: &Arc<MockEngine>) -> Composer {
        Composer::new(
            Some(engine.clone() as Arc<dyn BlitEngine>),
            Some(Arc::new(MockAllocator::default())),
            ComposerPolicy::default(),
        )
    }

    fn layer(index: usize, blend: BlendMode, frame: (i32, i32, i32, i32)) -> Layer {
        let mut layer = Layer::new(index);
        layer.busy = true;
        layer.orig_type = LayerType::Device;
        layer.type_ = LayerType::Device;
        layer.blend_mode = blend;
        layer.handle = Some(buffer(frame.2 as u32, frame.3 as u32, PixelFormat::Rgba8888));
        layer.source_crop = Rectangle::from_loc_and_size((0, 0), (frame.2, frame.3));
        layer.display_frame = Rectangle::from_loc_and_size((frame.0, frame.1), (frame.2, frame.3));
        layer.visible_region = vec![layer.display_frame];
        layer
    }

    fn clears(ops: &[Op]) -> Vec<[i32; 4]> {
        ops.iter()
            .filter_map(|op| match op {
                Op::Clear(s) => Some([s.left, s.top, s.right, s.bottom]),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn missing_engine_is_invalid() {
        let composer = Composer::new(None, None, ComposerPolicy::default());
        assert!(!composer.is_valid());
        assert!(!composer.is_feature_supported(G2dFeature::Rotation));
        assert!(matches!(composer.finish(), Err(Error::NotLoaded)));
    }

    #[test]
    fn failing_open_is_invalid() {
        let engine = Arc::new(MockEngine {
            fail_open: true,
            ..Default::default()
        });
        assert!(!composer(&engine).is_valid());
    }

    #[test]
    fn handle_is_opened_once_per_thread_and_closed_on_exit() {
        let engine = Arc::new(MockEngine::default());
        let composer = Arc::new(composer(&engine));
        assert!(composer.is_valid());
        assert!(composer.is_valid());
        assert_eq!(engine.take(), vec![Op::Open]);

        let other = composer.clone();
        std::thread::spawn(move || assert!(other.is_valid())).join().unwrap();
        assert_eq!(engine.take(), vec![Op::Open, Op::Close]);
    }

    #[test]
    fn opaque_bottom_layer_leaves_no_hole() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let bottom = layer(0, BlendMode::Premultiplied, (0, 0, 100, 100));
        composer.clear_worm_hole(&target, &[&bottom]).unwrap();
        assert!(clears(&engine.take()).is_empty());
    }

    #[test]
    fn premultiplied_above_bottom_is_not_opaque() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let bottom = layer(0, BlendMode::None, (0, 0, 100, 50));
        let top = layer(1, BlendMode::Premultiplied, (0, 50, 100, 50));
        composer.clear_worm_hole(&target, &[&bottom, &top]).unwrap();
        let ops = engine.take();
        assert_eq!(clears(&ops), vec![[0, 50, 100, 100]]);
        assert!(ops
            .iter()
            .all(|op| !matches!(op, Op::Clear(s) if s.clrcolor != CLEAR_COLOR as i32)));
    }

    #[test]
    fn dim_layer_is_opaque_only_with_full_alpha() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let bottom = layer(0, BlendMode::None, (0, 0, 100, 50));
        let mut dim = layer(1, BlendMode::Dim, (0, 50, 100, 50));
        dim.color = 0x80ff_ffff;
        composer.clear_worm_hole(&target, &[&bottom, &dim]).unwrap();
        assert_eq!(clears(&engine.take()), vec![[0, 50, 100, 100]]);

        dim.color = 0xff00_0000;
        composer.clear_worm_hole(&target, &[&bottom, &dim]).unwrap();
        assert!(clears(&engine.take()).is_empty());
    }

    #[test]
    fn rotation_mapping() {
        use G2dRotation::*;
        assert_eq!(rotation(Transform::empty()), (Rotation0, Rotation0));
        assert_eq!(rotation(Transform::ROT_90), (Rotation0, Rotation90));
        assert_eq!(rotation(Transform::ROT_180), (Rotation0, Rotation180));
        assert_eq!(rotation(Transform::ROT_270), (Rotation0, Rotation270));
        assert_eq!(rotation(Transform::FLIP_H), (Rotation0, FlipH));
        assert_eq!(rotation(Transform::FLIP_V), (Rotation0, FlipV));
        assert_eq!(rotation(Transform::FLIP_H | Transform::ROT_90), (FlipH, Rotation90));
        assert_eq!(rotation(Transform::FLIP_V | Transform::ROT_90), (FlipV, Rotation90));
    }

    #[test]
    fn blend_factors() {
        use G2dBlendFunc::*;
        assert_eq!(blend_funcs(BlendMode::Coverage), (SrcAlpha, OneMinusSrcAlpha));
        assert_eq!(blend_funcs(BlendMode::Premultiplied), (One, OneMinusSrcAlpha));
        assert_eq!(blend_funcs(BlendMode::Dim), (One, OneMinusSrcAlpha));
        assert_eq!(blend_funcs(BlendMode::None), (One, OneMinusSrcAlpha));
    }

    #[test]
    fn yuv_plane_layout() {
        let nv12 = Memory::new(&MemoryDesc::new(64, 40, PixelFormat::Nv12), None, 0x1000);
        let s = surface(&nv12, [0, 0, 64, 40]).base;
        assert_eq!(s.format, G2dFormat::Nv12);
        assert_eq!(s.planes[1], 0x1000 + 64 * 48);

        let i420 = Memory::new(&MemoryDesc::new(64, 40, PixelFormat::I420), None, 0x1000);
        let s = surface(&i420, [0, 0, 64, 40]).base;
        assert_eq!(s.planes[1], 0x1000 + 64 * 40);
        assert_eq!(s.planes[2], 0x1000 + 64 * 40 + 32 * 20);

        let yv12 = Memory::new(&MemoryDesc::new(64, 40, PixelFormat::Yv12), None, 0x1000);
        let s = surface(&yv12, [0, 0, 64, 40]).base;
        assert_eq!(s.planes[2], 0x1000 + 64 * 40);
        assert_eq!(s.planes[1], 0x1000 + 64 * 40 + 32 * 20);

        let tiled = Memory::new(&MemoryDesc::new(64, 40, PixelFormat::Nv12Tiled), None, 0);
        assert_eq!(surface(&tiled, [0, 0, 64, 40]).tiling, G2dTiling::AmphionTiled);
    }

    #[test]
    fn blending_is_toggled_around_the_blit() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let mut top = layer(1, BlendMode::Coverage, (10, 10, 50, 50));
        top.plane_alpha = 0x80;
        composer.is_valid();
        engine.take();

        composer.compose_layer(&target, &top, false).unwrap();
        let ops = engine.take();
        assert_eq!(ops[0], Op::Clip(10, 10, 60, 60));
        assert_eq!(ops[1], Op::Capability(G2dCap::GlobalAlpha, true));
        assert_eq!(ops[2], Op::Capability(G2dCap::Blend, true));
        let Op::Blit { src, dst } = &ops[3] else {
            panic!("expected a blit, got {:?}", ops[3]);
        };
        assert_eq!(src.base.global_alpha, 0x80);
        assert_eq!(src.base.blendfunc, G2dBlendFunc::SrcAlpha);
        assert_eq!(dst.base.blendfunc, G2dBlendFunc::OneMinusSrcAlpha);
        assert_eq!([dst.base.left, dst.base.top, dst.base.right, dst.base.bottom], [10, 10, 60, 60]);
        assert_eq!(ops[4], Op::Capability(G2dCap::Blend, false));
        assert_eq!(ops[5], Op::Capability(G2dCap::GlobalAlpha, false));
        assert_eq!(ops.len(), 6);
    }

    #[test]
    fn bypass_disables_blending() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let bottom = layer(0, BlendMode::Premultiplied, (0, 0, 100, 100));
        composer.is_valid();
        engine.take();

        composer.compose_layer(&target, &bottom, true).unwrap();
        let ops = engine.take();
        assert_eq!(ops.len(), 2);
        let Op::Blit { src, dst } = &ops[1] else {
            panic!("expected a blit, got {:?}", ops[1]);
        };
        assert_eq!(src.base.blendfunc, G2dBlendFunc::Zero);
        assert_eq!(dst.base.blendfunc, G2dBlendFunc::Zero);
    }

    #[test]
    fn visible_region_outside_frame_is_skipped() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let mut top = layer(1, BlendMode::None, (0, 0, 50, 50));
        top.visible_region = vec![
            Rectangle::from_loc_and_size((60, 60), (10, 10)),
            Rectangle::from_loc_and_size((0, 0), (20, 20)),
        ];
        composer.is_valid();
        engine.take();

        composer.compose_layer(&target, &top, false).unwrap();
        let ops = engine.take();
        assert_eq!(ops[0], Op::Clip(0, 0, 20, 20));
        assert_eq!(ops.iter().filter(|op| matches!(op, Op::Blit { .. })).count(), 1);
    }

    #[test]
    fn solid_color_samples_the_fill_buffer() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let mut dim = layer(1, BlendMode::Dim, (0, 0, 100, 100));
        dim.type_ = LayerType::SolidColor;
        dim.handle = None;
        dim.color = 0x8000_0000;
        composer.is_valid();
        engine.take();

        // bottom-most fills are skipped
        composer.compose_layer(&target, &dim, true).unwrap();
        assert!(engine.take().is_empty());

        composer.compose_layer(&target, &dim, false).unwrap();
        let ops = engine.take();
        let Op::Clear(fill) = &ops[0] else {
            panic!("expected the fill buffer clear, got {:?}", ops[0]);
        };
        assert_eq!((fill.width, fill.height, fill.clrcolor), (1, 1, 0x8000_0000u32 as i32));
        let Op::Blit { src, .. } = ops.iter().find(|op| matches!(op, Op::Blit { .. })).unwrap() else {
            unreachable!()
        };
        assert_eq!([src.base.right, src.base.bottom], [1, 1]);

        // same colour reuses the cached fill buffer
        composer.compose_layer(&target, &dim, false).unwrap();
        assert!(engine.take().iter().all(|op| !matches!(op, Op::Clear(_))));
    }

    #[test]
    fn empty_display_frame_is_ignored() {
        let engine = Arc::new(MockEngine::default());
        let composer = composer(&engine);
        let target = buffer(100, 100, PixelFormat::Rgba8888);
        let mut top = layer(1, BlendMode::None, (0, 0, 50, 50));
        top.display_frame = Rectangle::default();
        composer.is_valid();
        engine.take();
        composer.compose_layer(&target, &top, false).unwrap();
        assert!(engine.take().is_empty());
    }
}
