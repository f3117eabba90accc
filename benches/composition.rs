use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::Rng;

use hwcomposer::{
    backend::{
        allocator::{Memory, MemoryDesc, PixelFormat},
        composer::{Composer, ComposerPolicy},
    },
    display::{Backend, Display, EventSink, LayerType, VirtualBackend},
    utils::{Physical, Rectangle, Size},
};

fn worm_hole(target: Rectangle<Physical>, opaque: &[Rectangle<Physical>]) -> usize {
    let mut workhouse = Vec::with_capacity(2048 * 4);
    workhouse.push(target);
    workhouse = Rectangle::subtract_rects_many_in_place(workhouse, opaque.iter().copied());
    workhouse
        .iter()
        .fold(0usize, |acc, item| acc + (item.size.w * item.size.h) as usize)
}

fn random_layers(display: &Display, rand: &mut impl Rng, count: usize) {
    display.invalidate_layers();
    for zorder in 0..count {
        let Some(index) = display.get_free_layer() else {
            return;
        };
        let w = rand.gen_range(16..1920);
        let h = rand.gen_range(16..1080);
        let x = rand.gen_range(0..1920 - w);
        let y = rand.gen_range(0..1080 - h);
        let format = if rand.gen_bool(0.2) {
            PixelFormat::Nv12
        } else {
            PixelFormat::Rgba8888
        };
        let handle = Arc::new(Memory::new(&MemoryDesc::new(w as u32, h as u32, format), None, 0));
        let _ = display.with_layer(index, |layer| {
            layer.zorder = zorder as u32;
            layer.orig_type = LayerType::Device;
            layer.handle = Some(handle);
            layer.source_crop = Rectangle::from_loc_and_size((0, 0), (w, h));
            layer.display_frame = Rectangle::from_loc_and_size((x, y), (w, h));
            layer.visible_region = vec![layer.display_frame];
        });
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut rand = rand::thread_rng();

    let stage: Size<Physical> = Size::from((1920, 1080));
    let target = Rectangle::from_loc_and_size((0, 0), stage);
    let opaque: Vec<Rectangle<Physical>> = (0..64)
        .map(|_| {
            let w = rand.gen_range(16..stage.w / 2);
            let h = rand.gen_range(16..stage.h / 2);
            let x = rand.gen_range(0..stage.w - w);
            let y = rand.gen_range(0..stage.h - h);
            Rectangle::from_loc_and_size((x, y), (w, h))
        })
        .collect();
    c.bench_function("worm hole of 64 layers", |b| b.iter(|| worm_hole(target, &opaque)));

    let composer = Arc::new(Composer::new(None, None, ComposerPolicy::default()));
    let backend = Backend::Virtual(VirtualBackend::new(1920, 1080, PixelFormat::Rgba8888));
    let display = Display::new(EventSink::new(10), backend, composer, false);
    c.bench_function("verify_layers 16 layers", |b| {
        b.iter_batched(
            || random_layers(&display, &mut rand, 16),
            |_| display.verify_layers(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
