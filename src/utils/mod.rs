//! Various utilities functions and types

mod cancel;
pub mod clock;
mod fd;
mod geometry;

pub use self::cancel::CancellationToken;
pub use self::clock::{monotonic_nanos, next_vsync_in_phase, Clock, Monotonic, Time};
pub use self::fd::{DevPath, DeviceFd};
pub use self::geometry::{Buffer, Physical, Point, Rectangle, Size};

/// Read a small sysfs attribute, trimming surrounding whitespace
pub(crate) fn read_sysfs(path: impl AsRef<std::path::Path>) -> std::io::Result<String> {
    std::fs::read_to_string(path).map(|s| s.trim().to_owned())
}

/// Align `value` up to the next multiple of `align` (a power of two)
#[inline]
pub(crate) const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Route log output of the running test to the test harness, honoring `RUST_LOG`
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
