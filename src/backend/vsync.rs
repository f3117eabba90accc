//! Per display vsync event thread
//!
//! Every physical display runs one [`VsyncThread`]. While vsync events are enabled the
//! thread blocks on the hardware source of its display and forwards each vsync to the
//! [`EventSink`] of the display. If the hardware source can't be used, or software vsync
//! is forced, the thread falls back to a timer ticking at the configured refresh period.
//!
//! Dropping the [`VsyncThread`] cancels and joins the thread. A thread blocked on a kernel
//! source notices the cancellation after the next vsync at the latest.

use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    backend::drm::KmsDevice,
    display::EventSink,
    utils::{monotonic_nanos, CancellationToken, Clock, Monotonic, Time},
};

/// Hardware the vsync events come from
#[derive(Debug, Clone)]
pub enum VsyncSource {
    /// A sysfs node returning `VSYNC=<timestamp>` on every vsync
    Kernel(PathBuf),
    /// Vertical blank events of a DRM CRTC
    Drm {
        /// Device the CRTC belongs to
        device: Arc<dyn KmsDevice>,
        /// Index of the CRTC
        pipe: u32,
    },
    /// A timer at the refresh period of the display
    Software,
}

#[derive(Debug, Default)]
struct Shared {
    enabled: Mutex<bool>,
    cond: Condvar,
}

/// Handle of a running vsync thread
#[derive(Debug)]
pub struct VsyncThread {
    shared: Arc<Shared>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl VsyncThread {
    /// Start the vsync thread of the display `sink` reports to
    ///
    /// Events are only generated after [`VsyncThread::set_enabled`].
    pub fn spawn(sink: Arc<EventSink>, source: VsyncSource) -> std::io::Result<VsyncThread> {
        let shared = Arc::new(Shared::default());
        let token = CancellationToken::new();
        let handle = std::thread::Builder::new().name(format!("vsync-{}", sink.display())).spawn({
            let shared = shared.clone();
            let token = token.clone();
            move || {
                let span = info_span!("vsync", display = sink.display());
                let _guard = span.enter();
                Worker::new(sink, source, shared, token).run();
            }
        })?;

        Ok(VsyncThread {
            shared,
            token,
            handle: Some(handle),
        })
    }

    /// Start or stop generating events
    pub fn set_enabled(&self, enabled: bool) {
        let mut guard = self.shared.enabled.lock().unwrap();
        *guard = enabled;
        self.shared.cond.notify_all();
    }
}

impl Drop for VsyncThread {
    fn drop(&mut self) {
        self.token.cancel();
        {
            let _guard = self.shared.enabled.lock().unwrap();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("vsync thread panicked");
            }
        }
    }
}

enum Source {
    Kernel(File),
    Drm { device: Arc<dyn KmsDevice>, pipe: u32 },
    Software,
}

struct Worker {
    sink: Arc<EventSink>,
    source: Source,
    shared: Arc<Shared>,
    token: CancellationToken,
    clock: Option<Clock<Monotonic>>,
    next_fake_vsync: i64,
}

impl Worker {
    fn new(
        sink: Arc<EventSink>,
        source: VsyncSource,
        shared: Arc<Shared>,
        token: CancellationToken,
    ) -> Worker {
        let source = match source {
            VsyncSource::Kernel(path) => match File::open(&path) {
                Ok(file) => {
                    info!(path = %path.display(), "using kernel vsync");
                    Source::Kernel(file)
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "no kernel vsync, using software vsync");
                    Source::Software
                }
            },
            VsyncSource::Drm { device, pipe } => Source::Drm { device, pipe },
            VsyncSource::Software => {
                info!("using software vsync");
                Source::Software
            }
        };
        let clock = match Clock::new() {
            Ok(clock) => Some(clock),
            Err(err) => {
                error!(%err, "no monotonic clock");
                None
            }
        };
        Worker {
            sink,
            source,
            shared,
            token,
            clock,
            next_fake_vsync: 0,
        }
    }

    /// Block while disabled, returns false once cancelled
    fn wait_enabled(&self) -> bool {
        let guard = self.shared.enabled.lock().unwrap();
        let _guard = self
            .shared
            .cond
            .wait_while(guard, |enabled| !*enabled && !self.token.is_cancelled())
            .unwrap();
        !self.token.is_cancelled()
    }

    fn run(mut self) {
        while self.wait_enabled() {
            let timestamp = if let Source::Drm { device, pipe } = &self.source {
                let (device, pipe) = (device.clone(), *pipe);
                self.drm_vsync(device, pipe)
            } else if let Source::Kernel(file) = &self.source {
                self.kernel_vsync(file)
            } else {
                self.software_vsync()
            };
            if self.token.is_cancelled() {
                break;
            }
            if let Some(timestamp) = timestamp {
                trace!(timestamp, "vsync");
                self.sink.vsync(timestamp);
            }
        }
        debug!("vsync thread exiting");
    }

    fn fall_back(&mut self) -> Option<i64> {
        self.source = Source::Software;
        self.software_vsync()
    }

    fn kernel_vsync(&self, file: &File) -> Option<i64> {
        let mut buf = [0u8; 64];
        let len = match file.read_at(&mut buf, 0) {
            Ok(len) => len,
            Err(err) => {
                error!(%err, "failed to read vsync node");
                // avoid spinning on a broken node
                self.token.sleep(Duration::from_nanos(self.sink.vsync_period().max(0) as u64));
                return None;
            }
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        match parse_kernel_timestamp(&text) {
            Some(timestamp) => Some(timestamp),
            None => {
                warn!(?text, "malformed vsync event");
                None
            }
        }
    }

    fn drm_vsync(&mut self, device: Arc<dyn KmsDevice>, pipe: u32) -> Option<i64> {
        match device.wait_vblank(pipe) {
            Ok(timestamp) => Some(timestamp),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => None,
            Err(err) => {
                warn!(pipe, %err, "vblank wait failed, using software vsync");
                self.fall_back()
            }
        }
    }

    fn software_vsync(&mut self) -> Option<i64> {
        let period = self.sink.vsync_period();
        let now = monotonic_nanos();
        let (sleep, timestamp) = software_deadline(now, self.next_fake_vsync, period);
        self.next_fake_vsync = timestamp + period;

        let cancelled = match &self.clock {
            Some(clock) => self.token.sleep_until(clock, Time::from_nanos(timestamp)),
            None => self.token.sleep(Duration::from_nanos(sleep.max(0) as u64)),
        };
        (!cancelled).then_some(timestamp)
    }
}

/// Sleep time and timestamp of the next software vsync
///
/// A missed deadline resynchronizes to the next period boundary after `now`.
pub fn software_deadline(now: i64, next: i64, period: i64) -> (i64, i64) {
    let sleep = next - now;
    if sleep >= 0 || period <= 0 {
        return (sleep.max(0), next.max(now));
    }
    let sleep = period - ((now - next) % period);
    (sleep, now + sleep)
}

/// Timestamp of a `VSYNC=<timestamp>` event of a kernel vsync node
pub fn parse_kernel_timestamp(text: &str) -> Option<i64> {
    scan_fmt::scan_fmt!(text.trim(), "VSYNC={d}", i64).ok()
}

#[cfg(test)]
mod test {
    use std::{
        io::Write,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::display::{test::Recorder, EventSink};

    #[test]
    fn deadline_in_the_future() {
        assert_eq!(software_deadline(1_000, 17_000, 16_000), (16_000, 17_000));
    }

    #[test]
    fn missed_deadline_resynchronizes() {
        // 2.5 periods late
        let (sleep, next) = software_deadline(50_000, 10_000, 16_000);
        assert_eq!(sleep, 16_000 - (40_000 % 16_000));
        assert_eq!(next, 50_000 + sleep);
        assert_eq!((next - 10_000) % 16_000, 0);
    }

    #[test]
    fn first_deadline_fires_immediately() {
        let (sleep, next) = software_deadline(5_000, 0, 16_000);
        assert!(sleep > 0 && sleep <= 16_000);
        assert_eq!(next, 5_000 + sleep);
    }

    #[test]
    fn kernel_timestamps() {
        assert_eq!(parse_kernel_timestamp("VSYNC=123456789\n"), Some(123_456_789));
        assert_eq!(parse_kernel_timestamp("garbage"), None);
    }

    #[test]
    fn software_vsync_until_dropped() {
        let sink = EventSink::new(3);
        sink.set_vsync_period(2_000_000);
        let recorder = Arc::new(Recorder::default());
        sink.set_listener(Some(recorder.clone()));
        sink.set_vsync_enabled(true);

        let thread = VsyncThread::spawn(sink.clone(), VsyncSource::Software).unwrap();
        thread.set_enabled(true);
        std::thread::sleep(Duration::from_millis(30));
        thread.set_enabled(false);
        drop(thread);

        let events = recorder.take();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e == "vsync 3 2000000"));
        assert!(sink.last_vsync() > 0);
    }

    #[test]
    fn missing_kernel_node_falls_back() {
        let sink = EventSink::new(4);
        sink.set_vsync_period(1_000_000);
        sink.set_vsync_enabled(true);
        let source = VsyncSource::Kernel("/nonexistent/vsync".into());
        let thread = VsyncThread::spawn(sink.clone(), source).unwrap();
        thread.set_enabled(true);
        std::thread::sleep(Duration::from_millis(20));
        drop(thread);
        assert!(sink.last_vsync() > 0);
    }

    #[test]
    fn kernel_node_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"VSYNC=42\n").unwrap();
        let sink = EventSink::new(5);
        let seen = Arc::new(Mutex::new(0));
        let source = VsyncSource::Kernel(file.path().to_path_buf());
        let thread = VsyncThread::spawn(sink.clone(), source).unwrap();
        thread.set_enabled(true);
        for _ in 0..100 {
            if sink.last_vsync() == 42 {
                *seen.lock().unwrap() = 42;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(thread);
        assert_eq!(*seen.lock().unwrap(), 42);
    }
}
