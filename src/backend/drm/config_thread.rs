//! Deferred config changes
//!
//! A config change requested for a point in time is held back by the [`ConfigThread`]
//! until the first vsync at or after that time. The backend picks the change up with
//! [`ConfigThread::take_applied`] before presenting the next frame. Until that frame is
//! presented the thread asks the listener for a refresh once per vsync period.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, error, info_span, trace};

use crate::{
    display::{EventSink, VsyncPeriodTimeline},
    utils::{monotonic_nanos, next_vsync_in_phase, CancellationToken},
};

/// A config change that reached its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedConfig {
    /// Index of the new config
    pub index: usize,
    /// Whether the change needs a mode set
    pub modeset: bool,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    config: AppliedConfig,
    period: i64,
    applied_time: i64,
}

#[derive(Debug, Default)]
struct State {
    pending: Option<Pending>,
    applied: Option<AppliedConfig>,
    presented: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// Handle of the thread applying deferred config changes of one display
#[derive(Debug)]
pub struct ConfigThread {
    sink: Arc<EventSink>,
    shared: Arc<Shared>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConfigThread {
    /// Start the thread of the display `sink` reports to
    pub fn spawn(sink: Arc<EventSink>) -> std::io::Result<ConfigThread> {
        let shared = Arc::new(Shared::default());
        let token = CancellationToken::new();
        let handle = std::thread::Builder::new()
            .name(format!("config-{}", sink.display()))
            .spawn({
                let sink = sink.clone();
                let shared = shared.clone();
                let token = token.clone();
                move || {
                    let span = info_span!("config", display = sink.display());
                    let _guard = span.enter();
                    run(&sink, &shared, &token);
                }
            })?;

        Ok(ConfigThread {
            sink,
            shared,
            token,
            handle: Some(handle),
        })
    }

    /// Switch to the config `index` of period `period` at the first vsync after `desired_time`
    ///
    /// Replaces a change that didn't reach its deadline yet.
    pub fn schedule(
        &self,
        index: usize,
        period: i64,
        modeset: bool,
        desired_time: i64,
    ) -> VsyncPeriodTimeline {
        let timeline = self::timeline(
            self.sink.vsync_period(),
            self.sink.last_vsync(),
            monotonic_nanos(),
            desired_time,
        );
        debug!(
            display = self.sink.display(),
            config = index,
            modeset,
            applied_time = timeline.applied_time,
            "config change scheduled"
        );

        let mut state = self.shared.lock();
        state.pending = Some(Pending {
            config: AppliedConfig { index, modeset },
            period,
            applied_time: timeline.applied_time,
        });
        self.shared.cond.notify_all();
        timeline
    }

    /// The change that reached its deadline since the last call
    pub fn take_applied(&self) -> Option<AppliedConfig> {
        self.shared.lock().applied.take()
    }

    /// Whether a change is waiting for its deadline
    pub fn is_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// A frame got presented, stops the refresh requests of an applied change
    pub fn frame_presented(&self) {
        let mut state = self.shared.lock();
        if !state.presented {
            state.presented = true;
            self.shared.cond.notify_all();
        }
    }
}

impl Drop for ConfigThread {
    fn drop(&mut self) {
        self.token.cancel();
        {
            let _guard = self.shared.lock();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("config thread panicked");
            }
        }
    }
}

/// Timeline of a change requested at `now` for `desired_time`
///
/// The change happens at the first vsync in phase with `last_vsync` after the desired
/// time. The frame carrying it has to be presented one period earlier.
pub fn timeline(period: i64, last_vsync: i64, now: i64, desired_time: i64) -> VsyncPeriodTimeline {
    let target = desired_time.max(now);
    let applied_time = next_vsync_in_phase(period, last_vsync, target);
    VsyncPeriodTimeline {
        applied_time,
        refresh_required: true,
        refresh_time: (applied_time - period).max(now),
    }
}

fn nanos(ns: i64) -> Duration {
    Duration::from_nanos(ns.max(0) as u64)
}

fn run(sink: &EventSink, shared: &Shared, token: &CancellationToken) {
    let mut state = shared.lock();
    loop {
        if token.is_cancelled() {
            return;
        }
        let Some(pending) = state.pending else {
            state = shared.cond.wait(state).unwrap();
            continue;
        };

        let now = monotonic_nanos();
        if now < pending.applied_time {
            // a newer schedule replaces the deadline
            state = shared
                .cond
                .wait_timeout(state, nanos(pending.applied_time - now))
                .unwrap()
                .0;
            continue;
        }

        state.pending = None;
        state.applied = Some(pending.config);
        // only a frame carrying the new config ends the refreshes
        state.presented = false;
        drop(state);

        debug!(config = pending.config.index, "config change applied");
        sink.set_vsync_period(pending.period);
        sink.vsync_period_timing_changed(VsyncPeriodTimeline {
            applied_time: pending.applied_time,
            refresh_required: true,
            refresh_time: now,
        });

        state = shared.lock();
        while !state.presented && state.pending.is_none() && !token.is_cancelled() {
            drop(state);
            trace!("refresh for config change");
            sink.refresh();
            state = shared.lock();
            if state.presented || state.pending.is_some() {
                break;
            }
            state = shared.cond.wait_timeout(state, nanos(pending.period)).unwrap().0;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::display::test::Recorder;

    #[test]
    fn applied_in_phase_with_vsync() {
        // period 16 ms, last vsync at 100 ms, asked at 120 ms for 150 ms
        let later = timeline(16_000_000, 100_000_000, 120_000_000, 150_000_000);
        assert_eq!(later.applied_time, 164_000_000);
        assert_eq!(later.refresh_time, 148_000_000);
        assert!(later.refresh_required);

        // deadline in the past applies at the next vsync
        let past = timeline(16_000_000, 100_000_000, 120_000_000, 0);
        assert_eq!(past.applied_time, 132_000_000);
        assert_eq!(past.refresh_time, 120_000_000);
    }

    #[test]
    fn refresh_until_presented() {
        let sink = EventSink::new(3);
        let recorder = Arc::new(Recorder::default());
        sink.set_listener(Some(recorder.clone()));
        sink.set_vsync_period(2_000_000);
        sink.vsync(monotonic_nanos());

        let thread = ConfigThread::spawn(sink.clone()).unwrap();
        let timeline = thread.schedule(1, 4_000_000, true, monotonic_nanos() + 5_000_000);
        assert!(timeline.applied_time > monotonic_nanos());
        assert!(thread.is_pending());
        assert_eq!(thread.take_applied(), None);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(thread.take_applied(), Some(AppliedConfig { index: 1, modeset: true }));
        assert_eq!(thread.take_applied(), None);
        assert_eq!(sink.vsync_period(), 4_000_000);

        thread.frame_presented();
        std::thread::sleep(Duration::from_millis(10));
        let events = recorder.take();
        assert_eq!(events[0], "timing 3 true");
        assert!(events[1..].iter().all(|e| e == "refresh 3"));
        assert!(events.len() > 1);

        std::thread::sleep(Duration::from_millis(20));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn frames_before_the_deadline_dont_cancel_the_refresh() {
        let sink = EventSink::new(3);
        let recorder = Arc::new(Recorder::default());
        sink.set_listener(Some(recorder.clone()));
        sink.set_vsync_period(2_000_000);
        sink.vsync(monotonic_nanos());

        let thread = ConfigThread::spawn(sink.clone()).unwrap();
        thread.schedule(1, 4_000_000, false, monotonic_nanos() + 10_000_000);
        // a frame still using the old config
        std::thread::sleep(Duration::from_millis(2));
        thread.frame_presented();

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(thread.take_applied(), Some(AppliedConfig { index: 1, modeset: false }));
        thread.frame_presented();
        std::thread::sleep(Duration::from_millis(10));
        let events = recorder.take();
        assert_eq!(events[0], "timing 3 true");
        assert!(events[1..].contains(&"refresh 3".to_string()));
    }

    #[test]
    fn dropping_stops_the_thread() {
        let sink = EventSink::new(4);
        let thread = ConfigThread::spawn(sink).unwrap();
        thread.schedule(0, 16_000_000, false, monotonic_nanos() + 10_000_000_000);
        drop(thread);
    }
}
