use std::{cmp::Ordering, marker::PhantomData, mem::MaybeUninit, time::Duration};

/// Monotonic clock, the time base of vsync timestamps and fences
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> libc::clockid_t {
        libc::CLOCK_MONOTONIC
    }
}

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> libc::clockid_t;
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind> {
    clk_id: libc::clockid_t,
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    pub fn new() -> std::io::Result<Self> {
        let clk_id = Kind::id();
        clock_get_time(clk_id)?;
        Ok(Clock {
            clk_id,
            _kind: PhantomData,
        })
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Kind> {
        clock_get_time(self.clk_id)
            .expect("failed to get clock time")
            .into()
    }
}

impl<Kind> Clone for Clock<Kind> {
    fn clone(&self) -> Self {
        Clock {
            clk_id: self.clk_id,
            _kind: PhantomData,
        }
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    tp: libc::timespec,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Create a time from nanoseconds since the clock epoch
    pub fn from_nanos(nanos: i64) -> Self {
        let nanos = nanos.max(0);
        Time {
            tp: libc::timespec {
                tv_sec: (nanos / NANOS_PER_SEC as i64) as libc::time_t,
                tv_nsec: (nanos % NANOS_PER_SEC as i64) as _,
            },
            _kind: PhantomData,
        }
    }

    /// Nanoseconds since the clock epoch
    pub fn as_nanos(&self) -> i64 {
        self.tp.tv_sec as i64 * NANOS_PER_SEC as i64 + self.tp.tv_nsec as i64
    }

    /// Gets the duration between self and a later time
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        saturating_sub_timespec(later.tp, self.tp).unwrap_or(Duration::ZERO)
    }

    /// Returns the time `duration` after self
    pub fn add(&self, duration: Duration) -> Time<Kind> {
        Time::from_nanos(self.as_nanos().saturating_add(duration.as_nanos() as i64))
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time")
            .field("tv_sec", &self.tp.tv_sec)
            .field("tv_nsec", &self.tp.tv_nsec)
            .finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.tp.tv_sec == other.tp.tv_sec && self.tp.tv_nsec == other.tp.tv_nsec
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        let tv_sec = self.tp.tv_sec.cmp(&other.tp.tv_sec);

        if tv_sec == Ordering::Equal {
            self.tp.tv_nsec.cmp(&other.tp.tv_nsec)
        } else {
            tv_sec
        }
    }
}

impl<Kind> From<libc::timespec> for Time<Kind> {
    fn from(tp: libc::timespec) -> Self {
        Time {
            tp,
            _kind: PhantomData,
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_pointer_width = "32"))]
const NANOS_PER_SEC: i64 = 1_000_000_000;

#[cfg(not(all(target_arch = "x86_64", target_pointer_width = "32")))]
const NANOS_PER_SEC: std::os::raw::c_long = 1_000_000_000;

fn saturating_sub_timespec(lhs: libc::timespec, rhs: libc::timespec) -> Option<Duration> {
    if let Some(mut secs) = lhs.tv_sec.checked_sub(rhs.tv_sec) {
        let nanos = if lhs.tv_nsec >= rhs.tv_nsec {
            lhs.tv_nsec - rhs.tv_nsec
        } else if let Some(sub_secs) = secs.checked_sub(1) {
            secs = sub_secs;
            lhs.tv_nsec + NANOS_PER_SEC - rhs.tv_nsec
        } else {
            return None;
        };
        debug_assert!(nanos < NANOS_PER_SEC);
        Some(Duration::new(secs as u64, nanos as u32))
    } else {
        None
    }
}

fn clock_get_time(clk_id: libc::clockid_t) -> Result<libc::timespec, std::io::Error> {
    let mut tp = MaybeUninit::zeroed();
    unsafe {
        let res = libc::clock_gettime(clk_id, tp.as_mut_ptr());

        if res < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(tp.assume_init())
    }
}

/// Current monotonic time in nanoseconds
pub fn monotonic_nanos() -> i64 {
    let now = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    now.tv_sec as i64 * NANOS_PER_SEC as i64 + now.tv_nsec as i64
}

/// Returns the first vsync strictly after `now` that is in phase with `previous`
///
/// `previous + k * period` for the smallest `k >= 1` with a result greater than `now`,
/// e.g. period 50, previous 500, now 510 yields 550.
pub fn next_vsync_in_phase(period_ns: i64, previous_ns: i64, now_ns: i64) -> i64 {
    if period_ns <= 0 {
        return now_ns;
    }
    let elapsed = (now_ns - previous_ns).max(0);
    previous_ns + (elapsed / period_ns + 1) * period_ns
}
