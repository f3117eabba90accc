//! Atomic property sets and their commit

use std::{io, os::unix::io::OwnedFd, time::Duration};

use smallvec::SmallVec;
use tracing::{error, trace, warn};

use super::{
    device::KmsDevice,
    error::{AccessError, Error},
};

/// Attempts of [`commit_with_retry`] before giving up on a busy kernel
pub const MAX_COMMIT_RETRY_COUNT: usize = 32;

const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(1);

bitflags::bitflags! {
    /// Flags of an atomic commit, values as in `DRM_MODE_ATOMIC_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommitFlags: u32 {
        /// Generate a page flip event
        const PAGE_FLIP_EVENT = 0x01;
        /// Only validate the request
        const TEST_ONLY = 0x0100;
        /// Return before the commit is applied
        const NONBLOCK = 0x0200;
        /// The request may change the mode
        const ALLOW_MODESET = 0x0400;
    }
}

/// Set of property changes applied by one atomic commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    properties: SmallVec<[(u32, u32, u64); 32]>,
    out_fence: Option<(u32, u32)>,
}

impl AtomicRequest {
    /// An empty request
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    /// Set `property` of `object` to `value`
    ///
    /// Properties the device doesn't expose have id 0 and are skipped.
    pub fn add(&mut self, object: u32, property: u32, value: u64) -> &mut Self {
        if property == 0 || object == 0 {
            trace!(object, "skipping unsupported property");
            return self;
        }
        match self
            .properties
            .iter_mut()
            .find(|(o, p, _)| *o == object && *p == property)
        {
            Some(entry) => entry.2 = value,
            None => self.properties.push((object, property, value)),
        }
        self
    }

    /// Take over every property set in `other`
    pub fn merge(&mut self, other: &AtomicRequest) -> &mut Self {
        for &(object, property, value) in &other.properties {
            self.add(object, property, value);
        }
        self
    }

    /// Ask the kernel for a fence signaled once the commit is on screen
    pub fn request_out_fence(&mut self, crtc: u32, property: u32) -> &mut Self {
        if property != 0 {
            self.out_fence = Some((crtc, property));
        }
        self
    }

    /// Value set for `property` of `object`
    pub fn get(&self, object: u32, property: u32) -> Option<u64> {
        self.properties
            .iter()
            .find(|(o, p, _)| *o == object && *p == property)
            .map(|(_, _, v)| *v)
    }

    /// All `(object, property, value)` triples in insertion order
    pub fn properties(&self) -> &[(u32, u32, u64)] {
        &self.properties
    }

    /// CRTC and property receiving the out fence
    pub fn out_fence(&self) -> Option<(u32, u32)> {
        self.out_fence
    }

    /// Whether nothing is set
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Convert to 16.16 fixed point as used by the `SRC_*` plane properties
#[inline]
pub fn to_fixed(value: u32) -> u64 {
    (value as u64) << 16
}

/// Commit `request`, retrying while the kernel reports `EBUSY`
///
/// The display controller holds at most two frames in flight, so a busy kernel
/// usually frees up within a millisecond. Other errors are returned at once.
/// Returns the out fence if one was requested.
#[profiling::function]
pub fn commit_with_retry(
    device: &dyn KmsDevice,
    request: &AtomicRequest,
    flags: CommitFlags,
) -> Result<Option<OwnedFd>, Error> {
    commit_attempts(device, request, flags, MAX_COMMIT_RETRY_COUNT)
}

fn commit_attempts(
    device: &dyn KmsDevice,
    request: &AtomicRequest,
    flags: CommitFlags,
    attempts: usize,
) -> Result<Option<OwnedFd>, Error> {
    let mut last_error: Option<io::Error> = None;
    for attempt in 0..attempts {
        match device.commit(request, flags) {
            Ok(fence) => {
                if attempt > 0 {
                    trace!(attempt, "atomic commit succeeded after retry");
                }
                return Ok(fence);
            }
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                trace!(attempt, "atomic commit busy");
                last_error = Some(err);
                if attempt + 1 < attempts {
                    std::thread::sleep(COMMIT_RETRY_DELAY);
                }
            }
            Err(source) => {
                error!(?flags, %source, "atomic commit failed");
                return Err(Error::Access(AccessError {
                    errmsg: "Failed to commit atomic request",
                    dev: device.path(),
                    source,
                }));
            }
        }
    }

    if let Some(err) = last_error {
        warn!(%err, "kernel busy for every commit attempt");
    }
    error!(attempts, "atomic commit retries exhausted");
    Err(Error::CommitRetriesExhausted(attempts))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::drm::device::test::MockKmsDevice;

    fn busy() -> io::Error {
        io::Error::from_raw_os_error(libc::EBUSY)
    }

    fn request() -> AtomicRequest {
        let mut request = AtomicRequest::new();
        request.add(31, 5, 1).add(40, 0, 3).add(31, 5, 2);
        request
    }

    #[test]
    fn missing_properties_are_skipped() {
        let request = request();
        assert_eq!(request.properties(), &[(31, 5, 2)]);
        assert_eq!(request.get(40, 0), None);
    }

    #[test]
    fn fixed_point() {
        assert_eq!(to_fixed(0), 0);
        assert_eq!(to_fixed(1), 0x1_0000);
        assert_eq!(to_fixed(1920), 1920 << 16);
        assert_eq!(to_fixed(u32::MAX), (u32::MAX as u64) << 16);
    }

    #[test]
    fn busy_then_success() {
        let device = MockKmsDevice::default();
        device.script((0..5).map(|_| Err(busy())).chain(Some(Ok(()))));
        commit_with_retry(&device, &request(), CommitFlags::NONBLOCK).unwrap();
        assert_eq!(device.commits().len(), 6);
    }

    #[test]
    fn busy_forever() {
        let device = MockKmsDevice::default();
        device.script((0..MAX_COMMIT_RETRY_COUNT).map(|_| Err(busy())));
        let err = commit_with_retry(&device, &request(), CommitFlags::NONBLOCK).unwrap_err();
        assert!(matches!(err, Error::CommitRetriesExhausted(MAX_COMMIT_RETRY_COUNT)));
        assert_eq!(device.commits().len(), MAX_COMMIT_RETRY_COUNT);
    }

    #[test]
    fn last_busy_attempt_returns_at_once() {
        let device = MockKmsDevice::default();
        device.script(Some(Err(busy())));
        let start = std::time::Instant::now();
        let err = commit_attempts(&device, &request(), CommitFlags::NONBLOCK, 1).unwrap_err();
        assert!(start.elapsed() < COMMIT_RETRY_DELAY);
        assert!(matches!(err, Error::CommitRetriesExhausted(1)));
        assert_eq!(device.commits().len(), 1);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let device = MockKmsDevice::default();
        device.script(Some(Err(io::Error::from_raw_os_error(libc::EINVAL))));
        let err = commit_with_retry(&device, &request(), CommitFlags::ALLOW_MODESET).unwrap_err();
        assert!(err.is_errno(libc::EINVAL));
        assert_eq!(device.commits().len(), 1);
        assert_eq!(device.commits()[0].1, CommitFlags::ALLOW_MODESET);
    }
}
