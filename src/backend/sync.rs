//! Kernel sync-file fences
//!
//! Acquire fences gate when a producer finished writing a buffer, release fences
//! when the display stopped reading one. Both are plain sync-file descriptors which
//! become readable once signaled.

use std::{
    fmt,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    time::{Duration, Instant},
};

use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};

/// Waiting for the fence was interrupted for an unknown reason.
///
/// This does not mean that the fence is signalled or not, neither that
/// any timeout was reached. Waiting should be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Wait for Fence was interrupted")
    }
}
impl std::error::Error for Interrupted {}

/// An owned sync-file fence
#[derive(Debug)]
pub struct Fence(OwnedFd);

impl Fence {
    /// Queries the state of the fence
    pub fn is_signaled(&self) -> bool {
        matches!(self.wait_timeout(Some(Duration::ZERO)), Ok(true))
    }

    /// Blocks the current thread until the fence is signaled
    #[profiling::function]
    pub fn wait(&self) -> Result<(), Interrupted> {
        self.wait_timeout(None).map(|_| ())
    }

    /// Blocks until the fence is signaled or `timeout` elapsed
    ///
    /// Returns whether the fence got signaled.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Result<bool, Interrupted> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(i32::MAX as u128) as i32,
                None => -1,
            };
            let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
            match poll(&mut fds, remaining) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents();
                    if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
                        return Err(Interrupted);
                    }
                    return Ok(true);
                }
                Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
                Err(_) => return Err(Interrupted),
            }
        }
    }

    /// Duplicate the fence file descriptor
    pub fn try_clone(&self) -> std::io::Result<Fence> {
        self.0.try_clone().map(Fence)
    }

    /// Give up ownership of the file descriptor
    pub fn into_inner(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for Fence {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        Fence(fd)
    }
}

impl AsFd for Fence {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for Fence {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Wait for an optional fence, treating `None` as signaled
///
/// Failures are logged and otherwise ignored, the buffer is sampled anyway.
pub fn wait_optional(fence: Option<&Fence>) {
    if let Some(fence) = fence {
        if let Err(err) = fence.wait() {
            tracing::warn!(fd = fence.as_raw_fd(), %err, "failed to wait for fence");
        }
    }
}
