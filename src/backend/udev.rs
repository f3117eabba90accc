//! `udev` related functionality for device scanning and hotplug
//!
//! This module mainly provides the [`HotplugMonitor`], a thread listening on a udev monitor
//! socket for events of a set of subsystems and reporting every event to a handler
//! closure. The [`DisplayManager`](crate::manager::DisplayManager) uses it to refresh the
//! connection state of its displays.
//!
//! Additionally this contains some utility functions related to scanning.

use std::{
    ffi::OsString,
    io,
    os::unix::io::{AsRawFd, BorrowedFd},
    path::{Path, PathBuf},
    sync::mpsc,
    thread::JoinHandle,
    time::Duration,
};

use rustix::event::{poll, PollFd, PollFlags};
use tracing::{debug, error, info, info_span, trace, warn};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

use crate::utils::CancellationToken;

/// Longest time the monitor thread sleeps before checking for cancellation
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Kind of a device event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugKind {
    /// A device appeared
    Added,
    /// A device changed, e.g. a cable was plugged
    Changed,
    /// A device went away
    Removed,
}

/// A device event reported by a [`HotplugMonitor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    /// What happened
    pub kind: HotplugKind,
    /// Subsystem of the device
    pub subsystem: Option<OsString>,
    /// sysfs path of the device
    pub syspath: PathBuf,
    /// Device node, if the device has one
    pub devnode: Option<PathBuf>,
}

/// Handle of a running hotplug monitor thread
///
/// Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct HotplugMonitor {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Start listening for events of the given subsystems
    ///
    /// The monitor socket is created on the thread, failing to create it is returned here.
    pub fn spawn<F>(subsystems: &[&str], mut handler: F) -> io::Result<HotplugMonitor>
    where
        F: FnMut(HotplugEvent) + Send + 'static,
    {
        let subsystems: Vec<String> = subsystems.iter().map(|s| s.to_string()).collect();
        let token = CancellationToken::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = std::thread::Builder::new().name("hotplug".into()).spawn({
            let token = token.clone();
            move || {
                let span = info_span!("udev", ?subsystems);
                let _guard = span.enter();

                let socket = match listen(&subsystems) {
                    Ok(socket) => {
                        let _ = ready_tx.send(Ok(()));
                        socket
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                info!("hotplug monitor running");
                while !token.is_cancelled() {
                    match wait_readable(&socket) {
                        Ok(true) => process_events(&socket, &mut handler),
                        Ok(false) => {}
                        Err(err) => {
                            error!(%err, "polling the udev monitor failed");
                            break;
                        }
                    }
                }
                debug!("hotplug monitor stopped");
            }
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(HotplugMonitor {
                token,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "hotplug thread died")),
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("hotplug thread panicked");
            }
        }
    }
}

fn listen(subsystems: &[String]) -> io::Result<MonitorSocket> {
    let mut builder = MonitorBuilder::new()?;
    for subsystem in subsystems {
        builder = builder.match_subsystem(subsystem)?;
    }
    builder.listen()
}

fn wait_readable(socket: &MonitorSocket) -> io::Result<bool> {
    // SAFETY: the socket outlives the poll call
    let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    match poll(&mut fds, POLL_SLICE.as_millis() as i32) {
        Ok(ready) => Ok(ready > 0),
        Err(rustix::io::Errno::INTR) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn process_events(socket: &MonitorSocket, handler: &mut impl FnMut(HotplugEvent)) {
    for event in socket.iter() {
        let kind = match event.event_type() {
            EventType::Add => HotplugKind::Added,
            EventType::Change => HotplugKind::Changed,
            EventType::Remove => HotplugKind::Removed,
            other => {
                trace!(?other, "ignoring udev event");
                continue;
            }
        };
        let event = HotplugEvent {
            kind,
            subsystem: event.subsystem().map(|s| s.to_os_string()),
            syspath: event.syspath().to_path_buf(),
            devnode: event.devnode().map(Path::to_path_buf),
        };
        debug!(?event.kind, syspath = %event.syspath.display(), "device event");
        handler(event);
    }
}

/// Returns the paths of all DRM card nodes of `seat`, in sysname order
pub fn all_cards<S: AsRef<str>>(seat: S) -> io::Result<Vec<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;
    let mut cards: Vec<(OsString, PathBuf)> = enumerator
        .scan_devices()?
        .filter(|device| {
            device
                .property_value("ID_SEAT")
                .map(|x| x.to_os_string())
                .unwrap_or_else(|| OsString::from("seat0"))
                == *seat.as_ref()
        })
        .flat_map(|device| {
            let node = device.devnode().map(PathBuf::from)?;
            Some((device.sysname().to_os_string(), node))
        })
        .collect();
    cards.sort();
    Ok(cards.into_iter().map(|(_, node)| node).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monitor_stops_on_drop() {
        // sandboxes without a netlink socket can't run the monitor at all
        let Ok(monitor) = HotplugMonitor::spawn(&["drm"], |_| {}) else {
            return;
        };
        let start = std::time::Instant::now();
        drop(monitor);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
