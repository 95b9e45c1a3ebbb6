//! Thin wrappers over `poll(2)` and the self-wake pipe.
//!
//! The audio thread must block on file descriptors (device fds, stream
//! audio sockets, the command wake pipe) with a deadline, which plain
//! channel selects cannot express. A pipe paired with each crossbeam
//! channel makes channel sends visible to `poll`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Registered fd set for one `poll` call.
#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Register `fd` for readability; returns its slot for [`readable`].
    ///
    /// [`readable`]: Poller::readable
    pub fn add(&mut self, fd: RawFd) -> usize {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Block until an fd is readable or the timeout expires. `None` blocks
    /// forever. Returns the number of ready descriptors; zero on timeout.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let millis: libc::c_int = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
        };
        loop {
            let rc = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, millis) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn readable(&self, slot: usize) -> bool {
        self.fds
            .get(slot)
            .map(|fd| fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .unwrap_or(false)
    }

    pub fn hung_up(&self, slot: usize) -> bool {
        self.fds
            .get(slot)
            .map(|fd| fd.revents & (libc::POLLHUP | libc::POLLERR) != 0)
            .unwrap_or(false)
    }
}

/// Receiving half of a wake pipe; polled by the owning loop.
pub struct WakeReader {
    fd: OwnedFd,
}

/// Sending half of a wake pipe; cheap to clone and `Send`.
#[derive(Clone)]
pub struct WakeWriter {
    fd: Arc<OwnedFd>,
}

/// Create a nonblocking wake pipe pair.
pub fn wake_pipe() -> io::Result<(WakeReader, WakeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((
        WakeReader { fd: reader },
        WakeWriter {
            fd: Arc::new(writer),
        },
    ))
}

impl WakeReader {
    /// Consume any pending wake bytes.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl AsRawFd for WakeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl WakeWriter {
    /// Make the peer's `poll` return. A full pipe already wakes the peer,
    /// so `EAGAIN` is success.
    pub fn notify(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.fd.as_raw_fd(), byte.as_ptr() as *const _, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd as _;
    use std::time::{Duration, Instant};

    use super::{wake_pipe, Poller};

    #[test]
    fn poll_times_out() {
        let (reader, _writer) = wake_pipe().unwrap();
        let mut poller = Poller::new();
        let slot = poller.add(reader.as_raw_fd());
        let begin = Instant::now();
        let ready = poller.poll(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(ready, 0);
        assert!(!poller.readable(slot));
        assert!(begin.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn notify_wakes_poll() {
        let (reader, writer) = wake_pipe().unwrap();
        let mut poller = Poller::new();
        let slot = poller.add(reader.as_raw_fd());
        writer.notify();
        let ready = poller.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready, 1);
        assert!(poller.readable(slot));
        reader.drain();
        poller.clear();
        let slot = poller.add(reader.as_raw_fd());
        assert_eq!(poller.poll(Some(Duration::from_millis(5))).unwrap(), 0);
        assert!(!poller.readable(slot));
    }
}
