use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;
use crate::event::EventSet;

pub(crate) const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Thin binding over the readiness backend.
///
/// Wraps a `mio::Poll` and registers raw file descriptors under a token with
/// a READ/WRITE mask. The backend is edge-triggered: callers are expected to
/// drain readiness (read/accept/send until `WouldBlock`), and every mask
/// change goes through `reregister`, which rearms the edge for the current
/// readiness state.
pub(crate) struct PollHandle {
    poll: Poll,
    events: Events,
}

fn interest(mask: EventSet) -> Option<Interest> {
    match (mask.is_readable(), mask.is_writable()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl PollHandle {
    pub(crate) fn new() -> Result<Self> {
        Ok(PollHandle {
            poll: Poll::new()?,
            events: Events::with_capacity(DEFAULT_EVENTS_CAPACITY),
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, mask: EventSet) -> Result<()> {
        if let Some(interest) = interest(mask) {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, interest)?;
        }
        Ok(())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, mask: EventSet) -> Result<()> {
        if let Some(interest) = interest(mask) {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, interest)?;
        }
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    /// One poll pass. Returns the drained `(token, events)` pairs so the
    /// caller holds no borrow on the backend while dispatching.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(Token, EventSet)>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            // An interrupting signal is not a backend failure; surface an
            // empty pass so pending signals get dispatched.
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e.into());
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let mut set = EventSet::NONE;
            if event.is_readable() || event.is_read_closed() {
                set |= EventSet::READ;
            }
            if event.is_writable() {
                set |= EventSet::WRITE;
            }
            if event.is_error() {
                set |= EventSet::ERROR;
            }
            if !set.is_empty() {
                ready.push((event.token(), set));
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe() failed");
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    #[test]
    fn test_poll_times_out() {
        let mut handle = PollHandle::new().unwrap();
        let ready = handle.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_read_readiness() {
        let mut handle = PollHandle::new().unwrap();
        let (read_fd, write_fd) = pipe();

        handle.register(read_fd, Token(7), EventSet::READ).unwrap();
        let rc = unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };
        assert_eq!(rc, 1);

        let ready = handle.poll(Some(Duration::from_millis(500))).unwrap();
        assert!(ready
            .iter()
            .any(|(token, set)| *token == Token(7) && set.is_readable()));

        handle.deregister(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_reregister_changes_mask() {
        let mut handle = PollHandle::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        let fd = stream.as_raw_fd();

        handle.register(fd, Token(1), EventSet::READ).unwrap();
        let ready = handle.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(!ready
            .iter()
            .any(|(token, set)| *token == Token(1) && set.is_writable()));

        // A connected socket is writable; adding WRITE must surface it.
        handle
            .reregister(fd, Token(1), EventSet::READ | EventSet::WRITE)
            .unwrap();
        let ready = handle.poll(Some(Duration::from_millis(500))).unwrap();
        assert!(ready
            .iter()
            .any(|(token, set)| *token == Token(1) && set.is_writable()));

        handle.deregister(fd).unwrap();
        let _ = stream.write(b"x");
    }
}
