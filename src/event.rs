//! Event loop integration
//!
//! The session doesn't block on the kernel driver. Instead, the channel is registered with an
//! epoll instance for read readiness and one request is received each time the channel becomes
//! readable. Registrations are one-shot and must be re-armed after every notification, so a
//! notification is never delivered while the previous one is still being handled.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::dirtree::DirTree;
use crate::session::{Received, Session};

/// Token of the channel registration
const CHANNEL: u64 = 0;

/// Maximum number of notifications fetched per wait
const MAX_EVENTS: usize = 16;

/// Host event loop backed by an epoll instance
#[derive(Debug)]
pub struct EventLoop {
    fd: RawFd,
}

impl AsRawFd for EventLoop {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl EventLoop {
    /// Create a new epoll instance.
    pub fn new() -> io::Result<Self> {
        let fd = try_io!(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) });
        Ok(Self { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events: (libc::EPOLLIN | libc::EPOLLONESHOT) as u32, u64: token };
        try_io!(unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) });
        Ok(())
    }

    /// Watch `fd` for read readiness. The next notification is reported with `token`.
    pub fn register(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token)
    }

    /// Arm a registered `fd` again after a notification.
    pub fn rearm(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token)
    }

    /// Stop watching `fd`.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // Kernels before 2.6.9 require a non-null event even for EPOLL_CTL_DEL
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wait for notifications and return their tokens. Waits forever if `timeout` is `None`.
    /// A wait interrupted by a signal returns no tokens.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<u64>> {
        let timeout = match timeout {
            Some(timeout) => timeout.as_millis().min(libc::c_int::max_value() as u128) as libc::c_int,
            None => -1,
        };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let rc = unsafe { libc::epoll_wait(self.fd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(Vec::new()),
                _ => Err(err),
            };
        }
        Ok(events[..rc as usize].iter().map(|event| event.u64).collect())
    }
}

/// Drives a session from an event loop.
///
/// Every readiness notification of the channel receives exactly one request, then re-arms the
/// registration.
#[derive(Debug)]
pub struct EventPump<'a, T: DirTree> {
    session: Session<T>,
    event_loop: &'a EventLoop,
}

impl<'a, T: DirTree> EventPump<'a, T> {
    /// Switch the session's channel to non-blocking mode and register it with `event_loop`.
    pub fn new(session: Session<T>, event_loop: &'a EventLoop) -> io::Result<Self> {
        let fd = session.channel().as_raw_fd();
        session.channel().set_nonblocking()?;
        event_loop.register(fd, CHANNEL)?;
        Ok(Self { session, event_loop })
    }

    /// Returns the session driven by this pump.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Returns the session driven by this pump.
    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    /// Handle a readiness notification of the channel: receive one request and re-arm.
    ///
    /// Channel failures are logged and don't end the pump. Only a failure to re-arm is returned,
    /// since no further notification would arrive.
    pub fn on_readable(&mut self) -> io::Result<()> {
        match self.session.receive() {
            Ok(Received::Request(len)) => debug!("Dispatched request of {} bytes", len),
            Ok(Received::NotReady) => {}
            Ok(Received::EndOfStream) => warn!("FUSE channel closed by the kernel"),
            Ok(Received::Unmounted) => info!("Filesystem unmounted"),
            Err(err) => error!("Failed to receive FUSE request: {}", err),
        }
        self.event_loop.rearm(self.session.channel().as_raw_fd(), CHANNEL)
    }

    /// Serve requests until the kernel destroys the filesystem or the channel goes away.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.session.is_destroyed() && !self.session.is_unmounted() {
            for token in self.event_loop.wait(None)? {
                if token == CHANNEL {
                    self.on_readable()?;
                }
            }
        }
        Ok(())
    }
}

impl<'a, T: DirTree> Drop for EventPump<'a, T> {
    fn drop(&mut self) {
        let _ = self.event_loop.deregister(self.session.channel().as_raw_fd());
    }
}
