//! Filesystem session
//!
//! A session runs a directory tree while it is mounted to a specific mountpoint. It owns the
//! channel to the kernel driver and a buffer for receiving requests. Every call to `receive`
//! reads at most one request from the kernel, decodes it and dispatches it to the operation
//! handlers, which forward it to the directory tree. Replies are sent when the tree completes
//! the request, which may happen after `receive` returned.

use std::convert::TryFrom;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use fuse_abi::consts::FUSE_ASYNC_READ;
use fuse_abi::fuse_opcode::{FUSE_BATCH_FORGET, FUSE_FORGET};
use fuse_abi::{FUSE_KERNEL_MINOR_VERSION, FUSE_KERNEL_VERSION};
use libc::{EIO, ENOSYS, EPROTO};
use log::{debug, error, info, warn};

use crate::channel::{Channel, MAX_WRITE_SIZE};
use crate::dirtree::DirTree;
use crate::ll::{Operation, Request};
use crate::ops;
use crate::reply::{Reply, ReplyEmpty, ReplyInit, ReplyOpen, ReplyStatfs};

/// Flags describing how the filesystem was mounted. They are recorded for the directory tree's
/// information only; the session always runs single-threaded.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MountFlags {
    pub multithreaded: bool,
    pub foreground: bool,
}

/// Outcome of a single receive on the channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Received {
    /// Nothing was pending on the channel.
    NotReady,
    /// The other end closed the channel.
    EndOfStream,
    /// The filesystem was unmounted and the kernel driver won't send any further requests.
    Unmounted,
    /// A request of the given size was received and dispatched.
    Request(usize),
}

/// Builder for configuring a filesystem `Session`.
///
/// Use the various methods of this type to configure the session, then call `mount` to mount
/// the filesystem or `with_channel` to run on an already opened channel.
#[derive(Debug)]
pub struct SessionBuilder<T: DirTree> {
    tree: T,
    mountpoint: PathBuf,
    options: Vec<OsString>,
    flags: MountFlags,
}

impl<T: DirTree> SessionBuilder<T> {
    /// Create a new session builder for mounting `tree` at `mountpoint`.
    pub fn new<P: AsRef<Path>>(tree: T, mountpoint: P) -> Self {
        Self {
            tree,
            mountpoint: mountpoint.as_ref().to_owned(),
            options: Vec::new(),
            flags: MountFlags::default(),
        }
    }

    /// Add mount options. They are passed verbatim to libfuse, e.g. `["-o", "ro,fsname=hello"]`.
    pub fn options(mut self, options: &[&OsStr]) -> Self {
        self.options.extend(options.iter().map(|s| s.to_os_string()));
        self
    }

    /// Record whether the filesystem is served by multiple threads.
    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.flags.multithreaded = multithreaded;
        self
    }

    /// Record whether the filesystem runs in the foreground.
    pub fn foreground(mut self, foreground: bool) -> Self {
        self.flags.foreground = foreground;
        self
    }

    /// Returns the configured mountpoint.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Mount the filesystem and create a session. Unmounts again when the session is dropped.
    #[cfg(feature = "libfuse")]
    pub fn mount(self) -> io::Result<Session<T>> {
        info!("Mounting {}", self.mountpoint.display());
        let options: Vec<&OsStr> = self.options.iter().map(|s| s.as_os_str()).collect();
        let channel = Channel::mount(&self.mountpoint, &options)?;
        Ok(self.with_channel(channel))
    }

    /// Mount the filesystem and serve requests until the kernel destroys or unmounts it.
    #[cfg(feature = "libfuse")]
    pub fn run(self) -> io::Result<()> {
        let event_loop = crate::event::EventLoop::new()?;
        let mut pump = crate::event::EventPump::new(self.mount()?, &event_loop)?;
        pump.run()
    }

    /// Create a session on a channel that was opened elsewhere, e.g. by `fusermount`.
    pub fn with_channel(self, channel: Channel) -> Session<T> {
        let buffer = vec![0; channel.buffer_size()];
        Session {
            channel,
            tree: self.tree,
            buffer,
            flags: self.flags,
            proto_major: 0,
            proto_minor: 0,
            initialized: false,
            destroyed: false,
            disconnected: false,
        }
    }
}

/// Filesystem session
///
/// Holds everything belonging to one mount: the channel, the directory tree, the receive
/// buffer and the state of the protocol handshake.
pub struct Session<T: DirTree> {
    channel: Channel,
    tree: T,
    /// Receive buffer, reused for every request
    buffer: Vec<u8>,
    flags: MountFlags,
    /// FUSE protocol version, as reported by the kernel
    proto_major: u32,
    proto_minor: u32,
    /// True if the filesystem is initialized (init operation done)
    initialized: bool,
    /// True if the filesystem was destroyed (destroy operation done)
    destroyed: bool,
    /// True once the channel reported end of stream or unmount
    disconnected: bool,
}

impl<T: DirTree + fmt::Debug> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .field("tree", &self.tree)
            .field("flags", &self.flags)
            .field("proto_major", &self.proto_major)
            .field("proto_minor", &self.proto_minor)
            .field("initialized", &self.initialized)
            .field("destroyed", &self.destroyed)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

impl<T: DirTree> Session<T> {
    /// (Prepare to) mount a filesystem and create a new session.
    pub fn builder<P: AsRef<Path>>(tree: T, mountpoint: P) -> SessionBuilder<T> {
        SessionBuilder::new(tree, mountpoint)
    }

    /// Returns the channel to the kernel driver.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Returns the directory tree.
    pub fn tree(&self) -> &T {
        &self.tree
    }

    /// Returns the directory tree.
    pub fn tree_mut(&mut self) -> &mut T {
        &mut self.tree
    }

    /// Returns the flags the filesystem was mounted with.
    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    /// Returns the protocol version reported by the kernel, or (0, 0) before the handshake.
    pub fn proto_version(&self) -> (u32, u32) {
        (self.proto_major, self.proto_minor)
    }

    /// Returns true once the kernel completed the handshake.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true once the kernel destroyed the filesystem.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Returns true once the channel reported end of stream or an unmount. No further requests
    /// will arrive.
    pub fn is_unmounted(&self) -> bool {
        self.disconnected
    }

    /// Read one request from the channel and dispatch it.
    ///
    /// The channel is expected to be non-blocking; if nothing is pending, this returns
    /// `Received::NotReady` without any further effect.
    pub fn receive(&mut self) -> io::Result<Received> {
        let len = loop {
            let received = match self.channel.read(&mut self.buffer) {
                Ok(0) => Received::EndOfStream,
                Ok(len) => break len,
                Err(err) => match read_error(err)? {
                    Some(received) => received,
                    None => continue,
                },
            };
            if received != Received::NotReady {
                self.disconnected = true;
            }
            return Ok(received);
        };
        self.process(len);
        Ok(Received::Request(len))
    }

    /// Decode the first `len` bytes of the receive buffer and dispatch the request.
    fn process(&mut self, len: usize) {
        let err = match Request::try_from(&self.buffer[..len]) {
            Ok(request) => return self.dispatch(request),
            Err(err) => err,
        };
        warn!("{}", err);
        // The kernel still waits for an answer if the header was intact
        match err.header() {
            Some((opcode, _)) if opcode == FUSE_FORGET as u32 || opcode == FUSE_BATCH_FORGET as u32 => {}
            Some((_, unique)) => ReplyEmpty::new(unique, self.channel.sender()).error(EIO),
            None => {}
        }
    }

    fn dispatch(&mut self, request: Request) {
        debug!("{}", request);
        let unique = request.unique();
        let ino = request.nodeid();
        let sender = self.channel.sender();

        match request.operation() {
            Operation::Init { major, minor, max_readahead, flags } => {
                let reply: ReplyInit = Reply::new(unique, sender);
                // We don't support ABI versions before 7.23, the replies use their struct sizes
                if *major < 7 || (*major == 7 && *minor < 23) {
                    error!("Unsupported FUSE ABI version {}.{}", major, minor);
                    return reply.error(EPROTO);
                }
                self.proto_major = *major;
                self.proto_minor = *minor;
                // If the kernel supports a larger major version, it'll re-send a matching init
                // message.
                let flags = flags & FUSE_ASYNC_READ;
                info!(
                    "INIT({}) response: ABI {}.{}, flags {:#x}, max readahead {}, max write {}",
                    unique, FUSE_KERNEL_VERSION, FUSE_KERNEL_MINOR_VERSION, flags, max_readahead, MAX_WRITE_SIZE
                );
                self.initialized = true;
                reply.init(FUSE_KERNEL_VERSION, FUSE_KERNEL_MINOR_VERSION, *max_readahead, flags, MAX_WRITE_SIZE as u32);
            }
            // Any operation is invalid before initialization
            _ if !self.initialized => {
                warn!("Ignoring FUSE operation before init: {}", request);
                ReplyEmpty::new(unique, sender).error(EIO);
            }
            Operation::Destroy => {
                self.destroyed = true;
                ReplyEmpty::new(unique, sender).ok();
            }
            // Any operation is invalid after destroy
            _ if self.destroyed => {
                warn!("Ignoring FUSE operation after destroy: {}", request);
                ReplyEmpty::new(unique, sender).error(EIO);
            }

            Operation::Lookup { name } => ops::lookup(&mut self.tree, ino, name, Reply::new(unique, sender)),
            Operation::GetAttr { .. } => ops::getattr(&mut self.tree, ino, Reply::new(unique, sender)),
            Operation::Open { flags } => ops::open(ino, *flags, Reply::new(unique, sender)),
            Operation::Read { offset, size, .. } => {
                ops::read(&mut self.tree, ino, *size, *offset, Reply::new(unique, sender))
            }
            Operation::ReadDir { offset, size, .. } => {
                ops::readdir(&mut self.tree, ino, *size, *offset, Reply::new(unique, sender))
            }

            // Inode lifetimes belong to the directory tree; the kernel expects no reply
            Operation::Forget { .. } | Operation::BatchForget { .. } => {}
            Operation::OpenDir { .. } => ReplyOpen::new(unique, sender).opened(0, 0),
            Operation::Release { .. } | Operation::ReleaseDir { .. } => ReplyEmpty::new(unique, sender).ok(),
            Operation::StatFs => ReplyStatfs::new(unique, sender).statfs(0, 0, 0, 0, 0, 512, 255, 0),
            Operation::Interrupt { .. } | Operation::Unsupported { .. } => {
                ReplyEmpty::new(unique, sender).error(ENOSYS)
            }
        }
    }
}

/// Classify a failed channel read. Returns `None` if the read should be retried.
fn read_error(err: io::Error) -> io::Result<Option<Received>> {
    match err.raw_os_error() {
        // Operation interrupted. Accordingly to FUSE, this is safe to retry
        Some(libc::ENOENT) => Ok(None),
        // Interrupted system call, retry
        Some(libc::EINTR) => Ok(None),
        // Nothing to read right now
        Some(libc::EAGAIN) => Ok(Some(Received::NotReady)),
        // Filesystem was unmounted
        Some(libc::ENODEV) => Ok(Some(Received::Unmounted)),
        _ => Err(err),
    }
}
