//! Event-driven FUSE request core
//!
//! Serves a read-only filesystem from a directory tree whose answers may arrive
//! asynchronously. The kernel channel is registered with an event loop; every time it becomes
//! readable, one request is received, decoded and forwarded to the `DirTree` implementation
//! together with a continuation that replies to the kernel once the tree is done.

#![warn(missing_debug_implementations, rust_2018_idioms)]

macro_rules! try_io {
    ($x:expr) => {
        match $x {
            rc if rc < 0 => return Err(io::Error::last_os_error()),
            rc => rc,
        }
    };
}

mod attr;
mod channel;
mod dirbuf;
mod dirtree;
mod event;
pub mod ll;
mod ops;
pub mod reply;
mod session;

pub use crate::attr::{Attributes, FileType};
pub use crate::channel::{unmount, Channel, ChannelSender, MAX_WRITE_SIZE};
pub use crate::dirbuf::DirBuffer;
pub use crate::dirtree::{Completion, Content, DirFiller, DirTree, Listing, Lookup};
pub use crate::event::{EventLoop, EventPump};
pub use crate::ops::page;
pub use crate::session::{MountFlags, Received, Session, SessionBuilder};

/// Mount the directory tree at `mountpoint` and serve it until the kernel destroys or
/// unmounts the filesystem. This is a shortcut for `Session::builder(tree, mountpoint).run()`.
#[cfg(feature = "libfuse")]
pub fn mount<T: DirTree, P: AsRef<std::path::Path>>(tree: T, mountpoint: P) -> std::io::Result<()> {
    Session::builder(tree, mountpoint).run()
}
