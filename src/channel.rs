//! FUSE kernel driver communication
//!
//! Raw communication channel to the FUSE kernel driver. A `Channel` holds the `/dev/fuse` file
//! descriptor of one mount; `ChannelSender` is a cheap clonable handle used by replies to write
//! back to it from any thread. The descriptor is shared: it's closed once the channel and every
//! sender are gone, so a reply completed late never writes to a closed or reused descriptor.

use log::{info, warn};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "libfuse")]
use std::ffi::{CString, OsStr};
#[cfg(feature = "libfuse")]
use std::os::unix::ffi::OsStrExt;

/// Maximum size of a write request we announce to the kernel. Writes are never served, but
/// the kernel sizes its requests by this value.
pub const MAX_WRITE_SIZE: usize = 128 * 1024;

// FIXME: This should depend on the actual page size the kernel uses
const PAGE_SIZE: usize = 4096;

/// Device file descriptor, closed when the last owner is dropped
#[derive(Debug)]
struct DeviceFd(RawFd);

impl Drop for DeviceFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A raw communication channel to the FUSE kernel driver
#[derive(Debug)]
pub struct Channel {
    fd: Arc<DeviceFd>,
    mountpoint: Option<PathBuf>,
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.0
    }
}

impl io::Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(try_io!(unsafe {
            libc::read(
                self.fd.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len() as libc::size_t,
            )
        }) as usize)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The descriptor is closed after unmounting, once no pending reply holds a sender anymore
        if let Some(mountpoint) = self.mountpoint.take() {
            info!("Unmounting {}", mountpoint.display());
            if let Err(err) = unmount(&mountpoint) {
                warn!("Failed to unmount {}: {}", mountpoint.display(), err);
            }
        }
    }
}

impl Channel {
    /// Create a new communication channel to the kernel driver using the given file descriptor
    /// obtained by calling fusermount or any other FUSE mount mechanism. When the channel is
    /// dropped, the file descriptor will be closed and the path unmounted.
    pub fn new(fd: RawFd, mountpoint: PathBuf) -> Self {
        Self { fd: Arc::new(DeviceFd(fd)), mountpoint: Some(mountpoint) }
    }

    /// Wrap a file descriptor whose mount is managed elsewhere. The descriptor is closed when the
    /// channel and all of its senders are dropped.
    pub fn from_fd(fd: RawFd) -> Self {
        Self { fd: Arc::new(DeviceFd(fd)), mountpoint: None }
    }

    /// Create a new communication channel to the kernel driver by mounting the given path. The
    /// kernel driver will delegate filesystem operations of the given path to the channel. When
    /// the channel is dropped, the path will be unmounted.
    #[cfg(feature = "libfuse")]
    pub fn mount(mountpoint: &Path, options: &[&OsStr]) -> io::Result<Channel> {
        use fuse_sys::{fuse_args, fuse_mount_compat25};

        let mountpoint = mountpoint.canonicalize()?;

        // Convert options to `fuse_args` which requires pointers to C strings
        let args = [OsStr::new("evfuse")]
            .iter()
            .chain(options.iter())
            .map(|s| CString::new(s.as_bytes()))
            .collect::<Result<Vec<CString>, _>>()?;
        let argptrs: Vec<_> = args.iter().map(|s| s.as_ptr()).collect();
        let fuse_args = fuse_args {
            argc: argptrs.len() as i32,
            argv: argptrs.as_ptr(),
            allocated: 0,
        };

        let path = CString::new(mountpoint.as_os_str().as_bytes())?;
        let fd = try_io!(unsafe { fuse_mount_compat25(path.as_ptr(), &fuse_args) });
        Ok(Channel::new(fd, mountpoint))
    }

    /// Returns the path of the mounted filesystem, if this channel mounted it.
    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }

    /// Size of the buffer needed to receive any request the kernel may send on this channel:
    /// the largest write payload plus one page for headers.
    pub fn buffer_size(&self) -> usize {
        MAX_WRITE_SIZE + PAGE_SIZE
    }

    /// Switch the descriptor to non-blocking mode so a read with nothing pending returns
    /// `EAGAIN` instead of stalling the event loop.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = try_io!(unsafe { libc::fcntl(self.fd.0, libc::F_GETFL) });
        try_io!(unsafe { libc::fcntl(self.fd.0, libc::F_SETFL, flags | libc::O_NONBLOCK) });
        Ok(())
    }

    /// Returns a sender object for this channel. The sender object can be used to send to the
    /// channel. Multiple sender objects can be used and they can safely be sent to other
    /// threads. A sender keeps the descriptor open even after the channel is dropped.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender { fd: self.fd.clone() }
    }
}

/// Writing end of a channel. Every reply is written with a single `writev`, which the kernel
/// driver treats atomically, so senders may be used concurrently.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    fd: Arc<DeviceFd>,
}

impl io::Write for ChannelSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(try_io!(unsafe {
            libc::write(
                self.fd.0,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::size_t,
            )
        }) as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        Ok(try_io!(unsafe {
            libc::writev(
                self.fd.0,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
            )
        }) as usize)
    }
}

/// Unmount an arbitrary mount point
pub fn unmount(mountpoint: &Path) -> io::Result<()> {
    // `fuse_unmount_compat22` doesn't return a status and calls `realpath`, which in turn calls
    // into the filesystem. So we call unmount directly, falling back to libfuse only when the
    // kernel denies it to an unprivileged user.

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    #[inline]
    fn unmount(path: &std::ffi::CStr) -> libc::c_int {
        unsafe { libc::unmount(path.as_ptr(), 0) }
    }

    #[cfg(not(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    #[inline]
    fn unmount(path: &std::ffi::CStr) -> libc::c_int {
        let rc = unsafe { libc::umount(path.as_ptr()) };
        #[cfg(feature = "libfuse")]
        {
            if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::PermissionDenied {
                // Linux always returns EPERM for non-root users. We have to let the library go
                // through the setuid-root "fusermount -u" to unmount.
                unsafe {
                    fuse_sys::fuse_unmount_compat22(path.as_ptr());
                }
                return 0;
            }
        }
        rc
    }

    let path = std::ffi::CString::new(std::os::unix::ffi::OsStrExt::as_bytes(mountpoint.as_os_str()))?;
    try_io!(unmount(&path));
    Ok(())
}
