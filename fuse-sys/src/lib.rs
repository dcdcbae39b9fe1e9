//! Bindings to the libfuse mount helpers.
//!
//! Only the mount and unmount entry points are needed: the session loop talks to the kernel
//! driver directly through the returned file descriptor. The functions are only available with
//! the `libfuse` feature, which links against the system's libfuse.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int};

/// Argument vector in the layout libfuse expects (`struct fuse_args`).
#[repr(C)]
#[derive(Debug)]
pub struct fuse_args {
    pub argc: c_int,
    pub argv: *const *const c_char,
    pub allocated: c_int,
}

#[cfg(feature = "libfuse")]
extern "C" {
    /// Mount `mountpoint` (via the setuid `fusermount` helper if needed) and return the
    /// `/dev/fuse` file descriptor, or -1 on failure.
    pub fn fuse_mount_compat25(mountpoint: *const c_char, args: *const fuse_args) -> c_int;

    /// Unmount `mountpoint` through `fusermount -u`. Doesn't report errors.
    pub fn fuse_unmount_compat22(mountpoint: *const c_char);
}
