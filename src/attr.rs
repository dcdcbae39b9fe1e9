//! File attributes.

use fuse_abi::fuse_attr;
use libc::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK};

/// Attribute snapshot of a filesystem object.
///
/// Holds the minimal metadata the kernel needs to represent a file: the inode number which
/// identifies it, its mode (file type and permission bits) and its size. Snapshots are produced
/// by the directory tree for every request and are never cached by the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attributes {
    /// Inode number.
    pub ino: u64,
    /// File type and permission bits, as in `st_mode`.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
}

impl Attributes {
    /// Create a snapshot from a file type and permission bits.
    pub fn new(ino: u64, file_type: FileType, perm: u16, size: u64) -> Self {
        Self { ino, mode: mode_from_type_and_perm(file_type, perm), size }
    }

    /// Kernel representation of this snapshot. Each object has exactly one link; timestamps
    /// and ownership are left zeroed.
    pub(crate) fn to_kernel(&self) -> fuse_attr {
        fuse_attr {
            ino: self.ino,
            size: self.size,
            mode: self.mode,
            nlink: 1,
            ..Default::default()
        }
    }
}

/// File type.
///
/// Determines the type of a file (e.g. wether it's a regular file or a symlink).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (FIFO).
    ///
    /// Also known as `S_IFIFO` in libc.
    NamedPipe,
    /// Character device.
    ///
    /// Also known as `S_IFCHR` in libc.
    CharDevice,
    /// Directory.
    ///
    /// Also known as `S_IFDIR` in libc.
    Directory,
    /// Block device.
    ///
    /// Also known as `S_IFBLK` in libc.
    BlockDevice,
    /// Regular file.
    ///
    /// Also known as `S_IFREG` in libc.
    RegularFile,
    /// Symbolic link.
    ///
    /// Also known as `S_IFLNK` in libc.
    Symlink,
    /// Unix domain socket.
    ///
    /// Also known as `S_IFSOCK` in libc.
    Socket,
}

// Some platforms like Linux x86_64 have mode_t = u32, and lint warns of a trivial_numeric_casts.
// But others like macOS x86_64 have mode_t = u16, requiring a typecast.  So, just silence lint.
#[allow(trivial_numeric_casts)]
/// Returns the mode for a given file type and permission
fn mode_from_type_and_perm(file_type: FileType, perm: u16) -> u32 {
    (match file_type {
        FileType::NamedPipe => S_IFIFO,
        FileType::CharDevice => S_IFCHR,
        FileType::BlockDevice => S_IFBLK,
        FileType::Directory => S_IFDIR,
        FileType::RegularFile => S_IFREG,
        FileType::Symlink => S_IFLNK,
        FileType::Socket => S_IFSOCK,
    }) as u32
        | perm as u32
}
