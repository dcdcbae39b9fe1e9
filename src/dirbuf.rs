//! Directory buffer.
//!
//! A directory listing is sent to the kernel as a sequence of `fuse_dirent` records, each
//! followed by the entry's name and padded to an 8 byte boundary. The buffer is filled entry by
//! entry while the directory tree enumerates a directory and is paginated afterwards, so it
//! doesn't need to know how many entries will arrive or in what batches.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use fuse_abi::{fuse_dirent, fuse_dirent_size};
use log::debug;

use crate::reply::as_bytes;

/// Growable buffer of encoded directory entries.
#[derive(Clone, Debug, Default)]
pub struct DirBuffer {
    data: Vec<u8>,
}

impl DirBuffer {
    /// Create an empty directory buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with the given name and inode number.
    ///
    /// The record's type is left unknown and its offset points past the record itself, which
    /// is where the kernel resumes the listing in a subsequent readdir request.
    pub fn append<T: AsRef<OsStr>>(&mut self, name: T, ino: u64) {
        let name = name.as_ref().as_bytes();
        let oldsize = self.data.len();
        let newsize = oldsize + fuse_dirent_size(name.len());
        debug!("add_dirbuf  ino: {}, name: {:?}", ino, OsStr::from_bytes(name));

        // Grow with zeroes, so the padding after the name is already in place
        self.data.resize(newsize, 0);

        let dirent = fuse_dirent {
            ino,
            off: newsize as u64,
            namelen: name.len() as u32,
            ..Default::default()
        };
        let entry = &mut self.data[oldsize..newsize];
        as_bytes(&dirent, |bytes| {
            let header: Vec<u8> = bytes.concat();
            entry[..header.len()].copy_from_slice(&header);
            entry[header.len()..header.len() + name.len()].copy_from_slice(name);
        });
    }

    /// Total size of all entries appended so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no entry has been appended.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The encoded entries.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
