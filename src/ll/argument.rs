//! Argument decomposition for FUSE operation requests.
//!
//! Helper to decompose a slice of binary data (incoming FUSE request) into multiple data
//! structures (request arguments).

use std::ffi::OsStr;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::ptr;

/// An iterator that can be used to fetch typed arguments from a byte slice.
#[derive(Debug)]
pub struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the size of the remaining data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch all remaining data.
    pub fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data left. The argument is
    /// copied out, since request buffers carry no alignment guarantee.
    pub fn fetch<T: Copy>(&mut self) -> Option<T> {
        let len = mem::size_of::<T>();
        if self.data.len() < len {
            return None;
        }
        let (bytes, rest) = self.data.split_at(len);
        self.data = rest;
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }

    /// Fetch a (zero-terminated) string (can be non-utf8). Returns `None` if there's not enough
    /// data left or no zero-termination could be found.
    pub fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = self.data.iter().position(|&c| c == 0)?;
        let (bytes, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(bytes))
    }
}
