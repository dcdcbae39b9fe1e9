//! Directory tree interface.
//!
//! The directory tree owns the namespace and the content of the filesystem: it allocates inode
//! numbers, resolves names and fetches attributes and data, possibly from a remote store. The
//! session asks it one question per kernel request and hands over a continuation that answers
//! the kernel once the tree is done. Continuations may be completed right away, later on the
//! same thread or from another thread.

use std::ffi::OsStr;
use std::fmt;

use crate::attr::Attributes;
use crate::dirbuf::DirBuffer;

/// Outcome of resolving a name or fetching the attributes of an inode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// The object exists.
    Found(Attributes),
    /// There's no such object.
    NotFound,
}

/// Outcome of fetching the content of a file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Content {
    /// The file's content, starting at position 0. The session picks the requested range.
    Data(Vec<u8>),
    /// The content couldn't be fetched.
    Unavailable,
}

/// Outcome of enumerating a directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Listing {
    /// All entries have been added.
    Complete,
    /// The inode isn't a directory (or couldn't be enumerated).
    NotADirectory,
}

/// Single-use continuation of a pending request.
///
/// Completing it sends the reply to the kernel. Dropping it without completing answers the
/// request with an I/O error.
pub struct Completion<R> {
    callback: Box<dyn FnOnce(R) + Send>,
}

impl<R> fmt::Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish()
    }
}

impl<R> Completion<R> {
    pub(crate) fn new<F: FnOnce(R) + Send + 'static>(callback: F) -> Self {
        Self { callback: Box::new(callback) }
    }

    /// Finish the request with the given result.
    pub fn complete(self, result: R) {
        (self.callback)(result)
    }
}

/// Continuation of a pending readdir request.
///
/// The directory tree adds every entry of the directory and eventually calls `done`.
#[derive(Debug)]
pub struct DirFiller {
    buffer: DirBuffer,
    done: Completion<(Listing, DirBuffer)>,
}

impl DirFiller {
    pub(crate) fn new(done: Completion<(Listing, DirBuffer)>) -> Self {
        Self { buffer: DirBuffer::new(), done }
    }

    /// Add a directory entry.
    pub fn add<T: AsRef<OsStr>>(&mut self, name: T, ino: u64) {
        self.buffer.append(name, ino);
    }

    /// Finish the enumeration and reply to the kernel.
    pub fn done(self, listing: Listing) {
        self.done.complete((listing, self.buffer))
    }
}

/// Directory tree implementation trait.
///
/// Every method must eventually complete (or drop) the continuation it is given. Methods should
/// return quickly; a tree backed by slow storage keeps the continuation and completes it when
/// the data has arrived.
pub trait DirTree {
    /// Resolve `name` in the directory `parent`.
    fn lookup(&mut self, parent: u64, name: &OsStr, done: Completion<Lookup>);

    /// Fetch the attributes of `ino`.
    fn getattr(&mut self, ino: u64, done: Completion<Lookup>);

    /// Enumerate the directory `ino` into `filler`. `size` and `offset` describe the page the
    /// kernel asked for; the tree may use them as a hint but is free to add every entry.
    fn fill_dir(&mut self, ino: u64, size: u32, offset: u64, filler: DirFiller);

    /// Fetch the content of `ino`. `size` and `offset` describe the range the kernel asked for.
    fn read(&mut self, ino: u64, size: u32, offset: u64, done: Completion<Content>);
}
