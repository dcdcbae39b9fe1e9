//! Filesystem operations.
//!
//! Each operation forwards one question to the directory tree and passes along a continuation
//! holding the kernel's reply. The continuation turns the tree's answer into the reply (or an
//! error) once the answer is available.

use std::cmp;
use std::ffi::OsStr;
use std::time::Duration;

use libc::{ENOENT, ENOTDIR};
use log::debug;

use crate::dirbuf::DirBuffer;
use crate::dirtree::{Completion, Content, DirFiller, DirTree, Listing, Lookup};
use crate::reply::{ReplyAttr, ReplyData, ReplyEntry, ReplyOpen};

/// How long the kernel may cache entries and attributes we return.
const TTL: Duration = Duration::from_secs(1);

/// Part of `data` that falls into the page `[offset, offset + size)`. The page is shorter than
/// requested at the end of the data and empty beyond it.
pub fn page(data: &[u8], offset: u64, size: u32) -> &[u8] {
    let start = cmp::min(offset, data.len() as u64) as usize;
    let len = cmp::min(size as usize, data.len() - start);
    &data[start..start + len]
}

/// Look up a directory entry by name and get its attributes.
pub fn lookup<T: DirTree>(tree: &mut T, parent: u64, name: &OsStr, reply: ReplyEntry) {
    debug!("lookup  name: {:?} parent inode: {}", name, parent);
    tree.lookup(parent, name, Completion::new(move |result| lookup_done(result, reply)));
}

fn lookup_done(result: Lookup, reply: ReplyEntry) {
    debug!("lookup_cb  success: {}", result != Lookup::NotFound);
    match result {
        Lookup::Found(attr) => reply.entry(&TTL, &attr, 0),
        Lookup::NotFound => reply.error(ENOENT),
    }
}

/// Get file attributes.
pub fn getattr<T: DirTree>(tree: &mut T, ino: u64, reply: ReplyAttr) {
    debug!("getattr  inode: {}", ino);
    tree.getattr(ino, Completion::new(move |result| getattr_done(result, reply)));
}

fn getattr_done(result: Lookup, reply: ReplyAttr) {
    debug!("getattr_cb  success: {}", result != Lookup::NotFound);
    match result {
        Lookup::Found(attr) => reply.attr(&TTL, &attr),
        Lookup::NotFound => reply.error(ENOENT),
    }
}

/// Open a file. Any open is accepted; there's no per-open state, so the file handle is 0.
pub fn open(ino: u64, flags: u32, reply: ReplyOpen) {
    debug!("open  inode: {}, flags: {:#x}", ino, flags);
    reply.opened(0, 0);
}

/// Read data from a file.
pub fn read<T: DirTree>(tree: &mut T, ino: u64, size: u32, offset: u64, reply: ReplyData) {
    debug!("read  inode: {}, size: {}, off: {}", ino, size, offset);
    tree.read(ino, size, offset, Completion::new(move |result| read_done(result, size, offset, reply)));
}

fn read_done(result: Content, size: u32, offset: u64, reply: ReplyData) {
    match result {
        Content::Data(data) => {
            debug!("read_cb  success: YES, buf_size: {}, size: {}, off: {}", data.len(), size, offset);
            reply.data(page(&data, offset, size));
        }
        Content::Unavailable => {
            debug!("read_cb  success: NO");
            reply.error(ENOENT);
        }
    }
}

/// Read a directory.
pub fn readdir<T: DirTree>(tree: &mut T, ino: u64, size: u32, offset: u64, reply: ReplyData) {
    debug!("readdir  inode: {}, size: {}, off: {}", ino, size, offset);
    let filler = DirFiller::new(Completion::new(move |(listing, buffer): (Listing, DirBuffer)| readdir_done(listing, buffer, size, offset, reply)));
    tree.fill_dir(ino, size, offset, filler);
}

fn readdir_done(listing: Listing, buffer: DirBuffer, size: u32, offset: u64, reply: ReplyData) {
    debug!("readdir_cb  success: {:?}, buf_size: {}, size: {}, off: {}", listing, buffer.len(), size, offset);
    match listing {
        Listing::Complete => reply.data(page(buffer.as_bytes(), offset, size)),
        Listing::NotADirectory => reply.error(ENOTDIR),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::OsString;
    use std::sync::mpsc;
    use std::thread;
    use crate::attr::{Attributes, FileType};
    use crate::reply::test::{out_header, CaptureSender};
    use crate::reply::Reply;
    use libc::EIO;

    /// In-memory tree: a root directory with some files.
    struct MemTree {
        files: HashMap<OsString, (u64, Vec<u8>)>,
    }

    impl MemTree {
        fn new(files: &[(&str, u64, &[u8])]) -> Self {
            let files = files.iter().map(|(name, ino, data)| (OsString::from(name), (*ino, data.to_vec()))).collect();
            Self { files }
        }

        fn attr(&self, ino: u64) -> Option<Attributes> {
            if ino == 1 {
                return Some(Attributes::new(1, FileType::Directory, 0o755, 0));
            }
            self.files.values().find(|(i, _)| *i == ino).map(|(i, data)| Attributes::new(*i, FileType::RegularFile, 0o644, data.len() as u64))
        }
    }

    impl DirTree for MemTree {
        fn lookup(&mut self, parent: u64, name: &OsStr, done: Completion<Lookup>) {
            match self.files.get(name) {
                Some((ino, _)) if parent == 1 => done.complete(Lookup::Found(self.attr(*ino).unwrap())),
                _ => done.complete(Lookup::NotFound),
            }
        }

        fn getattr(&mut self, ino: u64, done: Completion<Lookup>) {
            done.complete(self.attr(ino).map(Lookup::Found).unwrap_or(Lookup::NotFound))
        }

        fn fill_dir(&mut self, ino: u64, _size: u32, _offset: u64, mut filler: DirFiller) {
            if ino != 1 {
                return filler.done(Listing::NotADirectory);
            }
            let mut entries: Vec<_> = self.files.iter().collect();
            entries.sort();
            for (name, (ino, _)) in entries {
                filler.add(name, *ino);
            }
            filler.done(Listing::Complete);
        }

        fn read(&mut self, ino: u64, _size: u32, _offset: u64, done: Completion<Content>) {
            match self.files.values().find(|(i, _)| *i == ino) {
                Some((_, data)) => done.complete(Content::Data(data.clone())),
                None => done.complete(Content::Unavailable),
            }
        }
    }

    /// Tree that answers from a background thread.
    struct ThreadedTree;

    impl DirTree for ThreadedTree {
        fn lookup(&mut self, _parent: u64, _name: &OsStr, done: Completion<Lookup>) {
            thread::spawn(move || done.complete(Lookup::NotFound));
        }

        fn getattr(&mut self, ino: u64, done: Completion<Lookup>) {
            thread::spawn(move || done.complete(Lookup::Found(Attributes::new(ino, FileType::RegularFile, 0o600, 1))));
        }

        fn fill_dir(&mut self, _ino: u64, _size: u32, _offset: u64, mut filler: DirFiller) {
            thread::spawn(move || {
                filler.add("x", 9);
                filler.done(Listing::Complete);
            });
        }

        fn read(&mut self, _ino: u64, _size: u32, _offset: u64, done: Completion<Content>) {
            thread::spawn(move || done.complete(Content::Data(b"abc".to_vec())));
        }
    }

    /// Tree that loses every continuation.
    struct ForgetfulTree;

    impl DirTree for ForgetfulTree {
        fn lookup(&mut self, _parent: u64, _name: &OsStr, _done: Completion<Lookup>) {}
        fn getattr(&mut self, _ino: u64, _done: Completion<Lookup>) {}
        fn fill_dir(&mut self, _ino: u64, _size: u32, _offset: u64, mut filler: DirFiller) {
            filler.add("half", 5);
        }
        fn read(&mut self, _ino: u64, _size: u32, _offset: u64, _done: Completion<Content>) {}
    }

    fn sample() -> MemTree {
        MemTree::new(&[("b", 3, &b"bbbb"[..]), ("a", 2, &b""[..])])
    }

    fn only_packet(sender: &CaptureSender) -> Vec<u8> {
        let packets = sender.packets();
        assert_eq!(packets.len(), 1, "exactly one reply per request");
        packets.into_iter().next().unwrap()
    }

    #[test]
    fn page_clamps_to_data() {
        let data = [1u8, 2, 3, 4];
        assert_eq!(page(&data, 0, 10), &data[..]);
        assert_eq!(page(&data, 1, 2), &[2u8, 3][..]);
        assert_eq!(page(&data, 3, 10), &[4u8][..]);
        assert_eq!(page(&data, 4, 10), &[] as &[u8]);
        assert_eq!(page(&data, u64::max_value(), u32::max_value()), &[] as &[u8]);
        assert_eq!(page(&[], 0, 0), &[] as &[u8]);
    }

    #[test]
    fn page_length_matches_formula() {
        let data: Vec<u8> = (0..50).collect();
        for offset in 0..60u64 {
            for size in 0..60u32 {
                let expected = cmp::min(size as i64, cmp::max(0, data.len() as i64 - offset as i64)) as usize;
                let got = page(&data, offset, size);
                assert_eq!(got.len(), expected);
                if !got.is_empty() {
                    assert_eq!(got[0] as u64, offset);
                }
            }
        }
    }

    #[test]
    fn lookup_missing_entry() {
        let sender = CaptureSender::default();
        lookup(&mut sample(), 1, OsStr::new("missing.txt"), Reply::new(10, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)), (16, -ENOENT, 10));
    }

    #[test]
    fn lookup_found_entry() {
        let sender = CaptureSender::default();
        lookup(&mut sample(), 1, OsStr::new("b"), Reply::new(11, sender.clone()));
        let packet = only_packet(&sender);
        assert_eq!(out_header(&packet).1, 0);
        assert_eq!(&packet[16..24], &3u64.to_ne_bytes());
    }

    #[test]
    fn getattr_replies() {
        let sender = CaptureSender::default();
        getattr(&mut sample(), 3, Reply::new(12, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)).1, 0);

        let sender = CaptureSender::default();
        getattr(&mut sample(), 99, Reply::new(13, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)), (16, -ENOENT, 13));
    }

    #[test]
    fn open_always_succeeds() {
        let sender = CaptureSender::default();
        open(99, libc::O_RDONLY as u32, Reply::new(14, sender.clone()));
        let packet = only_packet(&sender);
        assert_eq!(out_header(&packet), (32, 0, 14));
        assert!(packet[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_short_object() {
        let sender = CaptureSender::default();
        read(&mut sample(), 3, 10, 0, Reply::new(15, sender.clone()));
        let packet = only_packet(&sender);
        assert_eq!(out_header(&packet), (20, 0, 15));
        assert_eq!(&packet[16..], b"bbbb");
    }

    #[test]
    fn read_at_end_is_empty() {
        let sender = CaptureSender::default();
        read(&mut sample(), 3, 10, 4, Reply::new(16, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)), (16, 0, 16));
    }

    #[test]
    fn read_unknown_inode() {
        let sender = CaptureSender::default();
        read(&mut sample(), 42, 10, 0, Reply::new(17, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)), (16, -ENOENT, 17));
    }

    #[test]
    fn readdir_lists_entries_in_order() {
        let sender = CaptureSender::default();
        readdir(&mut sample(), 1, 4096, 0, Reply::new(18, sender.clone()));
        let packet = only_packet(&sender);
        let mut expected = DirBuffer::new();
        expected.append("a", 2);
        expected.append("b", 3);
        assert_eq!(out_header(&packet), (16 + expected.len() as u32, 0, 18));
        assert_eq!(&packet[16..], expected.as_bytes());
    }

    #[test]
    fn readdir_paginates() {
        // Resume after the first entry, as the kernel does with the entry's offset
        let sender = CaptureSender::default();
        readdir(&mut sample(), 1, 4096, 32, Reply::new(19, sender.clone()));
        let packet = only_packet(&sender);
        assert_eq!(out_header(&packet).0, 16 + 32);
        assert_eq!(packet[16 + 24], b'b');

        let sender = CaptureSender::default();
        readdir(&mut sample(), 1, 4096, 64, Reply::new(20, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)), (16, 0, 20));
    }

    #[test]
    fn readdir_on_file() {
        let sender = CaptureSender::default();
        readdir(&mut sample(), 3, 4096, 0, Reply::new(21, sender.clone()));
        assert_eq!(out_header(&only_packet(&sender)), (16, -ENOTDIR, 21));
    }

    #[test]
    fn replies_from_other_threads() {
        let sender = CaptureSender::default();
        let mut tree = ThreadedTree;
        lookup(&mut tree, 1, OsStr::new("x"), Reply::new(1, sender.clone()));
        getattr(&mut tree, 2, Reply::new(2, sender.clone()));
        read(&mut tree, 2, 2, 1, Reply::new(3, sender.clone()));
        readdir(&mut tree, 1, 4096, 0, Reply::new(4, sender.clone()));

        // Wait until all four background threads have answered
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            while sender.packets().len() < 4 {
                thread::yield_now();
            }
            tx.send(sender.packets()).unwrap();
        });
        let mut packets = rx.recv().unwrap();
        packets.sort_by_key(|p| out_header(p).2);
        let uniques: Vec<u64> = packets.iter().map(|p| out_header(p).2).collect();
        assert_eq!(uniques, vec![1, 2, 3, 4]);
        assert_eq!(out_header(&packets[0]).1, -ENOENT);
        assert_eq!(&packets[2][16..], b"bc");
    }

    #[test]
    fn lost_continuations_reply_eio() {
        let sender = CaptureSender::default();
        let mut tree = ForgetfulTree;
        lookup(&mut tree, 1, OsStr::new("x"), Reply::new(1, sender.clone()));
        getattr(&mut tree, 1, Reply::new(2, sender.clone()));
        read(&mut tree, 1, 1, 0, Reply::new(3, sender.clone()));
        readdir(&mut tree, 1, 1, 0, Reply::new(4, sender.clone()));
        let packets = sender.packets();
        assert_eq!(packets.len(), 4);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(out_header(packet), (16, -EIO, i as u64 + 1));
        }
    }
}
