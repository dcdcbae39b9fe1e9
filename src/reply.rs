//! Filesystem operation reply
//!
//! A reply is created for every request that expects an answer and must be used to send back
//! the result of the operation. Replies can be moved to another thread or stored in a
//! continuation to answer the request later. Every reply method consumes the reply, so a
//! request can't be answered twice. A reply that is dropped without being used answers the
//! request with `EIO`, so the kernel is never left waiting for an answer.

use std::fmt;
use std::io::{IoSlice, Write};
use std::marker::PhantomData;
use std::mem;
use std::slice;
use std::time::Duration;

use fuse_abi::{fuse_attr_out, fuse_entry_out, fuse_init_out, fuse_kstatfs, fuse_open_out, fuse_out_header, fuse_statfs_out};
use libc::{c_int, EIO};
use log::{error, warn};

use crate::attr::Attributes;

/// Generic reply callback to send data
pub trait ReplySender: Write + Send + fmt::Debug + 'static {}

impl<T: Write + Send + fmt::Debug + 'static> ReplySender for T {}

/// Generic reply trait
pub trait Reply {
    /// Create a new reply for the given request
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self;
}

/// Serialize an arbitrary type to bytes (memory copy, useful for fuse_*_out types)
pub(crate) fn as_bytes<T, U, F: FnOnce(&[&[u8]]) -> U>(data: &T, f: F) -> U {
    let len = mem::size_of::<T>();
    match len {
        0 => f(&[]),
        len => {
            let p = data as *const T as *const u8;
            let bytes = unsafe { slice::from_raw_parts(p, len) };
            f(&[bytes])
        }
    }
}

fn time_from_duration(t: &Duration) -> (u64, u32) {
    (t.as_secs(), t.subsec_nanos())
}

///
/// Raw reply
///
#[derive(Debug)]
pub(crate) struct ReplyRaw<T> {
    /// Unique id of the request to reply to
    unique: u64,
    /// Closure to call for sending the reply
    sender: Option<Box<dyn ReplySender>>,
    marker: PhantomData<T>,
}

impl<T> Reply for ReplyRaw<T> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyRaw<T> {
        Self { unique, sender: Some(Box::new(sender)), marker: PhantomData }
    }
}

impl<T> ReplyRaw<T> {
    /// Reply to a request with the given error code and data. Must be called
    /// only once (the `ok` and `error` methods ensure this by consuming `self`)
    fn send(&mut self, err: c_int, bytes: &[&[u8]]) {
        let mut sender = match self.sender.take() {
            Some(sender) => sender,
            None => return,
        };
        let len = bytes.iter().fold(mem::size_of::<fuse_out_header>(), |l, b| l + b.len());
        let header = fuse_out_header { len: len as u32, error: -err, unique: self.unique };
        as_bytes(&header, |headerbytes| {
            let slices: Vec<IoSlice<'_>> = headerbytes.iter().chain(bytes.iter()).map(|b| IoSlice::new(b)).collect();
            if let Err(err) = sender.write_vectored(&slices) {
                error!("Failed to send FUSE reply ({}): {}", self.unique, err);
            }
        });
    }

    /// Reply to a request with the given type
    pub fn ok(mut self, data: &T) {
        as_bytes(data, |bytes| {
            self.send(0, bytes);
        })
    }

    /// Reply to a request with the given error code
    pub fn error(mut self, err: c_int) {
        self.send(err, &[]);
    }
}

impl<T> Drop for ReplyRaw<T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!("Reply not sent for operation {}, replying with I/O error", self.unique);
            self.send(EIO, &[]);
        }
    }
}

///
/// Empty reply
///
#[derive(Debug)]
pub struct ReplyEmpty {
    reply: ReplyRaw<()>,
}

impl Reply for ReplyEmpty {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyEmpty {
        ReplyEmpty { reply: Reply::new(unique, sender) }
    }
}

impl ReplyEmpty {
    /// Reply to a request with nothing
    pub fn ok(mut self) {
        self.reply.send(0, &[]);
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

///
/// Data reply
///
#[derive(Debug)]
pub struct ReplyData {
    reply: ReplyRaw<()>,
}

impl Reply for ReplyData {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyData {
        ReplyData { reply: Reply::new(unique, sender) }
    }
}

impl ReplyData {
    /// Reply to a request with the given data. An empty slice is a valid answer meaning
    /// there's no more data.
    pub fn data(mut self, data: &[u8]) {
        self.reply.send(0, &[data]);
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

///
/// Entry reply
///
#[derive(Debug)]
pub struct ReplyEntry {
    reply: ReplyRaw<fuse_entry_out>,
}

impl Reply for ReplyEntry {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyEntry {
        ReplyEntry { reply: Reply::new(unique, sender) }
    }
}

impl ReplyEntry {
    /// Reply to a request with the given entry. The entry and its attributes are cached by
    /// the kernel for `ttl`.
    pub fn entry(self, ttl: &Duration, attr: &Attributes, generation: u64) {
        let (secs, nsecs) = time_from_duration(ttl);
        self.reply.ok(&fuse_entry_out {
            nodeid: attr.ino,
            generation,
            entry_valid: secs,
            attr_valid: secs,
            entry_valid_nsec: nsecs,
            attr_valid_nsec: nsecs,
            attr: attr.to_kernel(),
        });
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

///
/// Attribute Reply
///
#[derive(Debug)]
pub struct ReplyAttr {
    reply: ReplyRaw<fuse_attr_out>,
}

impl Reply for ReplyAttr {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyAttr {
        ReplyAttr { reply: Reply::new(unique, sender) }
    }
}

impl ReplyAttr {
    /// Reply to a request with the given attribute
    pub fn attr(self, ttl: &Duration, attr: &Attributes) {
        let (secs, nsecs) = time_from_duration(ttl);
        self.reply.ok(&fuse_attr_out {
            attr_valid: secs,
            attr_valid_nsec: nsecs,
            dummy: 0,
            attr: attr.to_kernel(),
        });
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

///
/// Open Reply
///
#[derive(Debug)]
pub struct ReplyOpen {
    reply: ReplyRaw<fuse_open_out>,
}

impl Reply for ReplyOpen {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyOpen {
        ReplyOpen { reply: Reply::new(unique, sender) }
    }
}

impl ReplyOpen {
    /// Reply to a request with the given open result
    pub fn opened(self, fh: u64, flags: u32) {
        self.reply.ok(&fuse_open_out { fh, open_flags: flags, padding: 0 });
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

///
/// Init Reply
///
#[derive(Debug)]
pub struct ReplyInit {
    reply: ReplyRaw<fuse_init_out>,
}

impl Reply for ReplyInit {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyInit {
        ReplyInit { reply: Reply::new(unique, sender) }
    }
}

impl ReplyInit {
    /// Reply to the handshake with the protocol version and capabilities we agree on
    pub fn init(self, major: u32, minor: u32, max_readahead: u32, flags: u32, max_write: u32) {
        self.reply.ok(&fuse_init_out {
            major,
            minor,
            max_readahead,
            flags,
            max_write,
            time_gran: 1,
            ..Default::default()
        });
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

///
/// Statfs Reply
///
#[derive(Debug)]
pub struct ReplyStatfs {
    reply: ReplyRaw<fuse_statfs_out>,
}

impl Reply for ReplyStatfs {
    fn new<S: ReplySender>(unique: u64, sender: S) -> ReplyStatfs {
        ReplyStatfs { reply: Reply::new(unique, sender) }
    }
}

impl ReplyStatfs {
    /// Reply to a request with the given filesystem statistics
    #[allow(clippy::too_many_arguments)]
    pub fn statfs(self, blocks: u64, bfree: u64, bavail: u64, files: u64, ffree: u64, bsize: u32, namelen: u32, frsize: u32) {
        self.reply.ok(&fuse_statfs_out {
            st: fuse_kstatfs { blocks, bfree, bavail, files, ffree, bsize, namelen, frsize, padding: 0, spare: [0; 6] },
        });
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: c_int) {
        self.reply.error(err);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{io, thread};
    use std::convert::TryInto;
    use std::sync::{mpsc, Arc, Mutex};
    use crate::attr::FileType;
    use super::*;

    #[allow(dead_code)]
    #[repr(C)]
    struct Data { a: u8, b: u8, c: u16 }

    #[test]
    fn serialize_empty() {
        let data = ();
        as_bytes(&data, |bytes| {
            assert!(bytes.is_empty());
        });
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn serialize_struct() {
        let data = Data { a: 0x12, b: 0x34, c: 0x5678 };
        as_bytes(&data, |bytes| {
            assert_eq!(bytes, [[0x12, 0x34, 0x78, 0x56]]);
        });
    }

    /// Sender that records every packet written to it.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct CaptureSender {
        packets: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl CaptureSender {
        pub(crate) fn packets(&self) -> Vec<Vec<u8>> {
            self.packets.lock().unwrap().clone()
        }
    }

    impl Write for CaptureSender {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            panic!("ReplySender::write is not supposed to be called");
        }

        fn flush(&mut self) -> io::Result<()> {
            panic!("ReplySender::flush is not supposed to be called");
        }

        fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
            let data: Vec<u8> = bufs.iter().map(|buf| buf.iter()).flatten().copied().collect();
            let len = data.len();
            self.packets.lock().unwrap().push(data);
            Ok(len)
        }
    }

    /// Decoded `fuse_out_header` of a reply packet: (len, error, unique).
    pub(crate) fn out_header(packet: &[u8]) -> (u32, i32, u64) {
        (
            u32::from_ne_bytes(packet[0..4].try_into().unwrap()),
            i32::from_ne_bytes(packet[4..8].try_into().unwrap()),
            u64::from_ne_bytes(packet[8..16].try_into().unwrap()),
        )
    }

    fn single_packet(sender: &CaptureSender) -> Vec<u8> {
        let mut packets = sender.packets();
        assert_eq!(packets.len(), 1);
        packets.remove(0)
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn reply_empty() {
        let sender = CaptureSender::default();
        let reply: ReplyEmpty = Reply::new(0xdeadbeef, sender.clone());
        reply.ok();
        assert_eq!(single_packet(&sender), vec![
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
        ]);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn reply_error() {
        let sender = CaptureSender::default();
        let reply: ReplyEntry = Reply::new(0xdeadbeef, sender.clone());
        reply.error(libc::ENOENT);
        assert_eq!(single_packet(&sender), vec![
            0x10, 0x00, 0x00, 0x00, 0xfe, 0xff, 0xff, 0xff,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
        ]);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn reply_data() {
        let sender = CaptureSender::default();
        let reply: ReplyData = Reply::new(0xdeadbeef, sender.clone());
        reply.data(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(single_packet(&sender), vec![
            0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
            0xde, 0xad, 0xbe, 0xef,
        ]);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn reply_open() {
        let sender = CaptureSender::default();
        let reply: ReplyOpen = Reply::new(0xdeadbeef, sender.clone());
        reply.opened(0x1122, 0x33);
        assert_eq!(single_packet(&sender), vec![
            0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,  0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00,
            0x22, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,  0x33, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_endian = "little"))]
    fn reply_entry() {
        let sender = CaptureSender::default();
        let reply: ReplyEntry = Reply::new(0xdeadbeef, sender.clone());
        let attr = Attributes::new(0x11, FileType::RegularFile, 0o644, 0x22);
        reply.entry(&Duration::new(1, 500), &attr, 0);
        let packet = single_packet(&sender);
        assert_eq!(out_header(&packet), (144, 0, 0xdeadbeef));
        let entry = &packet[16..];
        assert_eq!(entry[0..8], 0x11u64.to_ne_bytes());             // nodeid
        assert_eq!(entry[8..16], 0u64.to_ne_bytes());               // generation
        assert_eq!(entry[16..24], 1u64.to_ne_bytes());              // entry_valid
        assert_eq!(entry[24..32], 1u64.to_ne_bytes());              // attr_valid
        assert_eq!(entry[32..36], 500u32.to_ne_bytes());            // entry_valid_nsec
        assert_eq!(entry[36..40], 500u32.to_ne_bytes());            // attr_valid_nsec
        let attr = &entry[40..];
        assert_eq!(attr[0..8], 0x11u64.to_ne_bytes());              // ino
        assert_eq!(attr[8..16], 0x22u64.to_ne_bytes());             // size
        assert_eq!(attr[60..64], (libc::S_IFREG | 0o644).to_ne_bytes()); // mode
        assert_eq!(attr[64..68], 1u32.to_ne_bytes());               // nlink
    }

    #[test]
    #[cfg(all(target_os = "linux", target_endian = "little"))]
    fn reply_attr() {
        let sender = CaptureSender::default();
        let reply: ReplyAttr = Reply::new(0xdeadbeef, sender.clone());
        let attr = Attributes::new(0x11, FileType::Directory, 0o755, 0);
        reply.attr(&Duration::from_secs(1), &attr);
        let packet = single_packet(&sender);
        assert_eq!(out_header(&packet), (120, 0, 0xdeadbeef));
        let out = &packet[16..];
        assert_eq!(out[0..8], 1u64.to_ne_bytes());                  // attr_valid
        assert_eq!(out[16..24], 0x11u64.to_ne_bytes());             // ino
        assert_eq!(out[16 + 60..16 + 64], (libc::S_IFDIR | 0o755).to_ne_bytes());
        assert_eq!(out[16 + 64..16 + 68], 1u32.to_ne_bytes());
    }

    #[test]
    fn reply_init() {
        let sender = CaptureSender::default();
        let reply: ReplyInit = Reply::new(1, sender.clone());
        reply.init(7, 26, 0x20000, 1, 0x20000);
        let packet = single_packet(&sender);
        assert_eq!(out_header(&packet), (80, 0, 1));
        let out = &packet[16..];
        assert_eq!(out[0..4], 7u32.to_ne_bytes());                  // major
        assert_eq!(out[4..8], 26u32.to_ne_bytes());                 // minor
        assert_eq!(out[8..12], 0x20000u32.to_ne_bytes());           // max_readahead
        assert_eq!(out[12..16], 1u32.to_ne_bytes());                // flags
        assert_eq!(out[20..24], 0x20000u32.to_ne_bytes());          // max_write
        assert_eq!(out[24..28], 1u32.to_ne_bytes());                // time_gran
    }

    #[test]
    fn reply_statfs() {
        let sender = CaptureSender::default();
        let reply: ReplyStatfs = Reply::new(2, sender.clone());
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
        let packet = single_packet(&sender);
        assert_eq!(out_header(&packet), (96, 0, 2));
        let st = &packet[16..];
        assert_eq!(st[40..44], 512u32.to_ne_bytes());               // bsize
        assert_eq!(st[44..48], 255u32.to_ne_bytes());               // namelen
    }

    #[test]
    fn dropped_reply_sends_eio() {
        let sender = CaptureSender::default();
        {
            let _reply: ReplyData = Reply::new(42, sender.clone());
        }
        let packet = single_packet(&sender);
        assert_eq!(out_header(&packet), (16, -EIO, 42));
    }

    #[derive(Debug)]
    struct AsyncSender(mpsc::Sender<()>);

    impl Write for AsyncSender {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            panic!("ReplySender::write is not supposed to be called");
        }

        fn flush(&mut self) -> io::Result<()> {
            panic!("ReplySender::flush is not supposed to be called");
        }

        fn write_vectored(&mut self, _bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
            self.0.send(()).unwrap();
            Ok(0)
        }
    }

    #[test]
    fn async_reply() {
        let (tx, rx) = mpsc::channel();
        let reply: ReplyEmpty = Reply::new(0xdeadbeef, AsyncSender(tx));
        thread::spawn(move || {
            reply.ok();
        });
        rx.recv().unwrap();
        assert!(rx.recv().is_err());
    }
}
