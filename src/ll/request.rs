//! Filesystem operation request
//!
//! A request represents information about a filesystem operation the kernel driver wants us to
//! perform. Decoding copies everything the operation needs out of the receive buffer, so a
//! request stays valid after the buffer is reused for the next read.

use std::convert::TryFrom;
use std::ffi::OsString;
use std::{error, fmt, mem};

use fuse_abi::consts::FUSE_GETATTR_FH;
use fuse_abi::fuse_opcode::*;
use fuse_abi::*;

use super::argument::ArgumentIterator;

/// Error that may occur while reading and parsing a request from the kernel driver.
#[derive(Debug, PartialEq)]
pub enum RequestError {
    /// Not enough data for parsing header (short read).
    ShortReadHeader(usize),
    /// Not enough data for arguments (short read).
    ShortRead { len: usize, total: usize, opcode: u32, unique: u64 },
    /// Insufficient argument data.
    InsufficientData { opcode: u32, unique: u64 },
}

impl RequestError {
    /// Returns the opcode and unique id of the request if its header could be decoded. The
    /// kernel waits for a reply to such a request even though it can't be served.
    pub fn header(&self) -> Option<(u32, u64)> {
        match *self {
            RequestError::ShortReadHeader(_) => None,
            RequestError::ShortRead { opcode, unique, .. } => Some((opcode, unique)),
            RequestError::InsufficientData { opcode, unique } => Some((opcode, unique)),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => write!(
                f,
                "Short read of FUSE request header ({} < {})",
                len,
                mem::size_of::<fuse_in_header>()
            ),
            RequestError::ShortRead { len, total, opcode, unique } => {
                write!(f, "Short read of FUSE request {} opcode {} ({} < {})", unique, opcode, len, total)
            }
            RequestError::InsufficientData { opcode, unique } => {
                write!(f, "Insufficient argument data in FUSE request {} opcode {}", unique, opcode)
            }
        }
    }
}

impl error::Error for RequestError {}

/// Filesystem operation (and arguments) the kernel driver wants us to perform.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Lookup { name: OsString },
    Forget { nlookup: u64 },
    GetAttr { fh: Option<u64> },
    Open { flags: u32 },
    Read { fh: u64, offset: u64, size: u32 },
    StatFs,
    Release { fh: u64, flags: u32 },
    Init { major: u32, minor: u32, max_readahead: u32, flags: u32 },
    OpenDir { flags: u32 },
    ReadDir { fh: u64, offset: u64, size: u32 },
    ReleaseDir { fh: u64, flags: u32 },
    Interrupt { unique: u64 },
    Destroy,
    BatchForget { count: u32 },
    /// Valid request with an operation this filesystem doesn't implement.
    Unsupported { opcode: u32 },
}

impl Operation {
    fn parse(opcode: u32, data: &mut ArgumentIterator<'_>) -> Option<Self> {
        let opcode = match fuse_opcode::try_from(opcode) {
            Ok(opcode) => opcode,
            Err(opcode) => return Some(Operation::Unsupported { opcode }),
        };
        Some(match opcode {
            FUSE_LOOKUP => Operation::Lookup { name: data.fetch_str()?.to_os_string() },
            FUSE_FORGET => {
                let arg: fuse_forget_in = data.fetch()?;
                Operation::Forget { nlookup: arg.nlookup }
            }
            FUSE_GETATTR => {
                // Since ABI 7.9, the kernel tells us which open file the request came from
                let fh = match data.fetch::<fuse_getattr_in>() {
                    Some(arg) if arg.getattr_flags & FUSE_GETATTR_FH != 0 => Some(arg.fh),
                    _ => None,
                };
                Operation::GetAttr { fh }
            }
            FUSE_OPEN => {
                let arg: fuse_open_in = data.fetch()?;
                Operation::Open { flags: arg.flags }
            }
            FUSE_READ => {
                let arg: fuse_read_in = data.fetch()?;
                Operation::Read { fh: arg.fh, offset: arg.offset, size: arg.size }
            }
            FUSE_STATFS => Operation::StatFs,
            FUSE_RELEASE => {
                let arg: fuse_release_in = data.fetch()?;
                Operation::Release { fh: arg.fh, flags: arg.flags }
            }
            FUSE_INIT => {
                let arg: fuse_init_in = data.fetch()?;
                Operation::Init {
                    major: arg.major,
                    minor: arg.minor,
                    max_readahead: arg.max_readahead,
                    flags: arg.flags,
                }
            }
            FUSE_OPENDIR => {
                let arg: fuse_open_in = data.fetch()?;
                Operation::OpenDir { flags: arg.flags }
            }
            FUSE_READDIR => {
                let arg: fuse_read_in = data.fetch()?;
                Operation::ReadDir { fh: arg.fh, offset: arg.offset, size: arg.size }
            }
            FUSE_RELEASEDIR => {
                let arg: fuse_release_in = data.fetch()?;
                Operation::ReleaseDir { fh: arg.fh, flags: arg.flags }
            }
            FUSE_INTERRUPT => {
                let arg: fuse_interrupt_in = data.fetch()?;
                Operation::Interrupt { unique: arg.unique }
            }
            FUSE_DESTROY => Operation::Destroy,
            FUSE_BATCH_FORGET => {
                let arg: fuse_batch_forget_in = data.fetch()?;
                Operation::BatchForget { count: arg.count }
            }
        })
    }
}

/// Request data structure.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Header of the FUSE request
    header: RequestHeader,
    /// Operation-specific data
    operation: Operation,
}

/// Header fields of a request, copied out of the kernel's `fuse_in_header`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct RequestHeader {
    opcode: u32,
    unique: u64,
    nodeid: u64,
    uid: u32,
    gid: u32,
    pid: u32,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (unique, ino) = (self.header.unique, self.header.nodeid);
        match &self.operation {
            Operation::Lookup { name } => write!(f, "LOOKUP({}) parent {:#018x}, name {:?}", unique, ino, name),
            Operation::Forget { nlookup } => write!(f, "FORGET({}) ino {:#018x}, nlookup {}", unique, ino, nlookup),
            Operation::GetAttr { fh } => write!(f, "GETATTR({}) ino {:#018x}, fh {:?}", unique, ino, fh),
            Operation::Open { flags } => write!(f, "OPEN({}) ino {:#018x}, flags {:#x}", unique, ino, flags),
            Operation::Read { fh, offset, size } => write!(f, "READ({}) ino {:#018x}, fh {}, offset {}, size {}", unique, ino, fh, offset, size),
            Operation::StatFs => write!(f, "STATFS({}) ino {:#018x}", unique, ino),
            Operation::Release { fh, flags } => write!(f, "RELEASE({}) ino {:#018x}, fh {}, flags {:#x}", unique, ino, fh, flags),
            Operation::Init { major, minor, max_readahead, flags } => write!(f, "INIT({}) kernel: ABI {}.{}, flags {:#x}, max readahead {}", unique, major, minor, flags, max_readahead),
            Operation::OpenDir { flags } => write!(f, "OPENDIR({}) ino {:#018x}, flags {:#x}", unique, ino, flags),
            Operation::ReadDir { fh, offset, size } => write!(f, "READDIR({}) ino {:#018x}, fh {}, offset {}, size {}", unique, ino, fh, offset, size),
            Operation::ReleaseDir { fh, flags } => write!(f, "RELEASEDIR({}) ino {:#018x}, fh {}, flags {:#x}", unique, ino, fh, flags),
            Operation::Interrupt { unique: target } => write!(f, "INTERRUPT({}) unique {}", unique, target),
            Operation::Destroy => write!(f, "DESTROY({})", unique),
            Operation::BatchForget { count } => write!(f, "BATCH_FORGET({}) count {}", unique, count),
            Operation::Unsupported { opcode } => write!(f, "UNSUPPORTED({}) opcode {}, ino {:#018x}", unique, opcode, ino),
        }
    }
}

impl TryFrom<&[u8]> for Request {
    type Error = RequestError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        // Parse a raw packet as sent by the kernel driver into typed data. Every request always
        // begins with a `fuse_in_header` struct followed by arbitrary data depending on which
        // opcode it contains.
        let data_len = data.len();
        let mut data = ArgumentIterator::new(data);
        let header: fuse_in_header = data.fetch().ok_or(RequestError::ShortReadHeader(data_len))?;
        if data_len < header.len as usize {
            return Err(RequestError::ShortRead {
                len: data_len,
                total: header.len as usize,
                opcode: header.opcode,
                unique: header.unique,
            });
        }
        let operation = Operation::parse(header.opcode, &mut data)
            .ok_or(RequestError::InsufficientData { opcode: header.opcode, unique: header.unique })?;
        Ok(Self {
            header: RequestHeader {
                opcode: header.opcode,
                unique: header.unique,
                nodeid: header.nodeid,
                uid: header.uid,
                gid: header.gid,
                pid: header.pid,
            },
            operation,
        })
    }
}

impl Request {
    /// Returns the unique identifier of this request.
    ///
    /// The FUSE kernel driver assigns a unique id to every concurrent request. This allows to
    /// distinguish between multiple concurrent requests. The unique id of a request may be
    /// reused in later requests after it has completed.
    #[inline]
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Returns the node id of the inode this request is targeted to.
    #[inline]
    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    /// Returns the raw opcode of this request.
    #[inline]
    pub fn opcode(&self) -> u32 {
        self.header.opcode
    }

    /// Returns the UID that the process that triggered this request runs under.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Returns the GID that the process that triggered this request runs under.
    #[inline]
    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    /// Returns the PID of the process that triggered this request.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    /// Returns the filesystem operation (and its arguments) of this request.
    #[inline]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}
