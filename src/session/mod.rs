//! Session primitive consumed by the client
//!
//! An [`SmbSession`] is one live, stateful connection to a server. It is not
//! safe for concurrent use: the client only ever touches it from the worker
//! thread of a [`SessionExecutor`](crate::executor::SessionExecutor). Calls
//! block until the server answers and report failures as raw [`NtStatus`]
//! codes, which the client translates into [`Error`](crate::Error) values.
//!
//! Paths passed to a session are in wire form: backslash separated and
//! relative to the root of the tree connection (`\dir\file.txt`, `\`).

pub mod memory;

#[cfg(feature = "local")]
pub mod local;

use crate::error::NtStatus;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Result of a session call
pub type SessionResult<T> = std::result::Result<T, NtStatus>;

/// Tree connection identifier, valid between tree connect and disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub u32);

/// Descriptor of one open file within a tree connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

bitflags! {
    /// Access mode of an open file
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Origin of a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file
    Start,
    /// From the current position
    Current,
    /// From the end of the file
    End,
}

/// Attributes of one directory entry as reported by the server
///
/// Timestamps are Windows FILETIME values (100ns intervals since
/// 1601-01-01 UTC); zero means "not reported".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub creation_time: u64,
    pub access_time: u64,
    pub write_time: u64,
    pub change_time: u64,
}

/// One live connection to an SMB server
pub trait SmbSession: Send {
    /// Authenticate the session. `None` credentials request anonymous/guest
    /// access. Returns whether the server granted a guest session.
    fn login(&mut self, username: Option<&str>, password: Option<&str>) -> SessionResult<bool>;

    /// Tear the session down; no other call follows
    fn disconnect(&mut self);

    /// Names of the shares exported by the server
    fn list_shares(&mut self) -> SessionResult<Vec<String>>;

    /// Bind the session to a share
    fn tree_connect(&mut self, share: &str) -> SessionResult<TreeId>;

    /// Release a share binding
    fn tree_disconnect(&mut self, tid: TreeId) -> SessionResult<()>;

    /// Attributes of a path, `Ok(None)` when it does not exist
    fn stat(&mut self, tid: TreeId, path: &str) -> SessionResult<Option<EntryInfo>>;

    /// Entries of a directory in server enumeration order
    fn list(&mut self, tid: TreeId, path: &str) -> SessionResult<Vec<EntryInfo>>;

    /// Create one directory; the parent must exist
    fn create_directory(&mut self, tid: TreeId, path: &str) -> SessionResult<()>;

    /// Remove an empty directory
    fn remove_directory(&mut self, tid: TreeId, path: &str) -> SessionResult<()>;

    /// Remove a file
    fn unlink(&mut self, tid: TreeId, path: &str) -> SessionResult<()>;

    /// Rename or move a file or directory
    fn rename(&mut self, tid: TreeId, from: &str, to: &str) -> SessionResult<()>;

    /// Open a file. Modes including [`FileMode::WRITE`] create a missing file.
    fn open(&mut self, tid: TreeId, path: &str, mode: FileMode) -> SessionResult<Fd>;

    /// Close an open file
    fn close(&mut self, fd: Fd) -> SessionResult<()>;

    /// Read at the current position; `Ok(0)` at end of file
    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> SessionResult<usize>;

    /// Write at the current position
    fn write(&mut self, fd: Fd, buf: &[u8]) -> SessionResult<usize>;

    /// Reposition an open file, returning the new absolute position
    fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> SessionResult<u64>;
}

/// Opens sessions against resolved server addresses
pub trait SessionConnector: Send + Sync {
    /// Establish the transport to `addr`. Fails when no transport path to
    /// the server exists.
    fn connect(&self, addr: SocketAddr, netbios_name: &str) -> io::Result<Box<dyn SmbSession>>;
}

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET: u64 = 11_644_473_600;
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Convert a FILETIME value to a UTC timestamp, `None` for zero
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let seconds = (filetime / FILETIME_TICKS_PER_SECOND) as i64 - FILETIME_UNIX_OFFSET as i64;
    let nanos = ((filetime % FILETIME_TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

/// Convert a system time to a FILETIME value
pub fn filetime_from_system_time(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => {
            (since_epoch.as_secs() + FILETIME_UNIX_OFFSET) * FILETIME_TICKS_PER_SECOND
                + u64::from(since_epoch.subsec_nanos()) / 100
        }
        Err(_) => 0,
    }
}

/// Current time as a FILETIME value
pub fn filetime_now() -> u64 {
    filetime_from_system_time(SystemTime::now())
}
