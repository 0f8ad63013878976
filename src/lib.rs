//! Asynchronous SMB file-share client
//!
//! Connect to a file server, open its shares and work with remote files and
//! directories. Every call against one server runs through a single
//! serialized session worker, so operations complete in submission order.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod executor;
pub mod path;
pub mod session;

#[cfg(test)]
pub mod e2e_tests;

pub use client::{
    ClientConfig, Descriptor, Device, DeviceType, File, FileServer, FileStat, ReadProgress,
    Share, Status, WriteProgress,
};
pub use error::{Error, NtStatus, Result};
pub use session::FileMode;
