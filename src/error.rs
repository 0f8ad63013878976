//! Error types for the SMB client and the status-code translator

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for SMB client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SMB client operations
#[derive(Debug, Error)]
pub enum Error {
    /// Failure with no more specific classification
    #[error("Unknown error")]
    Unknown,

    /// The server address could not be resolved
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// Resolution succeeded but produced no usable address
    #[error("No IP address resolved for {0}")]
    NoAddressResolved(String),

    /// The server connection is not (or no longer) established
    #[error("Not connected")]
    NotConnected,

    /// Operation attempted on a closed share or file
    #[error("Not open")]
    NotOpen,

    /// The path named by the operation does not exist
    #[error("No such file or directory: {0}")]
    NoSuchFileOrDirectory(String),

    /// Reading from an open file failed
    #[error("Read failed: {0}")]
    ReadFailed(NtStatus),

    /// Writing to an open file failed
    #[error("Write failed: {0}")]
    WriteFailed(NtStatus),

    /// Repositioning an open file failed
    #[error("Seek failed: {0}")]
    SeekFailed(NtStatus),

    /// Status code returned by the session, with the call that produced it
    #[error("{operation} failed: {status}")]
    Protocol {
        operation: &'static str,
        status: NtStatus,
    },

    /// No transport path to the server
    #[error("Connection error: {0}")]
    ConnectionFailed(String),

    /// Invalid parameter supplied by the caller
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Translate a session status code into an error.
    ///
    /// `operation` names the session call that failed and `path` is the
    /// remote path it was applied to, when there is one.
    pub fn from_status(status: NtStatus, operation: &'static str, path: Option<&str>) -> Self {
        match status {
            NtStatus::OBJECT_NAME_NOT_FOUND
            | NtStatus::OBJECT_PATH_NOT_FOUND
            | NtStatus::NO_SUCH_FILE => {
                Error::NoSuchFileOrDirectory(path.unwrap_or(operation).to_string())
            }
            status => Error::Protocol { operation, status },
        }
    }

    /// Session status carried by this error, if any
    pub fn status(&self) -> Option<NtStatus> {
        match self {
            Error::ReadFailed(status) | Error::WriteFailed(status) | Error::SeekFailed(status) => {
                Some(*status)
            }
            Error::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error reports a missing file, directory or share
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NoSuchFileOrDirectory(_) => true,
            Error::Protocol { status, .. } => {
                matches!(*status, NtStatus::BAD_NETWORK_NAME | NtStatus::BAD_NETWORK_PATH)
            }
            _ => false,
        }
    }
}

/// NT status code reported by the session (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: NtStatus = NtStatus(0x0000_0000);
    pub const NO_MORE_FILES: NtStatus = NtStatus(0x8000_0006);
    pub const UNSUCCESSFUL: NtStatus = NtStatus(0xC000_0001);
    pub const INVALID_HANDLE: NtStatus = NtStatus(0xC000_0008);
    pub const INVALID_PARAMETER: NtStatus = NtStatus(0xC000_000D);
    pub const NO_SUCH_FILE: NtStatus = NtStatus(0xC000_000F);
    pub const END_OF_FILE: NtStatus = NtStatus(0xC000_0011);
    pub const ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022);
    pub const OBJECT_NAME_INVALID: NtStatus = NtStatus(0xC000_0033);
    pub const OBJECT_NAME_NOT_FOUND: NtStatus = NtStatus(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: NtStatus = NtStatus(0xC000_0035);
    pub const OBJECT_PATH_NOT_FOUND: NtStatus = NtStatus(0xC000_003A);
    pub const LOGON_FAILURE: NtStatus = NtStatus(0xC000_006D);
    pub const ACCOUNT_DISABLED: NtStatus = NtStatus(0xC000_0072);
    pub const FILE_IS_A_DIRECTORY: NtStatus = NtStatus(0xC000_00BA);
    pub const NOT_SUPPORTED: NtStatus = NtStatus(0xC000_00BB);
    pub const BAD_NETWORK_PATH: NtStatus = NtStatus(0xC000_00BE);
    pub const NETWORK_NAME_DELETED: NtStatus = NtStatus(0xC000_00C9);
    pub const BAD_NETWORK_NAME: NtStatus = NtStatus(0xC000_00CC);
    pub const DIRECTORY_NOT_EMPTY: NtStatus = NtStatus(0xC000_0101);
    pub const NOT_A_DIRECTORY: NtStatus = NtStatus(0xC000_0103);
    pub const HOST_UNREACHABLE: NtStatus = NtStatus(0xC000_023D);

    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::SUCCESS
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        self.0 & 0xC000_0000 == 0xC000_0000
    }

    /// Check if this is a warning status
    pub fn is_warning(self) -> bool {
        self.0 & 0x8000_0000 == 0x8000_0000 && !self.is_error()
    }

    fn message(self) -> &'static str {
        match self {
            NtStatus::SUCCESS => "Success",
            NtStatus::NO_MORE_FILES => "No more files",
            NtStatus::UNSUCCESSFUL => "Unsuccessful",
            NtStatus::INVALID_HANDLE => "Invalid handle",
            NtStatus::INVALID_PARAMETER => "Invalid parameter",
            NtStatus::NO_SUCH_FILE => "No such file",
            NtStatus::END_OF_FILE => "End of file",
            NtStatus::ACCESS_DENIED => "Access denied",
            NtStatus::OBJECT_NAME_INVALID => "Object name invalid",
            NtStatus::OBJECT_NAME_NOT_FOUND => "Object name not found",
            NtStatus::OBJECT_NAME_COLLISION => "Object name collision",
            NtStatus::OBJECT_PATH_NOT_FOUND => "Object path not found",
            NtStatus::LOGON_FAILURE => "Logon failure",
            NtStatus::ACCOUNT_DISABLED => "Account disabled",
            NtStatus::FILE_IS_A_DIRECTORY => "File is a directory",
            NtStatus::NOT_SUPPORTED => "Not supported",
            NtStatus::BAD_NETWORK_PATH => "Bad network path",
            NtStatus::NETWORK_NAME_DELETED => "Network name deleted",
            NtStatus::BAD_NETWORK_NAME => "Bad network name",
            NtStatus::DIRECTORY_NOT_EMPTY => "Directory not empty",
            NtStatus::NOT_A_DIRECTORY => "Not a directory",
            NtStatus::HOST_UNREACHABLE => "Host unreachable",
            _ => "Unrecognized status",
        }
    }
}

impl From<u32> for NtStatus {
    fn from(value: u32) -> Self {
        NtStatus(value)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.message(), self.0)
    }
}
