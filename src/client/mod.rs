//! SMB client: server connections, shares and remote files

pub mod file;
pub mod server;
pub mod share;

pub use file::{Descriptor, File, FileStat, ReadProgress, Status, WriteProgress};
pub use server::{Device, DeviceType, FileServer};
pub use share::Share;

/// SMB client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port used when resolving the server address
    pub port: u16,
    /// Thread name of the session worker
    pub worker_name: String,
    /// Chunk size for whole-file reads and writes
    pub buffer_size: usize,
    /// Include administrative shares (`IPC$`, `C$`, ...) in share listings
    pub show_hidden_shares: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: 445,
            worker_name: String::from("smb-session"),
            buffer_size: 64 * 1024,
            show_hidden_shares: false,
        }
    }
}
