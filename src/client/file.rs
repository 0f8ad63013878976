//! Files and directories on a share
//!
//! A [`File`] is a path-addressed node. It may carry a status snapshot and,
//! while open, a descriptor; read, write and seek need the descriptor, every
//! other operation works on the path alone.

use super::share::Share;
use crate::error::{Error, Result};
use crate::path;
use crate::session::{filetime_to_datetime, EntryInfo, Fd, FileMode, Whence};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Attributes of a file or directory at the time it was stat'd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub exists: bool,
    pub is_directory: bool,
    pub size: u64,
    pub creation_time: Option<DateTime<Utc>>,
    /// Last attribute or content change
    pub modification_time: Option<DateTime<Utc>>,
    pub access_time: Option<DateTime<Utc>>,
    pub write_time: Option<DateTime<Utc>>,
    /// When this snapshot was taken
    pub status_time: Option<DateTime<Utc>>,
}

impl FileStat {
    pub(crate) fn from_entry(entry: &EntryInfo, status_time: DateTime<Utc>) -> Self {
        Self {
            exists: true,
            is_directory: entry.is_directory,
            size: entry.size,
            creation_time: filetime_to_datetime(entry.creation_time),
            modification_time: filetime_to_datetime(entry.change_time),
            access_time: filetime_to_datetime(entry.access_time),
            write_time: filetime_to_datetime(entry.write_time),
            status_time: Some(status_time),
        }
    }

    /// Snapshot of a path that does not exist
    pub fn missing() -> Self {
        Self {
            exists: false,
            is_directory: false,
            size: 0,
            creation_time: None,
            modification_time: None,
            access_time: None,
            write_time: None,
            status_time: Some(Utc::now()),
        }
    }

    pub(crate) fn root() -> Self {
        Self {
            exists: true,
            is_directory: true,
            ..Self::missing()
        }
    }
}

/// Cached status of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Status {
    /// Never stat'd
    #[default]
    Unstated,
    Known(FileStat),
}

impl Status {
    pub fn known(&self) -> Option<&FileStat> {
        match self {
            Status::Unstated => None,
            Status::Known(stat) => Some(stat),
        }
    }
}

/// An open file on the server.
///
/// Holds a reference on its share's tree connection until closed.
#[derive(Debug)]
pub struct Descriptor {
    fd: Fd,
    mode: FileMode,
    generation: u64,
}

impl Descriptor {
    pub(crate) fn new(fd: Fd, mode: FileMode, generation: u64) -> Self {
        Self {
            fd,
            mode,
            generation,
        }
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// One step of a streaming read
#[derive(Debug, Clone, Copy)]
pub struct ReadProgress<'a> {
    /// Bytes delivered so far, including `data`
    pub total: u64,
    /// The chunk just read; `None` on the final record
    pub data: Option<&'a [u8]>,
    pub complete: bool,
    pub error: Option<&'a Error>,
}

/// One step of a streaming write
#[derive(Debug, Clone, Copy)]
pub struct WriteProgress<'a> {
    /// Bytes written so far
    pub total: u64,
    /// Size of the most recently written chunk
    pub last: usize,
    pub complete: bool,
    pub error: Option<&'a Error>,
}

/// A file or directory on a share
#[derive(Debug)]
pub struct File {
    share: Share,
    path: String,
    status: Status,
    descriptor: Option<Descriptor>,
}

impl File {
    /// Root directory of `share`
    pub fn root(share: &Share) -> Self {
        Self::new(share, path::ROOT)
    }

    /// Node for `file_path`, relative paths being taken from the root
    pub fn new(share: &Share, file_path: &str) -> Self {
        Self {
            share: share.clone(),
            path: path::normalize(file_path),
            status: Status::Unstated,
            descriptor: None,
        }
    }

    /// Node for `relative` resolved against `base`.
    ///
    /// A base known to be a plain file resolves against its directory.
    pub fn relative_to(base: &File, relative: &str) -> Self {
        let dir = match base.status.known() {
            Some(stat) if stat.exists && !stat.is_directory => {
                path::parent(&base.path).unwrap_or_else(|| path::ROOT.to_string())
            }
            _ => base.path.clone(),
        };
        Self::new(&base.share, &path::join(&dir, relative))
    }

    pub(crate) fn with_status(share: &Share, file_path: &str, stat: FileStat) -> Self {
        let mut file = Self::new(share, file_path);
        file.status = Status::Known(stat);
        file
    }

    pub fn share(&self) -> &Share {
        &self.share
    }

    /// Absolute path within the share
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment; the share name for the root
    pub fn name(&self) -> &str {
        if path::is_root(&self.path) {
            self.share.name()
        } else {
            path::file_name(&self.path)
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn stat(&self) -> Option<&FileStat> {
        self.status.known()
    }

    pub fn is_open(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    /// Fresh node for the parent directory; `None` for the root
    pub fn parent(&self) -> Option<File> {
        path::parent(&self.path).map(|parent| File::new(&self.share, &parent))
    }

    fn take_status(mut self) -> Status {
        std::mem::take(&mut self.status)
    }

    fn descriptor_or_not_open(&self) -> Result<&Descriptor> {
        self.descriptor.as_ref().ok_or(Error::NotOpen)
    }

    /// Open the file in `mode`.
    ///
    /// Already open in the same mode is a no-op; open in another mode
    /// closes and reopens.
    pub async fn open(&mut self, mode: FileMode) -> Result<()> {
        match self.descriptor.as_ref().map(Descriptor::mode) {
            Some(current) if current == mode => return Ok(()),
            Some(_) => self.close().await,
            None => {}
        }

        let (node, descriptor) = self.share.open_file(&self.path, mode).await?;
        self.status = node.take_status();
        self.descriptor = Some(descriptor);
        Ok(())
    }

    /// Release the descriptor; closing a closed node does nothing
    pub async fn close(&mut self) {
        let Some(descriptor) = self.descriptor.take() else {
            return;
        };
        match self.share.close_file(descriptor, &self.path).await {
            Ok(node) => self.status = node.take_status(),
            Err(e) => debug!("Closed {} without refreshing status: {}", self.path, e),
        }
    }

    /// Stream the file in chunks of at most `buffer_size` bytes.
    ///
    /// Reads until end of file, or until `max_bytes` when given. `progress`
    /// sees every chunk and returns false to stop early. It then receives
    /// one final record with `complete` set, carrying the error if the read
    /// failed. Returns the number of bytes delivered.
    pub async fn read<F>(&self, buffer_size: usize, max_bytes: Option<u64>, mut progress: F) -> Result<u64>
    where
        F: FnMut(ReadProgress<'_>) -> bool,
    {
        let mut total = 0;
        let outcome = self
            .read_chunks(buffer_size, max_bytes, &mut progress, &mut total)
            .await;

        progress(ReadProgress {
            total,
            data: None,
            complete: true,
            error: outcome.as_ref().err(),
        });
        outcome.map(|()| total)
    }

    async fn read_chunks<F>(
        &self,
        buffer_size: usize,
        max_bytes: Option<u64>,
        progress: &mut F,
        total: &mut u64,
    ) -> Result<()>
    where
        F: FnMut(ReadProgress<'_>) -> bool,
    {
        if buffer_size == 0 {
            return Err(Error::InvalidParameter("buffer size must not be zero".into()));
        }
        let descriptor = self.descriptor_or_not_open()?;

        loop {
            let wanted = match max_bytes {
                Some(max) if *total >= max => break,
                Some(max) => (max - *total).min(buffer_size as u64) as usize,
                None => buffer_size,
            };

            let chunk = self.share.read_chunk(descriptor, wanted).await?;
            if chunk.is_empty() {
                break;
            }
            *total += chunk.len() as u64;

            let more = progress(ReadProgress {
                total: *total,
                data: Some(&chunk),
                complete: false,
                error: None,
            });
            if !more {
                debug!("Read of {} stopped by caller after {} bytes", self.path, total);
                break;
            }
        }
        Ok(())
    }

    /// Write chunks pulled from `producer` until it returns `None` or an
    /// empty chunk.
    ///
    /// `producer` is passed the number of bytes written so far. `progress`
    /// fires after each chunk and once more with `complete` set, carrying
    /// the error if the write failed. Returns the number of bytes written.
    pub async fn write<P, F>(&self, mut producer: P, mut progress: F) -> Result<u64>
    where
        P: FnMut(u64) -> Option<Bytes>,
        F: FnMut(WriteProgress<'_>),
    {
        let mut total = 0;
        let mut last = 0;
        let outcome = self
            .write_chunks(&mut producer, &mut progress, &mut total, &mut last)
            .await;

        progress(WriteProgress {
            total,
            last,
            complete: true,
            error: outcome.as_ref().err(),
        });
        outcome.map(|()| total)
    }

    async fn write_chunks<P, F>(
        &self,
        producer: &mut P,
        progress: &mut F,
        total: &mut u64,
        last: &mut usize,
    ) -> Result<()>
    where
        P: FnMut(u64) -> Option<Bytes>,
        F: FnMut(WriteProgress<'_>),
    {
        let descriptor = self.descriptor_or_not_open()?;

        while let Some(chunk) = producer(*total).filter(|chunk| !chunk.is_empty()) {
            let written = self.share.write_chunk(descriptor, chunk).await?;
            *total += written as u64;
            *last = written;
            progress(WriteProgress {
                total: *total,
                last: written,
                complete: false,
                error: None,
            });
        }
        Ok(())
    }

    /// Move the file position, from the start when `absolute` and from the
    /// current position otherwise. Returns the new absolute position.
    pub async fn seek(&self, offset: i64, absolute: bool) -> Result<u64> {
        let descriptor = self.descriptor_or_not_open()?;
        let whence = if absolute { Whence::Start } else { Whence::Current };
        self.share.seek(descriptor, offset, whence).await
    }

    /// Read the rest of the file, or at most `max_bytes` of it
    pub async fn read_to_end(&self, max_bytes: Option<u64>) -> Result<Bytes> {
        let buffer_size = self.share.server().config().buffer_size;
        let mut data = BytesMut::new();
        self.read(buffer_size, max_bytes, |step| {
            if let Some(chunk) = step.data {
                data.extend_from_slice(chunk);
            }
            true
        })
        .await?;
        Ok(data.freeze())
    }

    /// Write all of `data` at the current position
    pub async fn write_all(&self, data: Bytes) -> Result<u64> {
        let buffer_size = self.share.server().config().buffer_size;
        if buffer_size == 0 {
            return Err(Error::InvalidParameter("buffer size must not be zero".into()));
        }
        self.write(
            |written| {
                let start = written as usize;
                (start < data.len()).then(|| data.slice(start..data.len().min(start + buffer_size)))
            },
            |_| {},
        )
        .await
    }

    pub async fn list_files(&self) -> Result<Vec<File>> {
        self.share.list_files(&self.path).await
    }

    pub async fn list_files_filtered<F>(&self, filter: F) -> Result<Vec<File>>
    where
        F: FnMut(&File) -> bool,
    {
        self.share.list_files_filtered(&self.path, filter).await
    }

    /// Refresh the cached status; a missing path is not an error
    pub async fn update_status(&mut self) -> Result<FileStat> {
        let stat = self.share.status(&self.path).await?;
        self.status = Status::Known(stat.clone());
        Ok(stat)
    }

    pub async fn create_directory(&mut self) -> Result<()> {
        let node = self.share.create_directory(&self.path).await?;
        self.status = node.take_status();
        Ok(())
    }

    pub async fn create_directories(&mut self) -> Result<()> {
        let node = self.share.create_directories(&self.path).await?;
        self.status = node.take_status();
        Ok(())
    }

    /// Remove the file or empty directory.
    ///
    /// An open descriptor is left in place but no longer refers to anything
    /// useful.
    pub async fn delete(&mut self) -> Result<()> {
        self.share.delete_file(&self.path).await?;
        self.status = Status::Known(FileStat::missing());
        Ok(())
    }

    /// Move the entity to `new_path` and return a node for the destination.
    ///
    /// This node keeps its path; its status is reset to [`Status::Unstated`].
    /// A relative `new_path` is taken from this node's directory.
    pub async fn move_to(&mut self, new_path: &str) -> Result<File> {
        let dir = path::parent(&self.path).unwrap_or_else(|| path::ROOT.to_string());
        let destination = path::join(&dir, new_path);
        let node = self.share.move_file(&self.path, &destination).await?;
        self.status = Status::Unstated;
        Ok(node)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let Some(descriptor) = self.descriptor.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let share = self.share.clone();
                let file_path = std::mem::take(&mut self.path);
                handle.spawn(async move {
                    if let Err(e) = share.close_file(descriptor, &file_path).await {
                        warn!("Failed to close dropped file {}: {}", file_path, e);
                    }
                });
            }
            Err(_) => warn!(
                "Dropped {} while open with no runtime to close {}",
                self.path,
                descriptor.fd()
            ),
        }
    }
}
