//! Shares exported by a file server
//!
//! A share's tree connection is reference counted: every successful
//! [`Share::open`] and every file descriptor opened through the share holds
//! one reference, and the tree is disconnected when the last one is
//! released.

use super::file::{Descriptor, File, FileStat};
use super::server::FileServer;
use crate::error::{Error, NtStatus, Result};
use crate::executor::SessionExecutor;
use crate::path;
use crate::session::{EntryInfo, FileMode, SmbSession, TreeId, Whence};
use bytes::Bytes;
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct TreeBinding {
    tid: TreeId,
    generation: u64,
}

#[derive(Debug, Default)]
struct TreeState {
    binding: Option<TreeBinding>,
    opens: usize,
    descriptors: usize,
}

pub(crate) struct ShareInner {
    server: FileServer,
    name: String,
    tree: Mutex<TreeState>,
    /// Serializes tree connect and disconnect
    transition: tokio::sync::Mutex<()>,
}

/// One share of a file server.
///
/// Cheap to clone; clones refer to the same tree connection.
#[derive(Clone)]
pub struct Share {
    inner: Arc<ShareInner>,
}

/// Registry entry that does not keep a share alive
pub(crate) struct WeakShare(Weak<ShareInner>);

impl WeakShare {
    pub(crate) fn upgrade(&self) -> Option<Share> {
        self.0.upgrade().map(|inner| Share { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Stat a path, treating the not-found statuses as absence
fn stat_entry(
    session: &mut dyn SmbSession,
    tid: TreeId,
    entry_path: &str,
) -> Result<Option<EntryInfo>> {
    match session.stat(tid, &path::to_smb(entry_path)) {
        Ok(entry) => Ok(entry),
        Err(status) => match Error::from_status(status, "stat", Some(entry_path)) {
            Error::NoSuchFileOrDirectory(_) => Ok(None),
            e => Err(e),
        },
    }
}

impl Share {
    pub(crate) fn new(server: FileServer, name: &str) -> Self {
        Self {
            inner: Arc::new(ShareInner {
                server,
                name: name.to_string(),
                tree: Mutex::new(TreeState::default()),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakShare {
        WeakShare(Arc::downgrade(&self.inner))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server(&self) -> &FileServer {
        &self.inner.server
    }

    /// Whether the share holds a tree connection on the live session
    pub fn is_open(&self) -> bool {
        self.current_binding().is_some()
    }

    /// Root directory of the share
    pub fn root(&self) -> File {
        File::root(self)
    }

    fn tree(&self) -> MutexGuard<'_, TreeState> {
        self.inner.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_binding(&self) -> Option<TreeBinding> {
        self.tree()
            .binding
            .filter(|binding| self.inner.server.is_current(binding.generation))
    }

    /// Executor and tree id for a data operation
    fn tree_handle(&self) -> Result<(SessionExecutor, TreeId)> {
        let (executor, generation) = self.inner.server.executor()?;
        match self.tree().binding {
            Some(binding) if binding.generation == generation => Ok((executor, binding.tid)),
            _ => Err(Error::NotOpen),
        }
    }

    /// Take one reference on the tree connection, connecting it if needed
    pub async fn open(&self) -> Result<()> {
        let _transition = self.inner.transition.lock().await;

        if self.current_binding().is_some() {
            self.tree().opens += 1;
            return Ok(());
        }

        let (tid, generation) = self.inner.server.open_share(&self.inner.name).await?;
        *self.tree() = TreeState {
            binding: Some(TreeBinding { tid, generation }),
            opens: 1,
            descriptors: 0,
        };
        debug!("Opened share {} as {}", self.inner.name, tid);
        Ok(())
    }

    /// Release one reference taken by [`open`](Self::open).
    ///
    /// The tree is disconnected once no opens or descriptors remain. Closing
    /// a closed share does nothing, and transport failures are only logged.
    pub async fn close(&self) {
        let _transition = self.inner.transition.lock().await;

        let binding = {
            let mut tree = self.tree();
            match tree.binding {
                Some(binding) if self.inner.server.is_current(binding.generation) => {
                    tree.opens = tree.opens.saturating_sub(1);
                    if tree.opens > 0 || tree.descriptors > 0 {
                        return;
                    }
                    *tree = TreeState::default();
                    binding
                }
                _ => {
                    *tree = TreeState::default();
                    return;
                }
            }
        };

        self.inner
            .server
            .close_share(binding.tid, binding.generation)
            .await;
        debug!("Closed share {}", self.inner.name);
    }

    /// Entries of the directory at `dir`, each with its status filled in
    pub async fn list_files(&self, dir: &str) -> Result<Vec<File>> {
        self.list_files_filtered(dir, |_| true).await
    }

    /// Entries of the directory at `dir` for which `filter` returns true.
    ///
    /// The filter sees entries in server enumeration order, and the result
    /// keeps that order.
    pub async fn list_files_filtered<F>(&self, dir: &str, mut filter: F) -> Result<Vec<File>>
    where
        F: FnMut(&File) -> bool,
    {
        let (executor, tid) = self.tree_handle()?;
        let dir = path::normalize(dir);

        let target = dir.clone();
        let entries = executor
            .submit(move |session| {
                session
                    .list(tid, &path::to_smb(&target))
                    .map_err(|status| Error::from_status(status, "list", Some(&target)))
            })
            .await?;

        let stat_time = Utc::now();
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let file = File::with_status(
                self,
                &path::join(&dir, &entry.name),
                FileStat::from_entry(&entry, stat_time),
            );
            if filter(&file) {
                files.push(file);
            }
        }

        debug!("Listed {} entries in {}", files.len(), dir);
        Ok(files)
    }

    /// Status of `entry_path` without opening it.
    ///
    /// A path that does not exist yields a status with `exists == false`,
    /// not an error.
    pub async fn status(&self, entry_path: &str) -> Result<FileStat> {
        let (executor, tid) = self.tree_handle()?;
        let target = path::normalize(entry_path);
        if path::is_root(&target) {
            return Ok(FileStat::root());
        }

        let entry = executor
            .submit(move |session| stat_entry(session, tid, &target))
            .await?;
        Ok(match entry {
            Some(entry) => FileStat::from_entry(&entry, Utc::now()),
            None => FileStat::missing(),
        })
    }

    /// Create the single directory `dir_path`; its parent must exist
    pub async fn create_directory(&self, dir_path: &str) -> Result<File> {
        let (executor, tid) = self.tree_handle()?;
        let target = path::normalize(dir_path);

        let job_target = target.clone();
        let entry = executor
            .submit(move |session| {
                session
                    .create_directory(tid, &path::to_smb(&job_target))
                    .map_err(|status| {
                        Error::from_status(status, "create directory", Some(&job_target))
                    })?;
                stat_entry(session, tid, &job_target)
            })
            .await?;

        debug!("Created directory {}", target);
        Ok(self.node(&target, entry))
    }

    /// Create `dir_path` and every missing ancestor, top down.
    ///
    /// Existing directories along the way are accepted. The first hard
    /// failure stops the walk; directories already created stay in place.
    pub async fn create_directories(&self, dir_path: &str) -> Result<File> {
        let (executor, tid) = self.tree_handle()?;
        let target = path::normalize(dir_path);

        let job_target = target.clone();
        let entry = executor
            .submit(move |session| {
                for ancestor in path::ancestors(&job_target) {
                    match stat_entry(session, tid, &ancestor)? {
                        Some(entry) if entry.is_directory => continue,
                        Some(_) => {
                            return Err(Error::from_status(
                                NtStatus::OBJECT_NAME_COLLISION,
                                "create directory",
                                Some(&ancestor),
                            ))
                        }
                        None => session
                            .create_directory(tid, &path::to_smb(&ancestor))
                            .map_err(|status| {
                                Error::from_status(status, "create directory", Some(&ancestor))
                            })?,
                    }
                }
                stat_entry(session, tid, &job_target)
            })
            .await?;

        Ok(self.node(&target, entry))
    }

    /// Remove a file or an empty directory
    pub async fn delete_file(&self, entry_path: &str) -> Result<()> {
        let (executor, tid) = self.tree_handle()?;
        let target = path::normalize(entry_path);

        let job_target = target.clone();
        executor
            .submit(move |session| {
                let entry = stat_entry(session, tid, &job_target)?
                    .ok_or_else(|| Error::NoSuchFileOrDirectory(job_target.clone()))?;
                let wire = path::to_smb(&job_target);
                if entry.is_directory {
                    session
                        .remove_directory(tid, &wire)
                        .map_err(|status| Error::from_status(status, "remove directory", Some(&job_target)))
                } else {
                    session
                        .unlink(tid, &wire)
                        .map_err(|status| Error::from_status(status, "unlink", Some(&job_target)))
                }
            })
            .await?;

        debug!("Deleted {}", target);
        Ok(())
    }

    /// Rename or move `from` to `to`, returning a node for the destination
    pub async fn move_file(&self, from: &str, to: &str) -> Result<File> {
        let (executor, tid) = self.tree_handle()?;
        let source = path::normalize(from);
        let destination = path::normalize(to);

        let (job_source, job_destination) = (source.clone(), destination.clone());
        let entry = executor
            .submit(move |session| {
                session
                    .rename(
                        tid,
                        &path::to_smb(&job_source),
                        &path::to_smb(&job_destination),
                    )
                    .map_err(|status| Error::from_status(status, "rename", Some(&job_source)))?;
                stat_entry(session, tid, &job_destination)
            })
            .await?;

        debug!("Moved {} to {}", source, destination);
        Ok(self.node(&destination, entry))
    }

    /// Open `file_path`, returning its node and the new descriptor.
    ///
    /// The descriptor holds a reference on the tree connection until it is
    /// passed to [`close_file`](Self::close_file).
    pub async fn open_file(&self, file_path: &str, mode: FileMode) -> Result<(File, Descriptor)> {
        let (executor, tid, generation) = self.acquire_descriptor()?;
        let target = path::normalize(file_path);

        let job_target = target.clone();
        let opened = executor
            .submit(move |session| {
                let fd = session
                    .open(tid, &path::to_smb(&job_target), mode)
                    .map_err(|status| Error::from_status(status, "open", Some(&job_target)))?;
                let entry = stat_entry(session, tid, &job_target).unwrap_or(None);
                Ok((fd, entry))
            })
            .await;

        match opened {
            Ok((fd, entry)) => {
                debug!("Opened {} as {} ({:?})", target, fd, mode);
                Ok((self.node(&target, entry), Descriptor::new(fd, mode, generation)))
            }
            Err(e) => {
                self.release_descriptor(generation).await;
                Err(e)
            }
        }
    }

    /// Close a descriptor returned by [`open_file`](Self::open_file) and
    /// refresh the status of `file_path`.
    ///
    /// The descriptor's reference on the tree is released even when the
    /// session fails to close it; such failures are only logged.
    pub async fn close_file(&self, descriptor: Descriptor, file_path: &str) -> Result<File> {
        let target = path::normalize(file_path);
        let generation = descriptor.generation();

        let closed = match self.inner.server.executor_for(generation) {
            Ok(executor) => {
                let tid = self.tree().binding.map(|binding| binding.tid);
                let fd = descriptor.fd();
                let job_target = target.clone();
                executor
                    .submit(move |session| {
                        if let Err(status) = session.close(fd) {
                            warn!("Ignoring failed close of {}: {}", fd, status);
                        }
                        match tid {
                            Some(tid) => Ok(stat_entry(session, tid, &job_target).unwrap_or(None)),
                            None => Ok(None),
                        }
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        self.release_descriptor(generation).await;
        let entry = closed?;
        debug!("Closed {}", target);
        Ok(self.node(&target, entry))
    }

    /// Drop the reference held by a descriptor of `generation`
    /// Take a descriptor reference on the current binding.
    ///
    /// The binding check and the count happen under one lock, so the tree
    /// cannot be released in between.
    fn acquire_descriptor(&self) -> Result<(SessionExecutor, TreeId, u64)> {
        let (executor, generation) = self.inner.server.executor()?;
        let mut tree = self.tree();
        match tree.binding {
            Some(binding) if binding.generation == generation => {
                tree.descriptors += 1;
                Ok((executor, binding.tid, generation))
            }
            _ => Err(Error::NotOpen),
        }
    }

    async fn release_descriptor(&self, generation: u64) {
        let _transition = self.inner.transition.lock().await;

        let binding = {
            let mut tree = self.tree();
            match tree.binding {
                Some(binding) if binding.generation == generation => {
                    tree.descriptors = tree.descriptors.saturating_sub(1);
                    if tree.opens > 0 || tree.descriptors > 0 {
                        return;
                    }
                    *tree = TreeState::default();
                    binding
                }
                _ => return,
            }
        };

        self.inner
            .server
            .close_share(binding.tid, binding.generation)
            .await;
        debug!("Closed share {} after its last descriptor", self.inner.name);
    }

    pub(crate) async fn read_chunk(&self, descriptor: &Descriptor, length: usize) -> Result<Bytes> {
        let executor = self.inner.server.executor_for(descriptor.generation())?;
        let fd = descriptor.fd();
        executor
            .submit(move |session| {
                let mut buf = vec![0u8; length];
                let count = session.read(fd, &mut buf).map_err(Error::ReadFailed)?;
                buf.truncate(count);
                Ok(Bytes::from(buf))
            })
            .await
    }

    pub(crate) async fn write_chunk(&self, descriptor: &Descriptor, data: Bytes) -> Result<usize> {
        let executor = self.inner.server.executor_for(descriptor.generation())?;
        let fd = descriptor.fd();
        executor
            .submit(move |session| {
                let mut written = 0;
                while written < data.len() {
                    match session.write(fd, &data[written..]) {
                        Ok(0) => return Err(Error::WriteFailed(NtStatus::UNSUCCESSFUL)),
                        Ok(count) => written += count,
                        Err(status) => return Err(Error::WriteFailed(status)),
                    }
                }
                Ok(written)
            })
            .await
    }

    pub(crate) async fn seek(&self, descriptor: &Descriptor, offset: i64, whence: Whence) -> Result<u64> {
        let executor = self.inner.server.executor_for(descriptor.generation())?;
        let fd = descriptor.fd();
        executor
            .submit(move |session| session.seek(fd, offset, whence).map_err(Error::SeekFailed))
            .await
    }

    fn node(&self, node_path: &str, entry: Option<EntryInfo>) -> File {
        match entry {
            Some(entry) => File::with_status(self, node_path, FileStat::from_entry(&entry, Utc::now())),
            None => File::new(self, node_path),
        }
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}
