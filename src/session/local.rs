//! Session backend serving local directories as shares
//!
//! Every share maps to a directory on disk. Paths are normalized before they
//! are joined to the share root, so `..` never leaves the share, and a path
//! whose nearest existing ancestor resolves outside the share root through a
//! symbolic link is refused with `STATUS_ACCESS_DENIED`.

use super::{
    filetime_from_system_time, EntryInfo, Fd, FileMode, SessionConnector, SessionResult,
    SmbSession, TreeId, Whence,
};
use crate::error::NtStatus;
use crate::path;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Exports {
    shares: Vec<(String, PathBuf)>,
    users: HashMap<String, String>,
    deny_guest: bool,
}

/// Opens [`DirectorySession`]s over a fixed set of exported directories
#[derive(Debug, Clone, Default)]
pub struct DirectoryConnector {
    exports: Arc<Exports>,
}

impl DirectoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `root` as share `name`
    pub fn add_share<P: AsRef<Path>>(mut self, name: &str, root: P) -> Self {
        Arc::make_mut(&mut self.exports)
            .shares
            .push((name.to_string(), root.as_ref().to_path_buf()));
        self
    }

    /// Accept `username` with `password`
    pub fn add_user(mut self, username: &str, password: &str) -> Self {
        Arc::make_mut(&mut self.exports)
            .users
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Refuse sessions without valid credentials
    pub fn deny_guest(mut self) -> Self {
        Arc::make_mut(&mut self.exports).deny_guest = true;
        self
    }
}

impl SessionConnector for DirectoryConnector {
    fn connect(&self, addr: SocketAddr, netbios_name: &str) -> io::Result<Box<dyn SmbSession>> {
        debug!("Opening local session for {} ({})", netbios_name, addr);
        Ok(Box::new(DirectorySession {
            exports: Arc::clone(&self.exports),
            logged_in: false,
            trees: HashMap::new(),
            handles: HashMap::new(),
            next_id: 1,
        }))
    }
}

#[derive(Debug)]
struct OpenFile {
    file: fs::File,
    mode: FileMode,
}

/// A session whose shares are local directories
#[derive(Debug)]
pub struct DirectorySession {
    exports: Arc<Exports>,
    logged_in: bool,
    trees: HashMap<TreeId, PathBuf>,
    handles: HashMap<Fd, OpenFile>,
    next_id: u32,
}

fn status_of(error: &io::Error) -> NtStatus {
    match error.kind() {
        io::ErrorKind::NotFound => NtStatus::OBJECT_NAME_NOT_FOUND,
        io::ErrorKind::AlreadyExists => NtStatus::OBJECT_NAME_COLLISION,
        io::ErrorKind::PermissionDenied => NtStatus::ACCESS_DENIED,
        io::ErrorKind::InvalidInput => NtStatus::INVALID_PARAMETER,
        _ => NtStatus::UNSUCCESSFUL,
    }
}

fn entry_info(name: &str, metadata: &fs::Metadata) -> EntryInfo {
    let time = |value: io::Result<std::time::SystemTime>| {
        value.map(filetime_from_system_time).unwrap_or(0)
    };
    let modified = time(metadata.modified());
    EntryInfo {
        name: name.to_string(),
        is_directory: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        creation_time: time(metadata.created()),
        access_time: time(metadata.accessed()),
        write_time: modified,
        change_time: modified,
    }
}

impl DirectorySession {
    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Local path for `smb_path` on tree `tid`
    fn resolve(&self, tid: TreeId, smb_path: &str) -> SessionResult<PathBuf> {
        if !self.logged_in {
            return Err(NtStatus::ACCESS_DENIED);
        }
        let root = self.trees.get(&tid).ok_or(NtStatus::NETWORK_NAME_DELETED)?;
        let relative = path::normalize(smb_path);
        let local = root.join(relative.trim_start_matches('/'));
        contain(root, &local)?;
        Ok(local)
    }

    fn handle(&mut self, fd: Fd) -> SessionResult<&mut OpenFile> {
        self.handles.get_mut(&fd).ok_or(NtStatus::INVALID_HANDLE)
    }
}

/// Refuse `local` unless its nearest existing ancestor lies under `root`.
///
/// `root` must already be canonical.
fn contain(root: &Path, local: &Path) -> SessionResult<()> {
    let mut existing = local;
    while fs::symlink_metadata(existing).is_err() {
        existing = existing.parent().ok_or(NtStatus::ACCESS_DENIED)?;
    }
    // Dangling links fail to canonicalize and are refused too
    let real = fs::canonicalize(existing).map_err(|_| NtStatus::ACCESS_DENIED)?;
    if real.starts_with(root) {
        Ok(())
    } else {
        debug!("Refusing {} outside share root {}", real.display(), root.display());
        Err(NtStatus::ACCESS_DENIED)
    }
}

impl SmbSession for DirectorySession {
    fn login(&mut self, username: Option<&str>, password: Option<&str>) -> SessionResult<bool> {
        let guest = match username.and_then(|name| self.exports.users.get(name)) {
            Some(expected) if Some(expected.as_str()) == password => false,
            Some(_) => return Err(NtStatus::LOGON_FAILURE),
            None if self.exports.deny_guest => return Err(NtStatus::LOGON_FAILURE),
            None => true,
        };
        self.logged_in = true;
        debug!("Local login as {}", if guest { "guest" } else { "user" });
        Ok(guest)
    }

    fn disconnect(&mut self) {
        self.handles.clear();
        self.trees.clear();
        self.logged_in = false;
    }

    fn list_shares(&mut self) -> SessionResult<Vec<String>> {
        if !self.logged_in {
            return Err(NtStatus::ACCESS_DENIED);
        }
        let mut names = vec![String::from("IPC$")];
        names.extend(self.exports.shares.iter().map(|(name, _)| name.clone()));
        Ok(names)
    }

    fn tree_connect(&mut self, share: &str) -> SessionResult<TreeId> {
        if !self.logged_in {
            return Err(NtStatus::ACCESS_DENIED);
        }
        let root = self
            .exports
            .shares
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(share))
            .map(|(_, root)| root.clone())
            .ok_or(NtStatus::BAD_NETWORK_NAME)?;
        if !root.is_dir() {
            return Err(NtStatus::BAD_NETWORK_PATH);
        }
        let root = fs::canonicalize(&root).map_err(|_| NtStatus::BAD_NETWORK_PATH)?;

        let tid = TreeId(self.next_id());
        self.trees.insert(tid, root);
        Ok(tid)
    }

    fn tree_disconnect(&mut self, tid: TreeId) -> SessionResult<()> {
        self.trees
            .remove(&tid)
            .map(|_| ())
            .ok_or(NtStatus::NETWORK_NAME_DELETED)
    }

    fn stat(&mut self, tid: TreeId, entry_path: &str) -> SessionResult<Option<EntryInfo>> {
        let local = self.resolve(tid, entry_path)?;
        match fs::metadata(&local) {
            Ok(metadata) => Ok(Some(entry_info(
                path::file_name(&path::normalize(entry_path)),
                &metadata,
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(status_of(&e)),
        }
    }

    fn list(&mut self, tid: TreeId, dir_path: &str) -> SessionResult<Vec<EntryInfo>> {
        let local = self.resolve(tid, dir_path)?;
        let metadata = fs::metadata(&local).map_err(|e| status_of(&e))?;
        if !metadata.is_dir() {
            return Err(NtStatus::NOT_A_DIRECTORY);
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&local).map_err(|e| status_of(&e))? {
            let entry = entry.map_err(|e| status_of(&e))?;
            let child = entry.metadata().map_err(|e| status_of(&e))?;
            children.push(entry_info(&entry.file_name().to_string_lossy(), &child));
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = vec![entry_info(".", &metadata), entry_info("..", &metadata)];
        entries.extend(children);
        Ok(entries)
    }

    fn create_directory(&mut self, tid: TreeId, dir_path: &str) -> SessionResult<()> {
        let local = self.resolve(tid, dir_path)?;
        fs::create_dir(&local).map_err(|e| status_of(&e))
    }

    fn remove_directory(&mut self, tid: TreeId, dir_path: &str) -> SessionResult<()> {
        let local = self.resolve(tid, dir_path)?;
        if path::is_root(&path::normalize(dir_path)) {
            return Err(NtStatus::ACCESS_DENIED);
        }
        let mut children = fs::read_dir(&local).map_err(|e| status_of(&e))?;
        if children.next().is_some() {
            return Err(NtStatus::DIRECTORY_NOT_EMPTY);
        }
        fs::remove_dir(&local).map_err(|e| status_of(&e))
    }

    fn unlink(&mut self, tid: TreeId, file_path: &str) -> SessionResult<()> {
        let local = self.resolve(tid, file_path)?;
        if local.is_dir() {
            return Err(NtStatus::FILE_IS_A_DIRECTORY);
        }
        fs::remove_file(&local).map_err(|e| status_of(&e))
    }

    fn rename(&mut self, tid: TreeId, from: &str, to: &str) -> SessionResult<()> {
        let source = self.resolve(tid, from)?;
        let destination = self.resolve(tid, to)?;
        if !source.exists() {
            return Err(NtStatus::OBJECT_NAME_NOT_FOUND);
        }
        if destination.exists() {
            return Err(NtStatus::OBJECT_NAME_COLLISION);
        }
        fs::rename(&source, &destination).map_err(|e| status_of(&e))
    }

    fn open(&mut self, tid: TreeId, file_path: &str, mode: FileMode) -> SessionResult<Fd> {
        let local = self.resolve(tid, file_path)?;
        if local.is_dir() {
            return Err(NtStatus::FILE_IS_A_DIRECTORY);
        }

        let file = fs::OpenOptions::new()
            .read(mode.contains(FileMode::READ))
            .write(mode.contains(FileMode::WRITE))
            .create(mode.contains(FileMode::WRITE))
            .open(&local)
            .map_err(|e| status_of(&e))?;

        let fd = Fd(self.next_id());
        self.handles.insert(fd, OpenFile { file, mode });
        debug!("Opened {:?} as {}", local, fd);
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> SessionResult<()> {
        self.handles
            .remove(&fd)
            .map(|_| ())
            .ok_or(NtStatus::INVALID_HANDLE)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> SessionResult<usize> {
        let handle = self.handle(fd)?;
        if !handle.mode.contains(FileMode::READ) {
            return Err(NtStatus::ACCESS_DENIED);
        }
        handle.file.read(buf).map_err(|e| status_of(&e))
    }

    fn write(&mut self, fd: Fd, buf: &[u8]) -> SessionResult<usize> {
        let handle = self.handle(fd)?;
        if !handle.mode.contains(FileMode::WRITE) {
            return Err(NtStatus::ACCESS_DENIED);
        }
        handle.file.write(buf).map_err(|e| status_of(&e))
    }

    fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> SessionResult<u64> {
        let position = match whence {
            Whence::Start => SeekFrom::Start(u64::try_from(offset).map_err(|_| NtStatus::INVALID_PARAMETER)?),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        self.handle(fd)?
            .file
            .seek(position)
            .map_err(|e| status_of(&e))
    }
}
