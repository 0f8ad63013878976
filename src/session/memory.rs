//! In-memory SMB server for tests and demos
//!
//! [`MemoryServer`] holds a set of shares with their directory trees.
//! Sessions opened through [`MemoryConnector`] operate on that shared state,
//! so a test can inspect what the client did. Every session call is recorded
//! and checked for overlap with another call, and failures can be injected
//! per operation.

use super::{
    filetime_now, EntryInfo, Fd, FileMode, SessionConnector, SessionResult, SmbSession, TreeId,
    Whence,
};
use crate::error::NtStatus;
use crate::path;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum NodeKind {
    Directory,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    creation_time: u64,
    access_time: u64,
    write_time: u64,
    change_time: u64,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        let now = filetime_now();
        Self {
            kind,
            creation_time: now,
            access_time: now,
            write_time: now,
            change_time: now,
        }
    }

    fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    fn info(&self, name: &str) -> EntryInfo {
        EntryInfo {
            name: name.to_string(),
            is_directory: self.is_directory(),
            size: match &self.kind {
                NodeKind::Directory => 0,
                NodeKind::File(data) => data.len() as u64,
            },
            creation_time: self.creation_time,
            access_time: self.access_time,
            write_time: self.write_time,
            change_time: self.change_time,
        }
    }
}

/// Directory tree of one share, keyed by normalized path
#[derive(Debug)]
struct ShareTree {
    name: String,
    nodes: BTreeMap<String, Node>,
}

impl ShareTree {
    fn new(name: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(path::ROOT.to_string(), Node::new(NodeKind::Directory));
        Self {
            name: name.to_string(),
            nodes,
        }
    }

    fn parent_is_directory(&self, key: &str) -> SessionResult<()> {
        let parent = path::parent(key).ok_or(NtStatus::ACCESS_DENIED)?;
        match self.nodes.get(&parent) {
            Some(node) if node.is_directory() => Ok(()),
            Some(_) => Err(NtStatus::NOT_A_DIRECTORY),
            None => Err(NtStatus::OBJECT_PATH_NOT_FOUND),
        }
    }

    fn has_children(&self, key: &str) -> bool {
        self.nodes
            .keys()
            .any(|candidate| path::parent(candidate).as_deref() == Some(key))
    }
}

#[derive(Debug)]
struct Fault {
    operation: &'static str,
    successes_left: usize,
    status: NtStatus,
}

#[derive(Debug, Default)]
struct ServerState {
    shares: Vec<ShareTree>,
    users: HashMap<String, String>,
    allow_guest: bool,
    unreachable: bool,
    call_delay: Option<Duration>,
    faults: Vec<Fault>,
    calls: Vec<String>,
    in_call: bool,
    overlapping_calls: usize,
    calls_after_disconnect: usize,
    disconnects: usize,
    live_trees: usize,
    live_descriptors: usize,
}

impl ServerState {
    fn share(&self, name: &str) -> Option<&ShareTree> {
        self.shares
            .iter()
            .find(|share| share.name.eq_ignore_ascii_case(name))
    }

    fn share_mut(&mut self, name: &str) -> Option<&mut ShareTree> {
        self.shares
            .iter_mut()
            .find(|share| share.name.eq_ignore_ascii_case(name))
    }
}

/// Shared state of an in-memory server
#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Create a server exporting only `IPC$`, with guest access enabled
    pub fn new() -> Self {
        let state = ServerState {
            shares: vec![ShareTree::new("IPC$")],
            allow_guest: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Export an empty share
    pub fn add_share(&self, name: &str) -> &Self {
        let mut state = self.lock();
        if state.share(name).is_none() {
            state.shares.push(ShareTree::new(name));
        }
        self
    }

    /// Accept `username`/`password` as an authenticated login
    pub fn add_user(&self, username: &str, password: &str) -> &Self {
        self.lock()
            .users
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Allow or refuse guest sessions
    pub fn set_allow_guest(&self, allow: bool) -> &Self {
        self.lock().allow_guest = allow;
        self
    }

    /// Make new connections fail at the transport level
    pub fn set_unreachable(&self, unreachable: bool) -> &Self {
        self.lock().unreachable = unreachable;
        self
    }

    /// Hold every session call for `delay` before answering
    pub fn set_call_delay(&self, delay: Duration) -> &Self {
        self.lock().call_delay = Some(delay);
        self
    }

    /// Let `operation` succeed `successes` more times, then fail once with
    /// `status`
    pub fn fail_after(&self, operation: &'static str, successes: usize, status: NtStatus) -> &Self {
        self.lock().faults.push(Fault {
            operation,
            successes_left: successes,
            status,
        });
        self
    }

    /// Store a file, creating missing parent directories
    pub fn put_file(&self, share: &str, file_path: &str, data: &[u8]) -> &Self {
        let key = path::normalize(file_path);
        let mut state = self.lock();
        if let Some(tree) = state.share_mut(share) {
            for ancestor in path::ancestors(&key) {
                if ancestor != key {
                    tree.nodes
                        .entry(ancestor)
                        .or_insert_with(|| Node::new(NodeKind::Directory));
                }
            }
            tree.nodes
                .insert(key, Node::new(NodeKind::File(data.to_vec())));
        }
        self
    }

    /// Contents of a stored file
    pub fn file_contents(&self, share: &str, file_path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let node = state.share(share)?.nodes.get(&path::normalize(file_path))?;
        match &node.kind {
            NodeKind::File(data) => Some(data.clone()),
            NodeKind::Directory => None,
        }
    }

    /// Whether `dir_path` exists as a directory
    pub fn is_directory(&self, share: &str, dir_path: &str) -> bool {
        let state = self.lock();
        state
            .share(share)
            .and_then(|tree| tree.nodes.get(&path::normalize(dir_path)))
            .is_some_and(Node::is_directory)
    }

    /// Whether anything exists at `entry_path`
    pub fn exists(&self, share: &str, entry_path: &str) -> bool {
        let state = self.lock();
        state
            .share(share)
            .is_some_and(|tree| tree.nodes.contains_key(&path::normalize(entry_path)))
    }

    /// Session calls received so far, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of calls that started while another call was still running
    pub fn overlapping_calls(&self) -> usize {
        self.lock().overlapping_calls
    }

    /// Number of calls made on a session after it was torn down
    pub fn calls_after_disconnect(&self) -> usize {
        self.lock().calls_after_disconnect
    }

    /// Number of sessions torn down
    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    /// Tree connections currently bound, across all sessions
    pub fn live_trees(&self) -> usize {
        self.lock().live_trees
    }

    /// Files currently open, across all sessions
    pub fn live_descriptors(&self) -> usize {
        self.lock().live_descriptors
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens [`MemorySession`]s against a [`MemoryServer`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl MemoryConnector {
    pub fn new(server: MemoryServer) -> Self {
        Self { server }
    }
}

impl SessionConnector for MemoryConnector {
    fn connect(&self, addr: SocketAddr, _netbios_name: &str) -> io::Result<Box<dyn SmbSession>> {
        if self.server.lock().unreachable {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", addr),
            ));
        }
        Ok(Box::new(MemorySession::new(self.server.clone())))
    }
}

#[derive(Debug)]
struct OpenHandle {
    share: String,
    key: String,
    mode: FileMode,
    position: u64,
}

/// Marks one call in progress; clears the in-call flag when dropped
struct CallGuard {
    server: MemoryServer,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.server.lock().in_call = false;
    }
}

/// A session against a [`MemoryServer`]
#[derive(Debug)]
pub struct MemorySession {
    server: MemoryServer,
    logged_in: bool,
    destroyed: bool,
    trees: HashMap<TreeId, String>,
    handles: HashMap<Fd, OpenHandle>,
    next_id: u32,
}

impl MemorySession {
    fn new(server: MemoryServer) -> Self {
        Self {
            server,
            logged_in: false,
            destroyed: false,
            trees: HashMap::new(),
            handles: HashMap::new(),
            next_id: 1,
        }
    }

    /// Record the call, then apply the configured delay and any injected fault
    fn enter(&mut self, operation: &'static str, detail: &str) -> SessionResult<CallGuard> {
        let delay = {
            let mut state = self.server.lock();
            if state.in_call {
                state.overlapping_calls += 1;
            }
            state.in_call = true;
            if self.destroyed {
                state.calls_after_disconnect += 1;
            }
            if detail.is_empty() {
                state.calls.push(operation.to_string());
            } else {
                state.calls.push(format!("{} {}", operation, detail));
            }
            state.call_delay
        };
        let guard = CallGuard {
            server: self.server.clone(),
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let injected = {
            let mut state = self.server.lock();
            match state
                .faults
                .iter()
                .position(|fault| fault.operation == operation)
            {
                Some(index) if state.faults[index].successes_left == 0 => {
                    Some(state.faults.remove(index).status)
                }
                Some(index) => {
                    state.faults[index].successes_left -= 1;
                    None
                }
                None => None,
            }
        };
        if let Some(status) = injected {
            return Err(status);
        }

        if self.destroyed {
            return Err(NtStatus::INVALID_HANDLE);
        }
        Ok(guard)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn tree(&self, tid: TreeId) -> SessionResult<String> {
        if !self.logged_in {
            return Err(NtStatus::ACCESS_DENIED);
        }
        self.trees
            .get(&tid)
            .cloned()
            .ok_or(NtStatus::NETWORK_NAME_DELETED)
    }

    fn with_tree<T>(
        &self,
        tid: TreeId,
        f: impl FnOnce(&mut ShareTree) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let share = self.tree(tid)?;
        let mut state = self.server.lock();
        let tree = state
            .share_mut(&share)
            .ok_or(NtStatus::NETWORK_NAME_DELETED)?;
        f(tree)
    }

    fn with_handle<T>(
        &mut self,
        fd: Fd,
        f: impl FnOnce(&mut OpenHandle, &mut ShareTree) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let handle = self.handles.get_mut(&fd).ok_or(NtStatus::INVALID_HANDLE)?;
        let mut state = self.server.lock();
        let tree = state
            .share_mut(&handle.share)
            .ok_or(NtStatus::NETWORK_NAME_DELETED)?;
        f(handle, tree)
    }
}

impl SmbSession for MemorySession {
    fn login(&mut self, username: Option<&str>, password: Option<&str>) -> SessionResult<bool> {
        let _call = self.enter("login", username.unwrap_or(""))?;
        let state = self.server.lock();
        let guest = match (username, password) {
            (Some(user), password) => match state.users.get(user) {
                Some(expected) if Some(expected.as_str()) == password.or(Some("")) => false,
                Some(_) => return Err(NtStatus::LOGON_FAILURE),
                // Unknown users are mapped to guest when the server allows it
                None if state.allow_guest => true,
                None => return Err(NtStatus::LOGON_FAILURE),
            },
            (None, _) if state.allow_guest => true,
            (None, _) => return Err(NtStatus::LOGON_FAILURE),
        };
        drop(state);
        self.logged_in = true;
        Ok(guest)
    }

    fn disconnect(&mut self) {
        let Ok(_call) = self.enter("disconnect", "") else {
            return;
        };
        let mut state = self.server.lock();
        state.disconnects += 1;
        drop(state);
        self.trees.clear();
        self.handles.clear();
        self.destroyed = true;
    }

    fn list_shares(&mut self) -> SessionResult<Vec<String>> {
        let _call = self.enter("list_shares", "")?;
        if !self.logged_in {
            return Err(NtStatus::ACCESS_DENIED);
        }
        let state = self.server.lock();
        Ok(state.shares.iter().map(|share| share.name.clone()).collect())
    }

    fn tree_connect(&mut self, share: &str) -> SessionResult<TreeId> {
        let _call = self.enter("tree_connect", share)?;
        if !self.logged_in {
            return Err(NtStatus::ACCESS_DENIED);
        }
        let name = {
            let mut state = self.server.lock();
            let name = state
                .share(share)
                .map(|tree| tree.name.clone())
                .ok_or(NtStatus::BAD_NETWORK_NAME)?;
            state.live_trees += 1;
            name
        };
        let tid = TreeId(self.next_id());
        self.trees.insert(tid, name);
        Ok(tid)
    }

    fn tree_disconnect(&mut self, tid: TreeId) -> SessionResult<()> {
        let _call = self.enter("tree_disconnect", &tid.to_string())?;
        self.trees.remove(&tid).ok_or(NtStatus::NETWORK_NAME_DELETED)?;
        self.server.lock().live_trees -= 1;
        Ok(())
    }

    fn stat(&mut self, tid: TreeId, entry_path: &str) -> SessionResult<Option<EntryInfo>> {
        let _call = self.enter("stat", entry_path)?;
        let key = path::normalize(entry_path);
        self.with_tree(tid, |tree| {
            Ok(tree
                .nodes
                .get(&key)
                .map(|node| node.info(path::file_name(&key))))
        })
    }

    fn list(&mut self, tid: TreeId, dir_path: &str) -> SessionResult<Vec<EntryInfo>> {
        let _call = self.enter("list", dir_path)?;
        let key = path::normalize(dir_path);
        self.with_tree(tid, |tree| {
            let dir = tree
                .nodes
                .get(&key)
                .ok_or(NtStatus::OBJECT_NAME_NOT_FOUND)?;
            if !dir.is_directory() {
                return Err(NtStatus::NOT_A_DIRECTORY);
            }

            // Servers enumerate the self and parent entries first
            let mut entries = vec![dir.info("."), dir.info("..")];
            entries.extend(
                tree.nodes
                    .iter()
                    .filter(|(candidate, _)| path::parent(candidate).as_deref() == Some(key.as_str()))
                    .map(|(candidate, node)| node.info(path::file_name(candidate))),
            );
            Ok(entries)
        })
    }

    fn create_directory(&mut self, tid: TreeId, dir_path: &str) -> SessionResult<()> {
        let _call = self.enter("create_directory", dir_path)?;
        let key = path::normalize(dir_path);
        self.with_tree(tid, |tree| {
            if tree.nodes.contains_key(&key) {
                return Err(NtStatus::OBJECT_NAME_COLLISION);
            }
            tree.parent_is_directory(&key)?;
            tree.nodes.insert(key, Node::new(NodeKind::Directory));
            Ok(())
        })
    }

    fn remove_directory(&mut self, tid: TreeId, dir_path: &str) -> SessionResult<()> {
        let _call = self.enter("remove_directory", dir_path)?;
        let key = path::normalize(dir_path);
        self.with_tree(tid, |tree| {
            if path::is_root(&key) {
                return Err(NtStatus::ACCESS_DENIED);
            }
            match tree.nodes.get(&key) {
                None => return Err(NtStatus::OBJECT_NAME_NOT_FOUND),
                Some(node) if !node.is_directory() => return Err(NtStatus::NOT_A_DIRECTORY),
                Some(_) => {}
            }
            if tree.has_children(&key) {
                return Err(NtStatus::DIRECTORY_NOT_EMPTY);
            }
            tree.nodes.remove(&key);
            Ok(())
        })
    }

    fn unlink(&mut self, tid: TreeId, file_path: &str) -> SessionResult<()> {
        let _call = self.enter("unlink", file_path)?;
        let key = path::normalize(file_path);
        self.with_tree(tid, |tree| match tree.nodes.get(&key) {
            None => Err(NtStatus::OBJECT_NAME_NOT_FOUND),
            Some(node) if node.is_directory() => Err(NtStatus::FILE_IS_A_DIRECTORY),
            Some(_) => {
                tree.nodes.remove(&key);
                Ok(())
            }
        })
    }

    fn rename(&mut self, tid: TreeId, from: &str, to: &str) -> SessionResult<()> {
        let _call = self.enter("rename", &format!("{} -> {}", from, to))?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.with_tree(tid, |tree| {
            if !tree.nodes.contains_key(&from) {
                return Err(NtStatus::OBJECT_NAME_NOT_FOUND);
            }
            if tree.nodes.contains_key(&to) {
                return Err(NtStatus::OBJECT_NAME_COLLISION);
            }
            let subtree_prefix = format!("{}/", from);
            if path::is_root(&from) || to.starts_with(&subtree_prefix) {
                return Err(NtStatus::INVALID_PARAMETER);
            }
            tree.parent_is_directory(&to)?;

            let moved: Vec<String> = tree
                .nodes
                .keys()
                .filter(|key| **key == from || key.starts_with(&subtree_prefix))
                .cloned()
                .collect();
            for old_key in moved {
                if let Some(node) = tree.nodes.remove(&old_key) {
                    let new_key = format!("{}{}", to, &old_key[from.len()..]);
                    tree.nodes.insert(new_key, node);
                }
            }
            Ok(())
        })
    }

    fn open(&mut self, tid: TreeId, file_path: &str, mode: FileMode) -> SessionResult<Fd> {
        let _call = self.enter("open", file_path)?;
        let key = path::normalize(file_path);
        let share = self.with_tree(tid, |tree| {
            match tree.nodes.get(&key) {
                Some(node) if node.is_directory() => return Err(NtStatus::FILE_IS_A_DIRECTORY),
                Some(_) => {}
                None if mode.contains(FileMode::WRITE) => {
                    tree.parent_is_directory(&key)?;
                    tree.nodes
                        .insert(key.clone(), Node::new(NodeKind::File(Vec::new())));
                }
                None => return Err(NtStatus::OBJECT_NAME_NOT_FOUND),
            }
            Ok(tree.name.clone())
        })?;

        self.server.lock().live_descriptors += 1;
        let fd = Fd(self.next_id());
        self.handles.insert(
            fd,
            OpenHandle {
                share,
                key,
                mode,
                position: 0,
            },
        );
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> SessionResult<()> {
        let _call = self.enter("close", &fd.to_string())?;
        self.handles.remove(&fd).ok_or(NtStatus::INVALID_HANDLE)?;
        self.server.lock().live_descriptors -= 1;
        Ok(())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> SessionResult<usize> {
        let _call = self.enter("read", &format!("{} {}", fd, buf.len()))?;
        self.with_handle(fd, |handle, tree| {
            if !handle.mode.contains(FileMode::READ) {
                return Err(NtStatus::ACCESS_DENIED);
            }
            let node = tree
                .nodes
                .get_mut(&handle.key)
                .ok_or(NtStatus::INVALID_HANDLE)?;
            let NodeKind::File(data) = &node.kind else {
                return Err(NtStatus::FILE_IS_A_DIRECTORY);
            };

            let start = (handle.position as usize).min(data.len());
            let count = buf.len().min(data.len() - start);
            buf[..count].copy_from_slice(&data[start..start + count]);
            handle.position += count as u64;
            node.access_time = filetime_now();
            Ok(count)
        })
    }

    fn write(&mut self, fd: Fd, buf: &[u8]) -> SessionResult<usize> {
        let _call = self.enter("write", &format!("{} {}", fd, buf.len()))?;
        self.with_handle(fd, |handle, tree| {
            if !handle.mode.contains(FileMode::WRITE) {
                return Err(NtStatus::ACCESS_DENIED);
            }
            let node = tree
                .nodes
                .get_mut(&handle.key)
                .ok_or(NtStatus::INVALID_HANDLE)?;
            let NodeKind::File(data) = &mut node.kind else {
                return Err(NtStatus::FILE_IS_A_DIRECTORY);
            };

            let start = handle.position as usize;
            let end = start + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            handle.position = end as u64;

            let now = filetime_now();
            node.write_time = now;
            node.change_time = now;
            Ok(buf.len())
        })
    }

    fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> SessionResult<u64> {
        let _call = self.enter("seek", &format!("{} {} {:?}", fd, offset, whence))?;
        self.with_handle(fd, |handle, tree| {
            let base = match whence {
                Whence::Start => 0,
                Whence::Current => handle.position as i64,
                Whence::End => match tree.nodes.get(&handle.key).map(|node| &node.kind) {
                    Some(NodeKind::File(data)) => data.len() as i64,
                    _ => return Err(NtStatus::INVALID_HANDLE),
                },
            };
            let position = base.checked_add(offset).ok_or(NtStatus::INVALID_PARAMETER)?;
            if position < 0 {
                return Err(NtStatus::INVALID_PARAMETER);
            }
            handle.position = position as u64;
            Ok(handle.position)
        })
    }
}
