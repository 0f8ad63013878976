//! Serialized execution against one session
//!
//! A [`SessionExecutor`] owns a session on a dedicated worker thread and runs
//! submitted work items one at a time, in submission order. Callers receive
//! each result through a [`Completion`] future. Once the executor is shut
//! down the session is torn down exactly once, and every queued or later
//! work item resolves to [`Error::NotConnected`] without touching it.
//! Before the session is torn down, every descriptor and then every tree
//! connection still open on it is closed.

use crate::error::{Error, Result};
use crate::session::{EntryInfo, Fd, FileMode, SessionResult, SmbSession, TreeId, Whence};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce(Option<&mut (dyn SmbSession + 'static)>) + Send>;

enum Message {
    Work(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Single-flight executor bound to one session
#[derive(Clone)]
pub struct SessionExecutor {
    sender: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    name: Arc<str>,
}

impl SessionExecutor {
    /// Move `session` onto a new worker thread named `name`
    pub fn spawn(session: Box<dyn SmbSession>, name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let worker_closed = Arc::clone(&closed);
        let worker_name: Arc<str> = Arc::from(name);
        let thread_name = worker_name.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(session, receiver, worker_closed, thread_name))?;
        debug!("Session executor {} started", name);

        Ok(Self {
            sender,
            closed,
            name: worker_name,
        })
    }

    /// Queue `work` and return immediately.
    ///
    /// The returned future resolves with the work item's result once the
    /// worker has run it; results resolve in submission order.
    pub fn submit<T, F>(&self, work: F) -> Completion<T>
    where
        F: FnOnce(&mut dyn SmbSession) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Completion::failed(Error::NotConnected);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |session| {
            let result = match session {
                Some(session) => work(session),
                None => Err(Error::NotConnected),
            };
            // The caller may have stopped waiting
            let _ = result_tx.send(result);
        });

        match self.sender.send(Message::Work(job)) {
            Ok(()) => Completion::pending(result_rx),
            Err(_) => Completion::failed(Error::NotConnected),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the session down.
    ///
    /// Work already queued fails with [`Error::NotConnected`]; a work item
    /// running at the time of the call finishes first. Resolves once the
    /// session has been torn down. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.send(Message::Shutdown(ack_tx)).is_ok() {
            // A dropped ack means the worker is already gone
            let _ = ack_rx.await;
        }
        debug!("Session executor {} shut down", self.name);
    }
}

fn run_worker(
    session: Box<dyn SmbSession>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    closed: Arc<AtomicBool>,
    name: Arc<str>,
) {
    let mut session = Some(TrackedSession::new(session));

    while let Some(message) = receiver.blocking_recv() {
        match message {
            Message::Work(job) => {
                if closed.load(Ordering::Acquire) {
                    teardown(&mut session, &name);
                }
                let target = session
                    .as_mut()
                    .map(|tracked| tracked as &mut (dyn SmbSession + 'static));
                if panic::catch_unwind(AssertUnwindSafe(move || job(target))).is_err() {
                    warn!("Work item on {} panicked", name);
                }
            }
            Message::Shutdown(ack) => {
                teardown(&mut session, &name);
                let _ = ack.send(());
            }
        }
    }

    // Every executor handle is gone
    teardown(&mut session, &name);
}

fn teardown(session: &mut Option<TrackedSession>, name: &str) {
    if let Some(mut session) = session.take() {
        session.release_handles(name);
        session.inner.disconnect();
    }
}

/// Session wrapper that remembers which trees and descriptors are open
struct TrackedSession {
    inner: Box<dyn SmbSession>,
    trees: Vec<TreeId>,
    descriptors: Vec<Fd>,
}

impl TrackedSession {
    fn new(inner: Box<dyn SmbSession>) -> Self {
        Self {
            inner,
            trees: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    /// Close open descriptors, then disconnect open trees.
    ///
    /// Failures are logged; the session is destroyed regardless.
    fn release_handles(&mut self, name: &str) {
        for fd in std::mem::take(&mut self.descriptors) {
            if let Err(status) = self.inner.close(fd) {
                warn!("Ignoring failed close of {} on {}: {}", fd, name, status);
            }
        }
        for tid in std::mem::take(&mut self.trees) {
            if let Err(status) = self.inner.tree_disconnect(tid) {
                warn!("Ignoring failed tree disconnect of {} on {}: {}", tid, name, status);
            }
        }
    }
}

impl SmbSession for TrackedSession {
    fn login(&mut self, username: Option<&str>, password: Option<&str>) -> SessionResult<bool> {
        self.inner.login(username, password)
    }

    fn disconnect(&mut self) {
        self.trees.clear();
        self.descriptors.clear();
        self.inner.disconnect();
    }

    fn list_shares(&mut self) -> SessionResult<Vec<String>> {
        self.inner.list_shares()
    }

    fn tree_connect(&mut self, share: &str) -> SessionResult<TreeId> {
        let tid = self.inner.tree_connect(share)?;
        self.trees.push(tid);
        Ok(tid)
    }

    fn tree_disconnect(&mut self, tid: TreeId) -> SessionResult<()> {
        // The id is spent whether or not the server agrees
        self.trees.retain(|open| *open != tid);
        self.inner.tree_disconnect(tid)
    }

    fn stat(&mut self, tid: TreeId, path: &str) -> SessionResult<Option<EntryInfo>> {
        self.inner.stat(tid, path)
    }

    fn list(&mut self, tid: TreeId, path: &str) -> SessionResult<Vec<EntryInfo>> {
        self.inner.list(tid, path)
    }

    fn create_directory(&mut self, tid: TreeId, path: &str) -> SessionResult<()> {
        self.inner.create_directory(tid, path)
    }

    fn remove_directory(&mut self, tid: TreeId, path: &str) -> SessionResult<()> {
        self.inner.remove_directory(tid, path)
    }

    fn unlink(&mut self, tid: TreeId, path: &str) -> SessionResult<()> {
        self.inner.unlink(tid, path)
    }

    fn rename(&mut self, tid: TreeId, from: &str, to: &str) -> SessionResult<()> {
        self.inner.rename(tid, from, to)
    }

    fn open(&mut self, tid: TreeId, path: &str, mode: FileMode) -> SessionResult<Fd> {
        let fd = self.inner.open(tid, path, mode)?;
        self.descriptors.push(fd);
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> SessionResult<()> {
        self.descriptors.retain(|open| *open != fd);
        self.inner.close(fd)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> SessionResult<usize> {
        self.inner.read(fd, buf)
    }

    fn write(&mut self, fd: Fd, buf: &[u8]) -> SessionResult<usize> {
        self.inner.write(fd, buf)
    }

    fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> SessionResult<u64> {
        self.inner.seek(fd, offset, whence)
    }
}

enum CompletionState<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Failed(Option<Error>),
}

/// Result of a submitted work item
pub struct Completion<T> {
    state: CompletionState<T>,
}

impl<T> Completion<T> {
    fn pending(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: CompletionState::Pending(receiver),
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            state: CompletionState::Failed(Some(error)),
        }
    }
}

impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            CompletionState::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                // The work item panicked before reporting
                .map(|received| received.unwrap_or(Err(Error::Unknown))),
            CompletionState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(Error::NotConnected)))
            }
        }
    }
}
