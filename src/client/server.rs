//! Connection to one SMB file server

use super::share::{Share, WeakShare};
use super::ClientConfig;
use crate::error::{Error, NtStatus, Result};
use crate::executor::SessionExecutor;
use crate::session::{SessionConnector, TreeId};
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

bitflags! {
    /// Role a device announces on the network
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceType: u32 {
        const UNKNOWN = 1 << 0;
        const WORKSTATION = 1 << 1;
        const MESSENGER = 1 << 2;
        const FILE_SERVER = 1 << 3;
        const DOMAIN_MASTER = 1 << 4;

        const NONE = 0;
        const ANY = Self::UNKNOWN.bits()
            | Self::WORKSTATION.bits()
            | Self::MESSENGER.bits()
            | Self::FILE_SERVER.bits()
            | Self::DOMAIN_MASTER.bits();
    }
}

/// A host on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub kind: DeviceType,
    /// IP address or hostname
    pub host: String,
    pub netbios_name: String,
    /// Workgroup or domain
    pub group: String,
}

impl Device {
    pub fn new(kind: DeviceType, host: &str, netbios_name: &str, group: &str) -> Self {
        Self {
            kind,
            host: host.to_string(),
            netbios_name: netbios_name.to_string(),
            group: group.to_string(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} ({})", self.netbios_name, self.host)
        } else {
            write!(f, "{}\\{} ({})", self.group, self.netbios_name, self.host)
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    executor: Option<SessionExecutor>,
    guest: bool,
    /// Bumped on every successful connect
    generation: u64,
    shares: HashMap<String, WeakShare>,
}

struct ServerInner {
    device: Device,
    config: ClientConfig,
    connector: Arc<dyn SessionConnector>,
    state: Mutex<ConnectionState>,
}

/// Connection to one SMB file server.
///
/// Cheap to clone; clones share the connection. All session traffic for the
/// server, including that of its shares and files, runs through one
/// [`SessionExecutor`].
#[derive(Clone)]
pub struct FileServer {
    inner: Arc<ServerInner>,
}

impl FileServer {
    /// Describe a file server; nothing is sent until [`connect`](Self::connect)
    pub fn new(
        host: &str,
        netbios_name: &str,
        group: Option<&str>,
        connector: impl SessionConnector + 'static,
    ) -> Self {
        let device = Device::new(
            DeviceType::FILE_SERVER,
            host,
            netbios_name,
            group.unwrap_or_default(),
        );
        Self::with_config(device, Arc::new(connector), ClientConfig::default())
    }

    /// Describe a file server with custom configuration
    pub fn with_config(
        device: Device,
        connector: Arc<dyn SessionConnector>,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                device,
                config,
                connector,
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn host(&self) -> &str {
        &self.inner.device.host
    }

    pub fn netbios_name(&self) -> &str {
        &self.inner.device.netbios_name
    }

    pub fn group(&self) -> &str {
        &self.inner.device.group
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.state().executor.is_some()
    }

    /// Whether the current session was granted guest access
    pub fn is_guest(&self) -> bool {
        self.state().guest
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect and log in.
    ///
    /// Missing or empty credentials request guest access. Returns whether
    /// the server actually granted a guest session. An existing connection
    /// is torn down first.
    pub async fn connect(&self, username: Option<&str>, password: Option<&str>) -> Result<bool> {
        self.disconnect().await;

        let addr = self.resolve().await?;
        info!("Connecting to {} at {}", self.inner.device, addr);

        let connector = Arc::clone(&self.inner.connector);
        let netbios_name = self.inner.device.netbios_name.clone();
        let session = tokio::task::spawn_blocking(move || connector.connect(addr, &netbios_name))
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let executor = SessionExecutor::spawn(session, &self.inner.config.worker_name)?;

        let username = username.filter(|name| !name.is_empty()).map(str::to_string);
        let password = password.map(str::to_string);
        if username.is_none() {
            debug!("No credentials supplied, requesting guest access");
        }
        let login = executor
            .submit(move |session| {
                let password = username.as_ref().and(password.as_deref());
                session
                    .login(username.as_deref(), password)
                    .map_err(|status| Error::from_status(status, "login", None))
            })
            .await;

        let guest = match login {
            Ok(guest) => guest,
            Err(e) => {
                warn!("Login to {} failed: {}", self.inner.device, e);
                executor.shutdown().await;
                return Err(e);
            }
        };

        let previous = {
            let mut state = self.state();
            state.generation += 1;
            state.guest = guest;
            state.executor.replace(executor)
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        info!(
            "Connected to {}{}",
            self.inner.device,
            if guest { " as guest" } else { "" }
        );
        Ok(guest)
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host = &self.inner.device.host;
        if host.is_empty() {
            return Err(Error::NoAddressResolved(
                self.inner.device.netbios_name.clone(),
            ));
        }

        let mut addrs = tokio::net::lookup_host((host.as_str(), self.inner.config.port))
            .await
            .map_err(|e| {
                debug!("Failed to resolve {}: {}", host, e);
                Error::HostNotFound(host.clone())
            })?;
        addrs
            .next()
            .ok_or_else(|| Error::NoAddressResolved(host.clone()))
    }

    /// Tear the session down.
    ///
    /// Descriptors still open on the session are closed and its tree
    /// connections disconnected first. Every share and file derived from this server fails with
    /// [`Error::NotConnected`] afterwards. Calling it while disconnected is a
    /// no-op.
    pub async fn disconnect(&self) {
        let executor = {
            let mut state = self.state();
            state.guest = false;
            state.executor.take()
        };

        if let Some(executor) = executor {
            info!("Disconnecting from {}", self.inner.device);
            executor.shutdown().await;
        }
    }

    /// Executor of the live session and the generation it belongs to
    pub(crate) fn executor(&self) -> Result<(SessionExecutor, u64)> {
        let state = self.state();
        match &state.executor {
            Some(executor) => Ok((executor.clone(), state.generation)),
            None => Err(Error::NotConnected),
        }
    }

    /// Executor of the live session, if it is still `generation`
    pub(crate) fn executor_for(&self, generation: u64) -> Result<SessionExecutor> {
        match self.executor()? {
            (executor, current) if current == generation => Ok(executor),
            _ => Err(Error::NotConnected),
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.executor_for(generation).is_ok()
    }

    async fn share_names(&self) -> Result<Vec<String>> {
        let (executor, _) = self.executor()?;
        executor
            .submit(|session| {
                session
                    .list_shares()
                    .map_err(|status| Error::from_status(status, "list shares", None))
            })
            .await
    }

    /// Shares exported by the server
    pub async fn list_shares(&self) -> Result<Vec<Share>> {
        let show_hidden = self.inner.config.show_hidden_shares;
        let shares: Vec<Share> = self
            .share_names()
            .await?
            .into_iter()
            .filter(|name| show_hidden || !name.ends_with('$'))
            .map(|name| self.share(&name))
            .collect();
        debug!("{} lists {} shares", self.inner.device, shares.len());
        Ok(shares)
    }

    /// Look up one share by name, ignoring case
    pub async fn find_share(&self, name: &str) -> Result<Share> {
        let names = self.share_names().await?;
        match names.iter().find(|candidate| candidate.eq_ignore_ascii_case(name)) {
            Some(found) => Ok(self.share(found)),
            None => Err(Error::from_status(
                NtStatus::BAD_NETWORK_NAME,
                "find share",
                Some(name),
            )),
        }
    }

    /// The live share object for `name`, creating it if needed
    fn share(&self, name: &str) -> Share {
        let mut state = self.state();
        state.shares.retain(|_, share| share.is_alive());

        let key = name.to_uppercase();
        if let Some(share) = state.shares.get(&key).and_then(WeakShare::upgrade) {
            return share;
        }
        let share = Share::new(self.clone(), name);
        state.shares.insert(key, share.downgrade());
        share
    }

    /// Tree-connect to `name`
    pub(crate) async fn open_share(&self, name: &str) -> Result<(TreeId, u64)> {
        let (executor, generation) = self.executor()?;
        let share_name = name.to_string();
        let tid = executor
            .submit(move |session| {
                session
                    .tree_connect(&share_name)
                    .map_err(|status| Error::from_status(status, "tree connect", Some(&share_name)))
            })
            .await?;
        Ok((tid, generation))
    }

    /// Tree-disconnect; failures are logged, never reported
    pub(crate) async fn close_share(&self, tid: TreeId, generation: u64) {
        let executor = match self.executor_for(generation) {
            Ok(executor) => executor,
            Err(_) => {
                debug!("Skipping tree disconnect of {}: session is gone", tid);
                return;
            }
        };

        let result = executor
            .submit(move |session| {
                session
                    .tree_disconnect(tid)
                    .map_err(|status| Error::from_status(status, "tree disconnect", None))
            })
            .await;
        if let Err(e) = result {
            warn!("Ignoring failed tree disconnect of {}: {}", tid, e);
        }
    }
}

impl fmt::Debug for FileServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileServer")
            .field("device", &self.inner.device)
            .field("connected", &self.is_connected())
            .finish()
    }
}
