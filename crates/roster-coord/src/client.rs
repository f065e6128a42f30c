//! Coordination client adapter
//!
//! `CoordinationClient` is the stable interface the registry talks to. It
//! owns the current backend session and adds:
//! - bounded retry with backoff for transient failures
//! - a timeout on every request
//! - owner-token checks so a create retried after a lost reply is not
//!   mistaken for someone else's node
//! - watch arming relative to the last children listing this client read

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use roster_common::config::{BackendKind, CoordinatorConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{
    Children, CoordinationBackend, Connector, CreateMode, NodeData, SessionState, WatchCallback,
    validate_path,
};
use crate::consul::ConsulConnector;
use crate::error::{CoordError, Result};
use crate::memory::MemoryCoordinator;
use crate::retry::{RetryPolicy, with_timeout};

/// How `create_ephemeral` resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Created {
    /// The node was written by this call.
    New,
    /// The node was already owned by this session: left by an earlier call, or
    /// written by an attempt of this call whose reply was lost. Its payload may
    /// differ from the one passed in.
    AlreadyOwned,
}

/// Session and request settings for a `CoordinationClient`
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub session_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

impl ClientOptions {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            session_ttl: config.session_ttl(),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

pub struct CoordinationClient {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    backend: RwLock<Arc<dyn CoordinationBackend>>,
    /// Last children listing read per path, the baseline for the next watch
    observed: DashMap<String, Children>,
}

impl CoordinationClient {
    /// Establish a session, retrying transient failures with backoff.
    ///
    /// Fails with `CoordError::Connection` once the attempt budget is spent.
    pub async fn connect(connector: Arc<dyn Connector>, options: ClientOptions) -> Result<Self> {
        let backend = open_session(connector.as_ref(), &options).await?;
        Ok(Self {
            connector,
            options,
            backend: RwLock::new(backend),
            observed: DashMap::new(),
        })
    }

    /// Connect to the backend named in `config`.
    ///
    /// The memory backend gets a fresh in-process coordinator, so it is only
    /// shared by sessions of this client.
    pub async fn connect_with_config(config: &CoordinatorConfig) -> Result<Self> {
        let connector: Arc<dyn Connector> = match config.backend {
            BackendKind::Consul => {
                Arc::new(ConsulConnector::new(&config.address, config.connect_timeout())?)
            }
            BackendKind::Memory => MemoryCoordinator::new().connector(),
        };
        Self::connect(connector, ClientOptions::from_config(config)).await
    }

    fn backend(&self) -> Arc<dyn CoordinationBackend> {
        self.backend.read().clone()
    }

    pub fn address(&self) -> &str {
        self.connector.address()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Owner token of the current session
    pub fn session_id(&self) -> String {
        self.backend().session_id().to_string()
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.backend().session_state()
    }

    pub fn is_connected(&self) -> bool {
        *self.session_state().borrow() == SessionState::Connected
    }

    /// Create a node owned by the current session.
    ///
    /// A `NodeExists` whose owner is this very session (a retry after a lost
    /// reply, or a repeated call) counts as success.
    pub async fn create_ephemeral(&self, path: &str, payload: Bytes) -> Result<Created> {
        validate_path(path)?;
        let backend = self.backend();
        let session_id = backend.session_id().to_string();
        let timeout = self.options.request_timeout;

        let result = self
            .options
            .retry
            .run("create ephemeral", |_| {
                let backend = backend.clone();
                let payload = payload.clone();
                async move {
                    with_timeout(timeout, backend.create(path, payload, CreateMode::Ephemeral))
                        .await
                }
            })
            .await;

        match result {
            Ok(()) => Ok(Created::New),
            Err(CoordError::NodeExists {
                owner: Some(owner), ..
            }) if owner == session_id => {
                debug!("Ephemeral node {} already owned by this session", path);
                Ok(Created::AlreadyOwned)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_persistent(&self, path: &str, payload: Bytes) -> Result<()> {
        validate_path(path)?;
        let backend = self.backend();
        let timeout = self.options.request_timeout;

        self.options
            .retry
            .run("create persistent", |attempt| {
                let backend = backend.clone();
                let payload = payload.clone();
                async move {
                    match with_timeout(
                        timeout,
                        backend.create(path, payload, CreateMode::Persistent),
                    )
                    .await
                    {
                        // an earlier attempt went through before its reply was lost
                        Err(CoordError::NodeExists { owner: None, .. }) if attempt > 1 => Ok(()),
                        other => other,
                    }
                }
            })
            .await
    }

    /// Create `path` and any missing ancestors as persistent nodes.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create_persistent(&current, Bytes::new()).await {
                Ok(()) => debug!("Created persistent node {}", current),
                Err(CoordError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let backend = self.backend();
        let timeout = self.options.request_timeout;

        self.options
            .retry
            .run("delete", |attempt| {
                let backend = backend.clone();
                async move {
                    match with_timeout(timeout, backend.delete(path)).await {
                        Err(CoordError::NoNode(_)) if attempt > 1 => Ok(()),
                        other => other,
                    }
                }
            })
            .await
    }

    pub async fn get_data(&self, path: &str) -> Result<NodeData> {
        validate_path(path)?;
        let backend = self.backend();
        let timeout = self.options.request_timeout;

        self.options
            .retry
            .run("get data", |_| {
                let backend = backend.clone();
                async move { with_timeout(timeout, backend.get_data(path)).await }
            })
            .await
    }

    /// Child names of `path`. Does not arm a watch, but becomes the baseline
    /// the next `watch_children` on `path` is armed against.
    pub async fn get_children(&self, path: &str) -> Result<BTreeSet<String>> {
        Ok(self.list_children(path).await?.names)
    }

    /// Child names of `path` with the version they were read at.
    pub async fn list_children(&self, path: &str) -> Result<Children> {
        validate_path(path)?;
        let backend = self.backend();
        let timeout = self.options.request_timeout;

        let children = self
            .options
            .retry
            .run("get children", |_| {
                let backend = backend.clone();
                async move { with_timeout(timeout, backend.get_children(path)).await }
            })
            .await?;

        self.observed.insert(path.to_string(), children.clone());
        Ok(children)
    }

    /// Arm a one-shot watch on the children of `path`.
    ///
    /// `callback` runs exactly once: on the next child add/remove after the
    /// last `get_children` of `path`, or with `SessionExpired` if the session
    /// ends first. Re-arming is the caller's job.
    pub async fn watch_children(&self, path: &str, callback: WatchCallback) -> Result<()> {
        validate_path(path)?;
        let cached = self.observed.get(path).map(|children| children.clone());
        let observed = match cached {
            Some(children) => children,
            None => self.list_children(path).await?,
        };
        self.watch_children_since(path, &observed, callback).await
    }

    /// Arm a one-shot watch relative to a listing the caller read itself.
    ///
    /// Fires right away if the children moved past `observed` already.
    pub async fn watch_children_since(
        &self,
        path: &str,
        observed: &Children,
        callback: WatchCallback,
    ) -> Result<()> {
        validate_path(path)?;
        let backend = self.backend();
        let timeout = self.options.request_timeout;
        // A lost-but-applied arm followed by a retry must still fire only once.
        let slot = Arc::new(Mutex::new(Some(callback)));

        self.options
            .retry
            .run("watch children", |_| {
                let backend = backend.clone();
                let slot = slot.clone();
                async move {
                    let once: WatchCallback = Box::new(move |event| match slot.lock().take() {
                        Some(callback) => callback(event),
                        None => async {}.boxed(),
                    });
                    with_timeout(timeout, backend.watch_children(path, observed, once)).await
                }
            })
            .await
    }

    /// Replace an expired or closed session with a new one.
    ///
    /// Ephemeral nodes of the old session are gone; callers register again.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Session {} still connected, not reconnecting", self.session_id());
            return Ok(());
        }

        let backend = open_session(self.connector.as_ref(), &self.options).await?;
        let old = std::mem::replace(&mut *self.backend.write(), backend);
        self.observed.clear();
        info!(
            "Replaced session {} with {}",
            old.session_id(),
            self.session_id()
        );
        Ok(())
    }

    /// End the session; its ephemeral nodes are removed by the service.
    pub async fn close(&self) -> Result<()> {
        let backend = self.backend();
        with_timeout(self.options.request_timeout, backend.close()).await?;
        info!("Closed coordination session {}", backend.session_id());
        Ok(())
    }
}

async fn open_session(
    connector: &dyn Connector,
    options: &ClientOptions,
) -> Result<Arc<dyn CoordinationBackend>> {
    let address = connector.address().to_string();
    let result = options
        .retry
        .run("connect", |attempt| {
            debug!("Connecting to {} (attempt {})", address, attempt);
            with_timeout(options.connect_timeout, connector.connect(options.session_ttl))
        })
        .await;

    match result {
        Ok(backend) => {
            info!(
                "Connected to coordination service at {}, session {}",
                address,
                backend.session_id()
            );
            Ok(backend)
        }
        Err(e) if e.is_transient() => {
            warn!("Giving up connecting to {}: {}", address, e);
            Err(CoordError::Connection(format!(
                "{} unreachable after {} attempts: {}",
                address, options.retry.max_attempts, e
            )))
        }
        Err(e) => Err(e),
    }
}
