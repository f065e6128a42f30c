//! Backend contract for coordination services
//!
//! A backend is one live session against a strongly consistent store that
//! offers hierarchical paths, session-bound (ephemeral) nodes and one-shot
//! children watches. `CoordinationClient` layers retry, timeouts and
//! owner-token checks on top of it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{CoordError, Result};

/// Lifetime of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed by the service when the creating session ends
    Ephemeral,
}

/// Observable session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// The service ended the session; its ephemeral nodes are gone.
    Expired,
    /// The session was closed by its owner.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Expired => write!(f, "EXPIRED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Payload and ownership of a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeData {
    pub payload: Bytes,
    /// Owning session token for ephemeral nodes
    pub owner: Option<String>,
}

/// Child names of a node together with the version they were read at.
///
/// The version only moves forward and changes whenever a child is added or
/// removed, so a watch armed "since" it can tell whether it already missed
/// a change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Children {
    pub names: BTreeSet<String>,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    /// A child was added or removed
    ChildrenChanged,
    /// The session that armed the watch expired; no further events follow.
    SessionExpired,
}

/// Delivered once to a one-shot watch callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn children_changed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: WatchEventKind::ChildrenChanged,
        }
    }

    pub fn session_expired(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: WatchEventKind::SessionExpired,
        }
    }
}

/// One-shot watch callback.
///
/// Callbacks of one session run on that session's notification task, one at
/// a time and in firing order; the returned future is awaited before the
/// next callback starts.
pub type WatchCallback = Box<dyn FnOnce(WatchEvent) -> BoxFuture<'static, ()> + Send + 'static>;

pub(crate) type Notification = (WatchEvent, WatchCallback);

/// Spawn the task that runs a session's watch callbacks in firing order.
pub(crate) fn spawn_notification_task(session_id: String) -> mpsc::UnboundedSender<Notification> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
    tokio::spawn(async move {
        while let Some((event, callback)) = rx.recv().await {
            debug!(
                "Session {} delivering {:?} for {}",
                session_id, event.kind, event.path
            );
            callback(event).await;
        }
        debug!("Notification task of session {} stopped", session_id);
    });
    tx
}

/// A live session with a coordination service.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Token identifying this session as the owner of its ephemeral nodes.
    fn session_id(&self) -> &str;

    fn session_state(&self) -> watch::Receiver<SessionState>;

    async fn create(&self, path: &str, payload: Bytes, mode: CreateMode) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn get_data(&self, path: &str) -> Result<NodeData>;

    async fn get_children(&self, path: &str) -> Result<Children>;

    /// Arm a one-shot watch on the children of `path`.
    ///
    /// `observed` is the last children listing the caller saw. If the
    /// children already changed since then the callback fires right away.
    async fn watch_children(
        &self,
        path: &str,
        observed: &Children,
        callback: WatchCallback,
    ) -> Result<()>;

    /// End the session. Ephemeral nodes it owns are removed and pending
    /// watches are dropped without firing.
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against one coordination service address.
#[async_trait]
pub trait Connector: Send + Sync {
    fn address(&self) -> &str;

    async fn connect(&self, session_ttl: Duration) -> Result<Arc<dyn CoordinationBackend>>;
}

/// Check that `path` is absolute with no empty segments and no trailing slash.
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Parent of `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `parent` + `/` + `name`
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
