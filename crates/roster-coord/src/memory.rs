//! In-process coordination service
//!
//! `MemoryCoordinator` keeps a node tree with persistent and ephemeral nodes,
//! sessions with a heartbeat TTL and one-shot children watches. Every
//! session gets a notification task that runs its watch callbacks one at a
//! time, the way a coordination client library delivers events on its own
//! event thread.
//!
//! Besides single-process deployments it is the test double for the
//! registry: sessions can be expired on demand, heartbeats suspended, and
//! connection faults injected.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{
    Children, CoordinationBackend, Connector, CreateMode, NodeData, Notification, SessionState,
    WatchCallback, WatchEvent, parent_path, spawn_notification_task, validate_path,
};
use crate::error::{CoordError, Result};

const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Node {
    payload: Bytes,
    owner: Option<String>,
    /// Bumped on every child create/delete
    cversion: u64,
}

impl Node {
    fn new(payload: Bytes, owner: Option<String>) -> Self {
        Self {
            payload,
            owner,
            cversion: 0,
        }
    }
}

struct PendingWatch {
    session_id: String,
    callback: WatchCallback,
}

struct SessionEntry {
    ttl: Duration,
    last_heartbeat: Instant,
    heartbeats_suspended: bool,
    events: mpsc::UnboundedSender<Notification>,
    state: watch::Sender<SessionState>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<String, SessionEntry>,
    watches: HashMap<String, Vec<PendingWatch>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), None));
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: HashMap::new(),
        }
    }

    fn children_of(&self, path: &str) -> BTreeSet<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        !self.children_of(path).is_empty()
    }

    fn check_session(&self, session_id: &str) -> Result<()> {
        if self.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired(session_id.to_string()))
        }
    }

    /// Bump the parent's children version and fire every watch on it.
    fn children_changed(&mut self, parent: &str) {
        if let Some(node) = self.nodes.get_mut(parent) {
            node.cversion += 1;
        }
        let Some(pending) = self.watches.remove(parent) else {
            return;
        };
        for watch in pending {
            self.deliver(
                &watch.session_id,
                WatchEvent::children_changed(parent),
                watch.callback,
            );
        }
    }

    fn deliver(&self, session_id: &str, event: WatchEvent, callback: WatchCallback) {
        match self.sessions.get(session_id) {
            Some(session) => {
                if session.events.send((event, callback)).is_err() {
                    debug!("Notification task for session {} is gone", session_id);
                }
            }
            None => debug!("Dropping watch of ended session {}", session_id),
        }
    }

    /// Remove a session and everything it owns.
    fn end_session(&mut self, session_id: &str, state: SessionState) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };

        // Its own pending watches learn about the expiry; on close they are dropped.
        for (path, pending) in self.watches.iter_mut() {
            let (own, others): (Vec<_>, Vec<_>) = std::mem::take(pending)
                .into_iter()
                .partition(|w| w.session_id == session_id);
            *pending = others;
            if state == SessionState::Expired {
                for watch in own {
                    let _ = session
                        .events
                        .send((WatchEvent::session_expired(path.clone()), watch.callback));
                }
            }
        }
        self.watches.retain(|_, pending| !pending.is_empty());
        let _ = session.state.send(state);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.as_deref() == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            self.nodes.remove(&path);
            if let Some(parent) = parent_path(&path) {
                self.children_changed(parent);
            }
            debug!("Removed ephemeral node {} of session {}", path, session_id);
        }
    }
}

struct CoordinatorState {
    tree: Mutex<Tree>,
    reaper_interval: Duration,
    reaper_started: Mutex<bool>,
    fail_next_connects: AtomicU32,
    drop_next_replies: AtomicU32,
    /// Injected latency of `get_data` per path
    read_delays: Mutex<HashMap<String, Duration>>,
}

impl CoordinatorState {
    /// Consume one injected reply drop, if any.
    fn take_dropped_reply(&self) -> bool {
        self.drop_next_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        let mut tree = self.tree.lock();
        let expired: Vec<String> = tree
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_heartbeat) > s.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in expired {
            info!("Session {} expired after missing heartbeats", session_id);
            tree.end_session(&session_id, SessionState::Expired);
        }
    }
}

/// In-process coordination service shared by every session connected to it.
#[derive(Clone)]
pub struct MemoryCoordinator {
    state: Arc<CoordinatorState>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::with_reaper_interval(DEFAULT_REAPER_INTERVAL)
    }

    /// `interval` is how often lapsed sessions are looked for.
    pub fn with_reaper_interval(interval: Duration) -> Self {
        Self {
            state: Arc::new(CoordinatorState {
                tree: Mutex::new(Tree::new()),
                reaper_interval: interval,
                reaper_started: Mutex::new(false),
                fail_next_connects: AtomicU32::new(0),
                drop_next_replies: AtomicU32::new(0),
                read_delays: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            coordinator: self.clone(),
        })
    }

    /// Open a session directly.
    pub async fn connect(&self, session_ttl: Duration) -> Result<Arc<MemorySession>> {
        if self
            .state
            .fail_next_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoordError::Connection(
                "memory coordinator unavailable".to_string(),
            ));
        }

        self.ensure_reaper();

        let session_id = uuid::Uuid::new_v4().to_string();
        let events_tx = spawn_notification_task(session_id.clone());
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);

        self.state.tree.lock().sessions.insert(
            session_id.clone(),
            SessionEntry {
                ttl: session_ttl,
                last_heartbeat: Instant::now(),
                heartbeats_suspended: false,
                events: events_tx,
                state: state_tx,
            },
        );

        tokio::spawn(run_heartbeats(
            Arc::downgrade(&self.state),
            session_id.clone(),
            session_ttl / 3,
        ));

        debug!("Opened memory session {} (ttl {:?})", session_id, session_ttl);

        Ok(Arc::new(MemorySession {
            state: self.state.clone(),
            session_id,
            state_rx,
        }))
    }

    fn ensure_reaper(&self) {
        let mut started = self.state.reaper_started.lock();
        if *started {
            return;
        }
        *started = true;

        let weak = Arc::downgrade(&self.state);
        let interval = self.state.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.reap_expired();
            }
        });
    }

    /// End a session as if its heartbeats had timed out.
    pub fn expire_session(&self, session_id: &str) -> bool {
        let mut tree = self.state.tree.lock();
        if !tree.sessions.contains_key(session_id) {
            return false;
        }
        info!("Forcing expiry of session {}", session_id);
        tree.end_session(session_id, SessionState::Expired);
        true
    }

    /// Stop counting heartbeats of a session, so it expires after its TTL.
    /// Models a process that stopped without closing its session.
    pub fn suspend_heartbeats(&self, session_id: &str) -> bool {
        let mut tree = self.state.tree.lock();
        match tree.sessions.get_mut(session_id) {
            Some(session) => {
                session.heartbeats_suspended = true;
                true
            }
            None => false,
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.fail_next_connects.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` mutating requests but report them as lost.
    pub fn drop_next_replies(&self, count: u32) {
        self.state.drop_next_replies.store(count, Ordering::SeqCst);
    }

    /// Stall every `get_data` of `path` for `delay` before answering.
    /// `Duration::ZERO` removes the stall.
    pub fn delay_reads(&self, path: &str, delay: Duration) {
        let mut delays = self.state.read_delays.lock();
        if delay.is_zero() {
            delays.remove(path);
        } else {
            delays.insert(path.to_string(), delay);
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.tree.lock().sessions.len()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.tree.lock().nodes.contains_key(path)
    }

    /// Owner token of an ephemeral node
    pub fn owner_of(&self, path: &str) -> Option<String> {
        self.state
            .tree
            .lock()
            .nodes
            .get(path)
            .and_then(|node| node.owner.clone())
    }
}

async fn run_heartbeats(state: Weak<CoordinatorState>, session_id: String, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        let mut tree = state.tree.lock();
        match tree.sessions.get_mut(&session_id) {
            Some(session) if !session.heartbeats_suspended => {
                session.last_heartbeat = Instant::now();
            }
            Some(_) => {}
            None => break,
        }
    }
}

struct MemoryConnector {
    coordinator: MemoryCoordinator,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn address(&self) -> &str {
        "memory"
    }

    async fn connect(&self, session_ttl: Duration) -> Result<Arc<dyn CoordinationBackend>> {
        let session: Arc<dyn CoordinationBackend> =
            self.coordinator.connect(session_ttl).await?;
        Ok(session)
    }
}

/// One session against a `MemoryCoordinator`.
pub struct MemorySession {
    state: Arc<CoordinatorState>,
    session_id: String,
    state_rx: watch::Receiver<SessionState>,
}

impl MemorySession {
    fn lost_reply(&self, what: &str, path: &str) -> Result<()> {
        if self.state.take_dropped_reply() {
            warn!("Dropping reply of {} {} (injected)", what, path);
            return Err(CoordError::ConnectionLoss(format!("{} {}", what, path)));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationBackend for MemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn create(&self, path: &str, payload: Bytes, mode: CreateMode) -> Result<()> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| CoordError::InvalidPath(path.to_string()))?;
        {
            let mut tree = self.state.tree.lock();
            tree.check_session(&self.session_id)?;

            if let Some(existing) = tree.nodes.get(path) {
                return Err(CoordError::NodeExists {
                    path: path.to_string(),
                    owner: existing.owner.clone(),
                });
            }
            match tree.nodes.get(parent) {
                None => return Err(CoordError::NoNode(parent.to_string())),
                Some(node) if node.owner.is_some() => {
                    return Err(CoordError::Backend(format!(
                        "ephemeral node {} cannot have children",
                        parent
                    )));
                }
                Some(_) => {}
            }

            let owner = match mode {
                CreateMode::Ephemeral => Some(self.session_id.clone()),
                CreateMode::Persistent => None,
            };
            tree.nodes.insert(path.to_string(), Node::new(payload, owner));
            tree.children_changed(parent);
        }
        debug!("Created {:?} node {} ({})", mode, path, self.session_id);
        self.lost_reply("create", path)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| CoordError::InvalidPath(path.to_string()))?;
        {
            let mut tree = self.state.tree.lock();
            tree.check_session(&self.session_id)?;

            if !tree.nodes.contains_key(path) {
                return Err(CoordError::NoNode(path.to_string()));
            }
            if tree.has_children(path) {
                return Err(CoordError::Backend(format!("node {} is not empty", path)));
            }
            tree.nodes.remove(path);
            tree.children_changed(parent);
        }
        debug!("Deleted node {} ({})", path, self.session_id);
        self.lost_reply("delete", path)
    }

    async fn get_data(&self, path: &str) -> Result<NodeData> {
        validate_path(path)?;
        let delay = self.state.read_delays.lock().get(path).copied();
        if let Some(delay) = delay {
            debug!("Stalling read of {} for {:?} (injected)", path, delay);
            tokio::time::sleep(delay).await;
        }
        let tree = self.state.tree.lock();
        tree.check_session(&self.session_id)?;
        tree.nodes
            .get(path)
            .map(|node| NodeData {
                payload: node.payload.clone(),
                owner: node.owner.clone(),
            })
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    async fn get_children(&self, path: &str) -> Result<Children> {
        validate_path(path)?;
        let tree = self.state.tree.lock();
        tree.check_session(&self.session_id)?;
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        Ok(Children {
            names: tree.children_of(path),
            version: node.cversion,
        })
    }

    async fn watch_children(
        &self,
        path: &str,
        observed: &Children,
        callback: WatchCallback,
    ) -> Result<()> {
        validate_path(path)?;
        let mut tree = self.state.tree.lock();
        tree.check_session(&self.session_id)?;
        let cversion = tree
            .nodes
            .get(path)
            .map(|node| node.cversion)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;

        if cversion != observed.version {
            debug!(
                "Children of {} moved from version {} to {} before the watch was armed",
                path, observed.version, cversion
            );
            tree.deliver(
                &self.session_id,
                WatchEvent::children_changed(path),
                callback,
            );
        } else {
            tree.watches
                .entry(path.to_string())
                .or_default()
                .push(PendingWatch {
                    session_id: self.session_id.clone(),
                    callback,
                });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut tree = self.state.tree.lock();
        if !tree.sessions.contains_key(&self.session_id) {
            return Ok(());
        }
        tree.end_session(&self.session_id, SessionState::Closed);
        info!("Closed memory session {}", self.session_id);
        Ok(())
    }
}
