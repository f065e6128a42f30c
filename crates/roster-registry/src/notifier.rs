//! Change notifier
//!
//! Turns one-shot children watches into a stream of membership snapshots for
//! any number of listeners. Every firing of the watch is handled as:
//!
//! 1. read the current children (with their version)
//! 2. deliver the snapshot to each listener in subscription order, unless it
//!    equals the last delivered one
//! 3. re-arm the watch against the listing read in step 1
//!
//! Step 3 runs no matter how the listeners behaved. Each listener call is
//! bounded by the handler timeout, and its errors and panics are logged and
//! dropped. A change that lands between steps 1 and 3 fires the re-armed
//! watch at once, so nothing is missed.
//!
//! The chain stops (the subscription goes `Dead`) only when the session
//! expires or re-arming fails. A later subscribe on a fresh session starts a
//! new chain.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use roster_common::MembershipSnapshot;
use roster_coord::{
    Children, CoordError, CoordinationClient, WatchCallback, WatchEvent, WatchEventKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::listener::MembershipListener;

/// Lifecycle of a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    /// A watch is armed and changes are being delivered.
    Watching,
    /// The watch could not be re-armed; terminal until subscribing again.
    Dead,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Unsubscribed => write!(f, "UNSUBSCRIBED"),
            SubscriptionState::Watching => write!(f, "WATCHING"),
            SubscriptionState::Dead => write!(f, "DEAD"),
        }
    }
}

type ListenerEntry = (u64, Arc<dyn MembershipListener>);

pub struct ChangeNotifier {
    client: Arc<CoordinationClient>,
    path: String,
    handler_timeout: Duration,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    /// Identifies the current watch chain; callbacks of older chains are ignored.
    generation: AtomicU64,
    last_delivered: Mutex<MembershipSnapshot>,
    /// Last listing read, used to re-arm when a read fails
    last_children: Mutex<Children>,
    state: watch::Sender<SubscriptionState>,
    start_lock: tokio::sync::Mutex<()>,
}

impl ChangeNotifier {
    pub fn new(
        client: Arc<CoordinationClient>,
        path: impl Into<String>,
        handler_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SubscriptionState::Unsubscribed);
        Arc::new(Self {
            client,
            path: path.into(),
            handler_timeout,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            last_delivered: Mutex::new(MembershipSnapshot::empty()),
            last_children: Mutex::new(Children::default()),
            state,
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Snapshot most recently handed to listeners
    pub fn last_delivered(&self) -> MembershipSnapshot {
        self.last_delivered.lock().clone()
    }

    /// Add a listener, arming the watch if no chain is running.
    ///
    /// Returns the listener id and the snapshot the listener starts from.
    pub async fn add_listener(
        self: &Arc<Self>,
        listener: Arc<dyn MembershipListener>,
    ) -> Result<(u64, MembershipSnapshot)> {
        let _guard = self.start_lock.lock().await;

        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);

        if self.state() == SubscriptionState::Watching {
            // same lock order as `deliver`: the listener either starts from
            // a snapshot or receives it, never both
            let initial = {
                let mut listeners = self.listeners.write();
                listeners.push((id, listener));
                self.last_delivered.lock().clone()
            };
            debug!(
                "Registered membership listener {} on {}, total: {}",
                id,
                self.path,
                self.listener_count()
            );
            return Ok((id, initial));
        }

        self.listeners.write().push((id, listener));
        debug!(
            "Registered membership listener {} on {}, total: {}",
            id,
            self.path,
            self.listener_count()
        );

        match self.start().await {
            Ok(snapshot) => Ok((id, snapshot)),
            Err(e) => {
                self.listeners.write().retain(|(existing, _)| *existing != id);
                Err(e.into())
            }
        }
    }

    /// Remove a listener. Removing the last one stops delivery.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;

        if removed && listeners.is_empty() {
            // the armed watch cannot be withdrawn; its callback becomes a no-op
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.state.send_replace(SubscriptionState::Unsubscribed);
            info!("Last membership listener on {} removed", self.path);
        }
        removed
    }

    async fn start(self: &Arc<Self>) -> std::result::Result<MembershipSnapshot, CoordError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // a failed start leaves the state as it was
        let children = self.client.list_children(&self.path).await?;
        let snapshot = MembershipSnapshot::from_children(&children.names);
        *self.last_delivered.lock() = snapshot.clone();
        self.rearm(generation, &children).await?;

        self.state.send_replace(SubscriptionState::Watching);
        info!("Watching {} with initial membership {}", self.path, snapshot);
        Ok(snapshot)
    }

    fn watch_callback(self: &Arc<Self>, generation: u64) -> WatchCallback {
        let notifier: Weak<Self> = Arc::downgrade(self);
        Box::new(move |event| {
            async move {
                match notifier.upgrade() {
                    Some(notifier) => notifier.on_event(generation, event).await,
                    None => debug!("Notifier dropped, ignoring {:?}", event.kind),
                }
            }
            .boxed()
        })
    }

    async fn rearm(
        self: &Arc<Self>,
        generation: u64,
        children: &Children,
    ) -> std::result::Result<(), CoordError> {
        *self.last_children.lock() = children.clone();
        self.client
            .watch_children_since(&self.path, children, self.watch_callback(generation))
            .await
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn on_event(self: Arc<Self>, generation: u64, event: WatchEvent) {
        if !self.is_current(generation) {
            debug!("Ignoring {:?} on {} from a stopped watch", event.kind, event.path);
            return;
        }

        if event.kind == WatchEventKind::SessionExpired {
            self.mark_dead(generation, &CoordError::SessionExpired(self.client.session_id()));
            return;
        }

        let listing = self.client.list_children(&self.path).await;
        // an unsubscribe during the read ends the chain here
        if !self.is_current(generation) {
            debug!("Watch chain on {} stopped during a read", self.path);
            return;
        }
        let children = match listing {
            Ok(children) => {
                let snapshot = MembershipSnapshot::from_children(&children.names);
                self.deliver(generation, snapshot).await;
                children
            }
            Err(e @ (CoordError::SessionExpired(_) | CoordError::SessionClosed)) => {
                self.mark_dead(generation, &e);
                return;
            }
            Err(e) => {
                warn!(
                    "Failed to read children of {} after a change: {}, re-arming",
                    self.path, e
                );
                let last = self.last_children.lock().clone();
                last
            }
        };

        // an unsubscribe during delivery ends the chain here
        if !self.is_current(generation) {
            return;
        }
        if let Err(e) = self.rearm(generation, &children).await {
            self.mark_dead(generation, &e);
        }
    }

    async fn deliver(&self, generation: u64, snapshot: MembershipSnapshot) {
        let listeners: Vec<ListenerEntry> = {
            let current = self.listeners.read();
            let mut last = self.last_delivered.lock();
            if !self.is_current(generation) {
                return;
            }
            if *last == snapshot {
                debug!("Membership of {} unchanged at {}, skipping", self.path, snapshot);
                return;
            }
            *last = snapshot.clone();
            current.clone()
        };
        debug!(
            "Delivering membership {} of {} to {} listener(s)",
            snapshot,
            self.path,
            listeners.len()
        );

        for (id, listener) in listeners {
            if !self.is_current(generation) {
                debug!("Watch chain on {} stopped mid-delivery", self.path);
                return;
            }
            let call =
                AssertUnwindSafe(listener.on_membership_change(&self.path, &snapshot)).catch_unwind();
            match tokio::time::timeout(self.handler_timeout, call).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("Membership listener {} on {} failed: {:#}", id, self.path, e)
                }
                Ok(Err(_)) => error!("Membership listener {} on {} panicked", id, self.path),
                Err(_) => warn!(
                    "Membership listener {} on {} timed out after {:?}",
                    id, self.path, self.handler_timeout
                ),
            }
        }
    }

    /// Only the current chain may end the subscription.
    fn mark_dead(&self, generation: u64, cause: &CoordError) {
        let died = self.state.send_if_modified(|state| {
            if !self.is_current(generation) || *state == SubscriptionState::Dead {
                return false;
            }
            *state = SubscriptionState::Dead;
            true
        });
        if died {
            error!(
                "Subscription on {} is dead: {}; subscribe again after reconnecting",
                self.path, cause
            );
        }
    }
}

/// A live subscription returned by `MembershipRegistry::subscribe`.
///
/// Dropping the handle keeps the listener subscribed; call `unsubscribe`
/// to stop delivery.
pub struct SubscriptionHandle {
    id: u64,
    initial: MembershipSnapshot,
    notifier: Arc<ChangeNotifier>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, initial: MembershipSnapshot, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            id,
            initial,
            notifier,
        }
    }

    /// Membership at the time of subscribing
    pub fn initial_snapshot(&self) -> &MembershipSnapshot {
        &self.initial
    }

    pub fn state(&self) -> SubscriptionState {
        self.notifier.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.notifier.state_changes()
    }

    pub fn unsubscribe(self) {
        if self.notifier.remove_listener(self.id) {
            debug!("Unsubscribed listener {} from {}", self.id, self.notifier.path());
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("path", &self.notifier.path())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::FnMembershipListener;
    use async_trait::async_trait;
    use bytes::Bytes;
    use roster_coord::{ClientOptions, MemoryCoordinator};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Semaphore, mpsc};

    const WAIT: Duration = Duration::from_secs(3);

    /// Reports each call, then holds it until a permit is released.
    struct Gate {
        entered: mpsc::UnboundedSender<MembershipSnapshot>,
        release: Semaphore,
    }

    #[async_trait]
    impl MembershipListener for Gate {
        async fn on_membership_change(
            &self,
            _parent_path: &str,
            snapshot: &MembershipSnapshot,
        ) -> anyhow::Result<()> {
            let _ = self.entered.send(snapshot.clone());
            self.release.acquire().await?.forget();
            Ok(())
        }
    }

    fn recording() -> (
        Arc<dyn MembershipListener>,
        mpsc::UnboundedReceiver<MembershipSnapshot>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn MembershipListener> =
            Arc::new(FnMembershipListener::new(move |_, snapshot: &MembershipSnapshot| {
                let _ = tx.send(snapshot.clone());
                Ok(())
            }));
        (listener, rx)
    }

    async fn setup() -> (MemoryCoordinator, Arc<CoordinationClient>) {
        let coordinator = MemoryCoordinator::new();
        let client = CoordinationClient::connect(coordinator.connector(), ClientOptions::default())
            .await
            .unwrap();
        client.ensure_path("/brokers/ids").await.unwrap();
        (coordinator, Arc::new(client))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SubscriptionState::Watching.to_string(), "WATCHING");
        assert_eq!(SubscriptionState::Dead.to_string(), "DEAD");
    }

    #[tokio::test]
    async fn test_first_listener_starts_watching() {
        let (_coordinator, client) = setup().await;
        let notifier = ChangeNotifier::new(client, "/brokers/ids", Duration::from_secs(1));
        assert_eq!(notifier.state(), SubscriptionState::Unsubscribed);

        let listener = Arc::new(FnMembershipListener::new(|_, _| Ok(())));
        let (first, snapshot) = notifier.add_listener(listener.clone()).await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(notifier.state(), SubscriptionState::Watching);

        let (second, _) = notifier.add_listener(listener).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(notifier.listener_count(), 2);

        assert!(notifier.remove_listener(first));
        assert_eq!(notifier.state(), SubscriptionState::Watching);
        assert!(notifier.remove_listener(second));
        assert_eq!(notifier.state(), SubscriptionState::Unsubscribed);
        assert!(!notifier.remove_listener(second));
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_not_redelivered() {
        let (_coordinator, client) = setup().await;
        let notifier = ChangeNotifier::new(client, "/brokers/ids", Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        notifier
            .add_listener(Arc::new(FnMembershipListener::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .await
            .unwrap();

        let generation = notifier.generation.load(Ordering::SeqCst);
        notifier.deliver(generation, MembershipSnapshot::empty()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let snapshot = MembershipSnapshot::from_children(["1"]);
        notifier.deliver(generation, snapshot.clone()).await;
        notifier.deliver(generation, snapshot.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.last_delivered(), snapshot);
    }

    #[tokio::test]
    async fn test_missing_path_fails_subscribe() {
        let coordinator = MemoryCoordinator::new();
        let client = CoordinationClient::connect(coordinator.connector(), ClientOptions::default())
            .await
            .unwrap();
        let notifier =
            ChangeNotifier::new(Arc::new(client), "/brokers/ids", Duration::from_secs(1));

        let result = notifier
            .add_listener(Arc::new(FnMembershipListener::new(|_, _| Ok(()))))
            .await;

        assert!(result.is_err());
        assert_eq!(notifier.listener_count(), 0);
        assert_eq!(notifier.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_stale_chain_cannot_deliver_or_kill() {
        let (_coordinator, client) = setup().await;
        let notifier = ChangeNotifier::new(client.clone(), "/brokers/ids", Duration::from_secs(1));

        let (first, _) = notifier
            .add_listener(Arc::new(FnMembershipListener::new(|_, _| Ok(()))))
            .await
            .unwrap();
        let stale = notifier.generation.load(Ordering::SeqCst);
        notifier.remove_listener(first);

        let (listener, mut delivered) = recording();
        notifier.add_listener(listener).await.unwrap();
        assert_ne!(notifier.generation.load(Ordering::SeqCst), stale);

        client
            .create_persistent("/brokers/ids/scratch", Bytes::new())
            .await
            .unwrap();
        client.delete("/brokers/ids/scratch").await.unwrap();
        notifier
            .clone()
            .on_event(stale, WatchEvent::children_changed("/brokers/ids"))
            .await;
        notifier
            .clone()
            .on_event(stale, WatchEvent::session_expired("/brokers/ids"))
            .await;
        notifier
            .deliver(stale, MembershipSnapshot::from_children(["9"]))
            .await;
        notifier.mark_dead(stale, &CoordError::SessionClosed);

        assert_eq!(notifier.state(), SubscriptionState::Watching);
        assert!(notifier.last_delivered().is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(delivered.try_recv().is_err());

        // the live chain still works
        client
            .create_ephemeral("/brokers/ids/4", Bytes::new())
            .await
            .unwrap();
        let snapshot = tokio::time::timeout(WAIT, delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot, MembershipSnapshot::from_children(["4"]));
    }

    #[tokio::test]
    async fn test_listener_added_mid_delivery_is_not_sent_its_initial_snapshot() {
        let (_coordinator, client) = setup().await;
        let notifier = ChangeNotifier::new(client.clone(), "/brokers/ids", Duration::from_secs(5));

        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::new(Gate {
            entered: entered_tx,
            release: Semaphore::new(0),
        });
        notifier.add_listener(gate.clone()).await.unwrap();

        client
            .create_ephemeral("/brokers/ids/1", Bytes::new())
            .await
            .unwrap();
        let in_flight = tokio::time::timeout(WAIT, entered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight, MembershipSnapshot::from_children(["1"]));

        let (late, mut late_rx) = recording();
        let (_, initial) = notifier.add_listener(late).await.unwrap();
        assert_eq!(initial, in_flight);

        gate.release.add_permits(10);
        client
            .create_ephemeral("/brokers/ids/2", Bytes::new())
            .await
            .unwrap();

        let first_seen = tokio::time::timeout(WAIT, late_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first_seen, MembershipSnapshot::from_children(["1", "2"]));
    }
}
