//! Membership registry
//!
//! Brokers announce themselves as ephemeral entries under `/brokers/ids`,
//! named by broker id and holding the encoded `BrokerRecord`. An entry lives
//! exactly as long as the session that created it, so "registered" means
//! "alive" without any heartbeat protocol in the registry itself.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use roster_common::{
    BROKER_IDS_PATH, BrokerId, BrokerRecord, MembershipConfig, MembershipSnapshot, RosterConfig,
    decode, encode,
};
use roster_coord::{CoordError, CoordinationClient, Created};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, Result};
use crate::listener::{FnMembershipListener, MembershipListener};
use crate::notifier::{ChangeNotifier, SubscriptionHandle};

/// How often a registration waiting on a prior entry checks again
const TAKEOVER_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct MembershipRegistry {
    client: Arc<CoordinationClient>,
    config: MembershipConfig,
    notifier: Arc<ChangeNotifier>,
}

impl MembershipRegistry {
    pub fn new(client: Arc<CoordinationClient>, config: MembershipConfig) -> Self {
        let notifier = ChangeNotifier::new(client.clone(), BROKER_IDS_PATH, config.handler_timeout());
        Self {
            client,
            config,
            notifier,
        }
    }

    /// Connect to the configured coordination service and build a registry on it.
    pub async fn connect(config: &RosterConfig) -> Result<Self> {
        let client = CoordinationClient::connect_with_config(&config.coordinator).await?;
        Ok(Self::new(Arc::new(client), config.registry.clone()))
    }

    pub fn client(&self) -> &Arc<CoordinationClient> {
        &self.client
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Announce `record` as an ephemeral entry owned by this session.
    ///
    /// An entry left by this same session counts as registered. An entry
    /// owned by another session is given up to `takeover_wait` to disappear
    /// (a restarted broker whose old session has not expired yet); after
    /// that the id is reported as a duplicate. The existing entry is never
    /// overwritten.
    pub async fn register(&self, record: &BrokerRecord) -> Result<()> {
        let id = record.id();
        let path = record.path();
        let payload = encode(record).map_err(|source| RegistryError::MalformedRecord {
            path: path.clone(),
            source,
        })?;

        self.client.ensure_path(BROKER_IDS_PATH).await?;

        let deadline = Instant::now() + self.config.takeover_wait();
        loop {
            match self.client.create_ephemeral(&path, payload.clone()).await {
                Ok(Created::AlreadyOwned) => return self.check_own_entry(record, &payload).await,
                Ok(Created::New) => {
                    info!(
                        "Registered broker {} at {} (session {})",
                        id,
                        record.address(),
                        self.client.session_id()
                    );
                    return Ok(());
                }
                Err(CoordError::NodeExists { owner, .. }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        error!(
                            "Broker id {} is already registered by session {}",
                            id,
                            owner.as_deref().unwrap_or("<persistent>")
                        );
                        return Err(RegistryError::DuplicateBrokerId(id));
                    }
                    info!(
                        "Broker id {} still held by session {}, waiting for it to expire",
                        id,
                        owner.as_deref().unwrap_or("<persistent>")
                    );
                    tokio::time::sleep(TAKEOVER_POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// An entry this session already holds counts as registered only if it
    /// carries the same record.
    async fn check_own_entry(&self, record: &BrokerRecord, payload: &[u8]) -> Result<()> {
        let stored = self.client.get_data(&record.path()).await?;
        if stored.payload.as_ref() == payload {
            info!(
                "Broker {} already registered at {} by this session",
                record.id(),
                record.address()
            );
            return Ok(());
        }
        warn!(
            "Broker {} is registered by this session with a different record, not updating it",
            record.id()
        );
        Err(RegistryError::RecordMismatch(record.id()))
    }

    /// Remove this session's entry for `id`. A missing entry is not an error.
    pub async fn deregister(&self, id: BrokerId) -> Result<()> {
        let path = id.path();
        let data = match self.client.get_data(&path).await {
            Ok(data) => data,
            Err(CoordError::NoNode(_)) => {
                debug!("Broker {} is not registered, nothing to remove", id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if data.owner.as_deref() != Some(self.client.session_id().as_str()) {
            warn!(
                "Not removing broker {}: owned by {:?}",
                id,
                data.owner.as_deref()
            );
            return Err(RegistryError::NotOwner(id));
        }

        match self.client.delete(&path).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {
                info!("Deregistered broker {}", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode the entry of one broker.
    pub async fn get_broker(&self, id: BrokerId) -> Result<BrokerRecord> {
        let path = id.path();
        let data = self.client.get_data(&path).await.map_err(|e| match e {
            CoordError::NoNode(_) => RegistryError::BrokerNotFound(id),
            other => other.into(),
        })?;

        let record = decode(&data.payload)
            .map_err(|source| RegistryError::MalformedRecord { path, source })?;
        if record.id() != id {
            return Err(RegistryError::MalformedRecord {
                path: id.path(),
                source: roster_common::CodecError::Malformed(format!(
                    "entry {} holds the record of broker {}",
                    id,
                    record.id()
                )),
            });
        }
        Ok(record)
    }

    /// Ids currently registered
    pub async fn get_broker_ids(&self) -> Result<MembershipSnapshot> {
        match self.client.get_children(BROKER_IDS_PATH).await {
            Ok(names) => Ok(MembershipSnapshot::from_children(&names)),
            Err(CoordError::NoNode(_)) => Ok(MembershipSnapshot::empty()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort scan of every registered broker.
    ///
    /// Entries are read concurrently, each bounded by `read_timeout` and the
    /// whole scan by `scan_timeout`. Entries that vanish mid-scan, fail to
    /// decode or time out are logged and left out; when the scan deadline
    /// passes, whatever was read so far is returned.
    pub async fn get_all_brokers(&self) -> Result<BTreeSet<BrokerRecord>> {
        let ids = self.get_broker_ids().await?;
        let deadline = Instant::now() + self.config.scan_timeout();
        let read_timeout = self.config.read_timeout();

        let mut reads: FuturesUnordered<_> = ids
            .iter()
            .map(|id| async move { (id, tokio::time::timeout(read_timeout, self.get_broker(id)).await) })
            .collect();

        let mut brokers = BTreeSet::new();
        loop {
            let next = match tokio::time::timeout_at(deadline, reads.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Broker scan timed out, returning {} of {} brokers",
                        brokers.len(),
                        ids.len()
                    );
                    break;
                }
            };

            match next {
                (_, Ok(Ok(record))) => {
                    brokers.insert(record);
                }
                (id, Ok(Err(RegistryError::BrokerNotFound(_)))) => {
                    debug!("Broker {} left during the scan", id);
                }
                (id, Ok(Err(e @ RegistryError::MalformedRecord { .. }))) => {
                    warn!("Skipping broker {}: {}", id, e);
                }
                (_, Ok(Err(e))) if e.is_fatal() => return Err(e),
                (id, Ok(Err(e))) => warn!("Failed to read broker {}: {}", id, e),
                (id, Err(_)) => warn!("Reading broker {} timed out after {:?}", id, read_timeout),
            }
        }
        Ok(brokers)
    }

    /// Deliver the membership to `listener` after every change.
    ///
    /// The returned handle carries the membership at subscription time; the
    /// listener is only called for changes after it.
    pub async fn subscribe(&self, listener: Arc<dyn MembershipListener>) -> Result<SubscriptionHandle> {
        self.client.ensure_path(BROKER_IDS_PATH).await?;
        let (id, initial) = self.notifier.add_listener(listener).await?;
        debug!("Subscription {} starts from {}", id, initial);
        Ok(SubscriptionHandle::new(id, initial, self.notifier.clone()))
    }

    /// `subscribe` with a plain closure
    pub async fn subscribe_fn<F>(&self, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&str, &MembershipSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnMembershipListener::new(handler)))
            .await
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Close the session; every entry it registered disappears.
    pub async fn close(&self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }
}
