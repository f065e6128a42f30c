// Membership change listeners
// Subscribers receive the full set of registered broker ids after every change

use async_trait::async_trait;
use parking_lot::Mutex;
use roster_common::MembershipSnapshot;
use tracing::info;

/// Trait for handling membership changes
#[async_trait]
pub trait MembershipListener: Send + Sync {
    /// Called with the ids currently registered under `parent_path`.
    ///
    /// A returned error is logged; the subscription keeps going.
    async fn on_membership_change(
        &self,
        parent_path: &str,
        snapshot: &MembershipSnapshot,
    ) -> anyhow::Result<()>;
}

/// Adapts a plain closure into a listener
pub struct FnMembershipListener<F> {
    handler: F,
}

impl<F> FnMembershipListener<F>
where
    F: Fn(&str, &MembershipSnapshot) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> MembershipListener for FnMembershipListener<F>
where
    F: Fn(&str, &MembershipSnapshot) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_membership_change(
        &self,
        parent_path: &str,
        snapshot: &MembershipSnapshot,
    ) -> anyhow::Result<()> {
        (self.handler)(parent_path, snapshot)
    }
}

/// Logs joins and leaves between consecutive snapshots
#[derive(Default)]
pub struct LoggingMembershipListener {
    previous: Mutex<Option<MembershipSnapshot>>,
}

impl LoggingMembershipListener {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipListener for LoggingMembershipListener {
    async fn on_membership_change(
        &self,
        parent_path: &str,
        snapshot: &MembershipSnapshot,
    ) -> anyhow::Result<()> {
        let previous = self.previous.lock().replace(snapshot.clone());

        info!(
            "[Membership] {} changed, {} broker(s) registered: {}",
            parent_path,
            snapshot.len(),
            snapshot
        );
        if let Some(previous) = previous {
            for id in snapshot.joined_since(&previous) {
                info!("[Membership] Broker {} joined", id);
            }
            for id in snapshot.left_since(&previous) {
                info!("[Membership] Broker {} left", id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_common::BrokerId;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(ids: &[u32]) -> MembershipSnapshot {
        ids.iter().filter_map(|id| BrokerId::new(*id)).collect()
    }

    #[tokio::test]
    async fn test_fn_listener_forwards_arguments() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener = FnMembershipListener::new(move |path, snapshot| {
            assert_eq!(path, "/brokers/ids");
            counter.fetch_add(snapshot.len(), Ordering::SeqCst);
            Ok(())
        });

        listener
            .on_membership_change("/brokers/ids", &snapshot(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fn_listener_error_is_returned() {
        let listener = FnMembershipListener::new(|_, _| anyhow::bail!("handler failed"));
        let result = listener
            .on_membership_change("/brokers/ids", &snapshot(&[1]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_logging_listener_tracks_previous() {
        let listener = LoggingMembershipListener::new();
        listener
            .on_membership_change("/brokers/ids", &snapshot(&[1]))
            .await
            .unwrap();
        listener
            .on_membership_change("/brokers/ids", &snapshot(&[2]))
            .await
            .unwrap();
        assert_eq!(*listener.previous.lock(), Some(snapshot(&[2])));
    }
}
