use std::sync::Weak;

use async_trait::async_trait;
use roster_common::MembershipSnapshot;
use roster_registry::{MembershipListener, MembershipRegistry, RegistryError};
use tracing::{info, warn};

/// Logs every membership change together with each broker's record.
pub struct ClusterReporter {
    registry: Weak<MembershipRegistry>,
}

impl ClusterReporter {
    pub fn new(registry: Weak<MembershipRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MembershipListener for ClusterReporter {
    async fn on_membership_change(
        &self,
        parent_path: &str,
        snapshot: &MembershipSnapshot,
    ) -> anyhow::Result<()> {
        info!("Membership of {} changed: {}", parent_path, snapshot);

        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        for id in snapshot.iter() {
            match registry.get_broker(id).await {
                Ok(record) => info!("  {}", record),
                Err(RegistryError::BrokerNotFound(_)) => info!("  Broker {} already left", id),
                Err(e) => warn!("  Broker {}: {}", id, e),
            }
        }
        Ok(())
    }
}
