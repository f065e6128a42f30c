//! Roster broker process.
//!
//! Registers this broker under `/brokers/ids/<id>`, reports every membership
//! change, and stays registered until Ctrl-C. A lost session ends the
//! process; the broker is never re-registered behind the operator's back.

mod cli;
mod host;
mod logging;
mod reporter;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use roster_common::{BrokerRecord, RosterConfig};
use roster_coord::SessionState;
use roster_registry::MembershipRegistry;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::logging::{LoggingConfig, init_logging};
use crate::reporter::ClusterReporter;

const ALIVE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RosterConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("failed to load configuration")?;
    let _logging_guard = init_logging(&LoggingConfig::from_settings(&config.logging))?;

    let host = cli.host.clone().unwrap_or_else(host::detect_host);
    let record = BrokerRecord::try_new(cli.broker_id, host, cli.port()?)
        .context("invalid advertised address")?;
    info!(
        "Starting broker {} at {} (coordinator {:?} at {})",
        record.id(),
        record.address(),
        config.coordinator.backend,
        config.coordinator.address
    );

    let registry = Arc::new(
        MembershipRegistry::connect(&config)
            .await
            .context("failed to connect to the coordination service")?,
    );

    registry
        .subscribe(Arc::new(ClusterReporter::new(Arc::downgrade(&registry))))
        .await
        .context("failed to watch cluster membership")?;

    if let Err(e) = registry.register(&record).await {
        error!("Failed to register broker {}: {}", record.id(), e);
        let _ = registry.close().await;
        return Err(e.into());
    }

    match registry.get_all_brokers().await {
        Ok(brokers) => {
            info!("Cluster has {} broker(s)", brokers.len());
            for broker in &brokers {
                info!("  {}", broker);
            }
        }
        Err(e) => warn!("Failed to read cluster state: {}", e),
    }

    let result = run_until_shutdown(&registry, &record).await;

    if result.is_ok()
        && let Err(e) = registry.deregister(record.id()).await
    {
        warn!("Failed to deregister broker {}: {}", record.id(), e);
    }
    if let Err(e) = registry.close().await {
        warn!("Failed to close coordination session: {}", e);
    }
    info!("Broker {} stopped", record.id());
    result
}

async fn run_until_shutdown(
    registry: &MembershipRegistry,
    record: &BrokerRecord,
) -> anyhow::Result<()> {
    let mut session = registry.client().session_state();
    let mut ticker = tokio::time::interval(ALIVE_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("Shutting down broker {}", record.id());
                return Ok(());
            }
            _ = ticker.tick() => {
                info!(
                    "Broker {} is alive, subscription {}",
                    record.id(),
                    registry.notifier().state()
                );
            }
            changed = session.changed() => {
                let state = *session.borrow_and_update();
                if changed.is_err() || state != SessionState::Connected {
                    error!(
                        "Coordination session is {}, broker {} is no longer registered",
                        state,
                        record.id()
                    );
                    anyhow::bail!("coordination session {}", state);
                }
            }
        }
    }
}
