use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use roster_common::BrokerId;

/// First broker port; broker `n` listens on `BASE_PORT + n` unless told otherwise.
const BASE_PORT: u32 = 9092;

#[derive(Debug, Parser)]
#[command(name = "roster-broker", version, about = "Register a broker and follow cluster membership")]
pub struct Cli {
    /// Coordination service address, e.g. 127.0.0.1:8500
    pub coordinator_address: String,

    /// Id of this broker, a positive integer unique in the cluster
    pub broker_id: BrokerId,

    /// Configuration file (TOML or YAML)
    #[arg(short = 'c', long = "config", env = "ROSTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Advertised host, defaults to the first non-loopback interface address
    #[arg(long = "host")]
    pub host: Option<String>,

    /// Advertised port, defaults to 9092 + broker id
    #[arg(long = "port")]
    pub port: Option<u16>,

    /// Coordination backend: consul or memory
    #[arg(long = "backend")]
    pub backend: Option<String>,

    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

impl Cli {
    /// Settings given on the command line, applied over file and environment.
    pub fn overrides(&self) -> Vec<(String, String)> {
        let mut overrides = vec![(
            "coordinator.address".to_string(),
            self.coordinator_address.clone(),
        )];
        if let Some(backend) = &self.backend {
            overrides.push(("coordinator.backend".to_string(), backend.clone()));
        }
        if let Some(level) = &self.log_level {
            overrides.push(("logging.level".to_string(), level.clone()));
        }
        overrides
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        match self.port {
            Some(port) => Ok(port),
            None => BASE_PORT
                .checked_add(self.broker_id.get())
                .and_then(|port| u16::try_from(port).ok())
                .with_context(|| {
                    format!(
                        "no default port for broker {}, pass --port",
                        self.broker_id
                    )
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let cli = Cli::parse_from(["roster-broker", "127.0.0.1:8500", "3"]);
        assert_eq!(cli.coordinator_address, "127.0.0.1:8500");
        assert_eq!(cli.broker_id.get(), 3);
        assert_eq!(cli.port().unwrap(), 9095);
        assert_eq!(
            cli.overrides(),
            vec![(
                "coordinator.address".to_string(),
                "127.0.0.1:8500".to_string()
            )]
        );
    }

    #[test]
    fn test_explicit_options() {
        let cli = Cli::parse_from([
            "roster-broker",
            "consul:8500",
            "1",
            "--host",
            "10.0.0.1",
            "--port",
            "19093",
            "--backend",
            "memory",
        ]);
        assert_eq!(cli.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(cli.port().unwrap(), 19093);
        assert!(
            cli.overrides()
                .contains(&("coordinator.backend".to_string(), "memory".to_string()))
        );
    }

    #[test]
    fn test_invalid_broker_id_is_rejected() {
        assert!(Cli::try_parse_from(["roster-broker", "127.0.0.1:8500", "0"]).is_err());
        assert!(Cli::try_parse_from(["roster-broker", "127.0.0.1:8500", "abc"]).is_err());
    }

    #[test]
    fn test_large_id_needs_explicit_port() {
        let cli = Cli::parse_from(["roster-broker", "127.0.0.1:8500", "70000"]);
        assert!(cli.port().is_err());
    }
}
