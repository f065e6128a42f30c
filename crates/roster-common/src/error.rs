//! Error types for the common crate

/// Failure to turn an entry payload into a `BrokerRecord` or back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed broker record: {0}")]
    Malformed(String),

    #[error("failed to encode broker record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failure to load or validate configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
