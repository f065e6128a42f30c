//! Roster Common - shared types for the broker membership registry
//!
//! This crate provides:
//! - `BrokerId`, `BrokerRecord` and `MembershipSnapshot` model types
//! - The registry path namespace (`/brokers/ids/<id>`)
//! - The broker record codec stored as each entry's payload
//! - Layered configuration loading

pub mod codec;
pub mod config;
pub mod error;
pub mod model;

pub use codec::{decode, encode};
pub use config::{BackendKind, CoordinatorConfig, LoggingSettings, MembershipConfig, RosterConfig};
pub use error::{CodecError, ConfigError};
pub use model::{BROKER_IDS_PATH, BROKERS_PATH, BrokerId, BrokerRecord, MembershipSnapshot};
