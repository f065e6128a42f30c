//! Roster Registry - broker cluster membership
//!
//! This crate provides:
//! - `MembershipRegistry`: register, deregister, look up and scan brokers
//! - `ChangeNotifier`: ordered, de-duplicated membership snapshots delivered
//!   to listeners, with the one-shot watch re-armed after every delivery
//! - `MembershipListener` and its closure and logging adapters

pub mod error;
pub mod listener;
pub mod notifier;
pub mod registry;

pub use error::{RegistryError, Result};
pub use listener::{FnMembershipListener, LoggingMembershipListener, MembershipListener};
pub use notifier::{ChangeNotifier, SubscriptionHandle, SubscriptionState};
pub use registry::MembershipRegistry;
