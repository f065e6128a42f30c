//! Roster Coord - coordination service adapter
//!
//! This crate provides:
//! - The `CoordinationBackend` contract: sessions, ephemeral nodes and
//!   one-shot children watches
//! - `CoordinationClient`, which adds retry, timeouts and owner checks
//! - A Consul backend (sessions + KV) and an in-process backend

pub mod backend;
pub mod client;
pub mod consul;
pub mod error;
pub mod memory;
pub mod retry;

pub use backend::{
    Children, CoordinationBackend, Connector, CreateMode, NodeData, SessionState, WatchCallback,
    WatchEvent, WatchEventKind,
};
pub use client::{ClientOptions, CoordinationClient, Created};
pub use consul::{ConsulConnector, ConsulSession};
pub use error::{CoordError, Result};
pub use memory::{MemoryCoordinator, MemorySession};
pub use retry::RetryPolicy;
