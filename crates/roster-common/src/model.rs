//! Broker membership model
//!
//! A broker announces itself with a `BrokerRecord` stored under
//! `/brokers/ids/<id>`. The set of child names under `/brokers/ids` at any
//! observed instant is a `MembershipSnapshot`.

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CodecError;

/// Root of the broker namespace
pub const BROKERS_PATH: &str = "/brokers";

/// Parent path of all broker registry entries
pub const BROKER_IDS_PATH: &str = "/brokers/ids";

/// Operator-assigned broker identity, unique per cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BrokerId(NonZeroU32);

/// Rejected broker id value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidBrokerId(pub String);

impl fmt::Display for InvalidBrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid broker id '{}': must be a positive integer", self.0)
    }
}

impl std::error::Error for InvalidBrokerId {}

impl BrokerId {
    /// Returns `None` for zero.
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Registry entry path for this id, e.g. `/brokers/ids/3`.
    pub fn path(self) -> String {
        format!("{}/{}", BROKER_IDS_PATH, self)
    }
}

impl TryFrom<u32> for BrokerId {
    type Error = InvalidBrokerId;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| InvalidBrokerId(value.to_string()))
    }
}

impl From<BrokerId> for u32 {
    fn from(id: BrokerId) -> Self {
        id.get()
    }
}

impl FromStr for BrokerId {
    type Err = InvalidBrokerId;

    /// Parses a child entry name. Only the canonical decimal form is accepted
    /// so that `03` and `3` can never name the same broker.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s.parse().map_err(|_| InvalidBrokerId(s.to_string()))?;
        let id = Self::try_from(value).map_err(|_| InvalidBrokerId(s.to_string()))?;
        if id.to_string() != s {
            return Err(InvalidBrokerId(s.to_string()));
        }
        Ok(id)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reachability info of one live broker. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerRecord {
    id: BrokerId,
    host: String,
    port: u16,
}

impl BrokerRecord {
    /// Build a record without checking the host. `encode` still refuses a
    /// blank host, so such a record never reaches the registry.
    pub fn new(id: BrokerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// Build a record from untrusted input, rejecting a blank host.
    pub fn try_new(id: BrokerId, host: impl Into<String>, port: u16) -> Result<Self, CodecError> {
        let record = Self::new(id, host, port);
        record.validate()?;
        Ok(record)
    }

    /// Check the fields a reader would reject on decode.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.host.trim().is_empty() {
            return Err(CodecError::Malformed("empty host".to_string()));
        }
        Ok(())
    }

    pub fn id(&self) -> BrokerId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn path(&self) -> String {
        self.id.path()
    }
}

impl fmt::Display for BrokerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker(id={}, host={}, port={})", self.id, self.host, self.port)
    }
}

/// The set of broker ids registered at some observed instant.
///
/// Snapshots are value objects: each change produces a new one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    ids: BTreeSet<BrokerId>,
}

impl MembershipSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw child entry names under `/brokers/ids`.
    ///
    /// Names that are not canonical positive integers are skipped.
    pub fn from_children<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids = BTreeSet::new();
        for child in children {
            let name = child.as_ref();
            match name.parse::<BrokerId>() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!("Ignoring registry entry '{}': {}", name, e),
            }
        }
        Self { ids }
    }

    pub fn contains(&self, id: BrokerId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = BrokerId> + '_ {
        self.ids.iter().copied()
    }

    pub fn ids(&self) -> &BTreeSet<BrokerId> {
        &self.ids
    }

    /// Ids present here but not in `previous`
    pub fn joined_since(&self, previous: &MembershipSnapshot) -> Vec<BrokerId> {
        self.ids.difference(&previous.ids).copied().collect()
    }

    /// Ids present in `previous` but not here
    pub fn left_since(&self, previous: &MembershipSnapshot) -> Vec<BrokerId> {
        previous.ids.difference(&self.ids).copied().collect()
    }
}

impl FromIterator<BrokerId> for MembershipSnapshot {
    fn from_iter<T: IntoIterator<Item = BrokerId>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for MembershipSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "]")
    }
}
