//! Broker record codec
//!
//! The payload stored at `/brokers/ids/<id>` is a JSON object:
//!
//! ```json
//! {"id":1,"host":"10.0.0.1","port":9093}
//! ```
//!
//! Decoding ignores fields it does not know, so newer writers can attach
//! extra metadata without breaking older readers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::model::{BrokerId, BrokerRecord};

/// On-the-wire shape. Numbers are read wide so out-of-range values are
/// reported as malformed instead of as a generic type error.
#[derive(Serialize, Deserialize)]
struct WireRecord {
    id: i64,
    host: String,
    port: i64,
}

/// Serialize a record into an entry payload.
///
/// Refuses records `decode` would reject, so nothing unreadable is written.
pub fn encode(record: &BrokerRecord) -> Result<Bytes, CodecError> {
    record.validate()?;
    let wire = WireRecord {
        id: i64::from(record.id().get()),
        host: record.host().to_string(),
        port: i64::from(record.port()),
    };
    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

/// Parse an entry payload.
pub fn decode(payload: &[u8]) -> Result<BrokerRecord, CodecError> {
    let wire: WireRecord =
        serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let id = u32::try_from(wire.id)
        .ok()
        .and_then(BrokerId::new)
        .ok_or_else(|| CodecError::Malformed(format!("invalid broker id {}", wire.id)))?;

    let port = u16::try_from(wire.port)
        .map_err(|_| CodecError::Malformed(format!("port {} out of range", wire.port)))?;

    BrokerRecord::try_new(id, wire.host, port)
}
