//! Property tests for the broker record codec.

use proptest::prelude::*;
use roster_common::{BrokerId, BrokerRecord, decode, encode};

fn host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9-]{0,20}(\\.[a-z][a-z0-9-]{0,10}){0,3}",
        (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>())
            .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
    ]
}

fn record_strategy() -> impl Strategy<Value = BrokerRecord> {
    (1u32..=u32::MAX, host_strategy(), any::<u16>()).prop_map(|(id, host, port)| {
        BrokerRecord::new(BrokerId::new(id).expect("non-zero"), host, port)
    })
}

/// Hosts at the validity boundary: empty, whitespace only, or padded.
fn edge_host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[ \t]{0,4}",
        "[ \t]{0,2}[a-z0-9.]{1,8}[ \t]{0,2}",
    ]
}

proptest! {
    #[test]
    fn decode_inverts_encode(record in record_strategy()) {
        let payload = encode(&record).unwrap();
        prop_assert_eq!(decode(&payload).unwrap(), record);
    }

    #[test]
    fn encodable_records_always_decode(
        id in 1u32..=u32::MAX,
        host in edge_host_strategy(),
        port in any::<u16>(),
    ) {
        let record = BrokerRecord::new(BrokerId::new(id).expect("non-zero"), host.clone(), port);
        match encode(&record) {
            Ok(payload) => {
                prop_assert!(BrokerRecord::try_new(record.id(), host, port).is_ok());
                prop_assert_eq!(decode(&payload).unwrap(), record);
            }
            Err(_) => {
                prop_assert!(host.trim().is_empty());
                prop_assert!(BrokerRecord::try_new(record.id(), host, port).is_err());
            }
        }
    }

    #[test]
    fn extra_fields_do_not_change_known_fields(
        record in record_strategy(),
        extra_key in "[a-z_]{1,12}",
        extra_value in any::<i64>(),
    ) {
        prop_assume!(!["id", "host", "port"].contains(&extra_key.as_str()));

        let minimal = encode(&record).unwrap();
        let mut object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&minimal).unwrap();
        object.insert(extra_key, serde_json::Value::from(extra_value));
        object.insert("tags".to_string(), serde_json::json!({"rack": "r1"}));
        let extended = serde_json::to_vec(&object).unwrap();

        prop_assert_eq!(decode(&extended).unwrap(), decode(&minimal).unwrap());
    }
}
