//! JSON codec for crawler messages
//!
//! Encoded payloads are JSON objects carrying the message fields plus two
//! envelope fields:
//!
//! - `messageKind`: which of the three kinds the payload holds
//! - `schemaVersion`: layout version of the payload
//!
//! Payloads without envelope fields are accepted as version 1 of the
//! expected kind, so messages written by older producers still decode.

use serde_json::{Map, Value};

use crate::error::{DecodeError, EncodeError};
use crate::message::types::CrawlMessage;

/// Current payload schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Envelope field naming the message kind
pub const KIND_FIELD: &str = "messageKind";

/// Envelope field holding the schema version
pub const VERSION_FIELD: &str = "schemaVersion";

/// Encode a message to its text wire format
pub fn encode<M: CrawlMessage>(message: &M) -> Result<String, EncodeError> {
    let encode_err = |reason: String| EncodeError {
        kind: M::KIND.to_string(),
        reason,
    };

    let mut object = match serde_json::to_value(message).map_err(|e| encode_err(e.to_string()))? {
        Value::Object(object) => object,
        other => return Err(encode_err(format!("expected an object, got {}", json_type(&other)))),
    };

    object.insert(KIND_FIELD.to_string(), Value::from(M::KIND.as_str()));
    object.insert(VERSION_FIELD.to_string(), Value::from(SCHEMA_VERSION));

    serde_json::to_string(&object).map_err(|e| encode_err(e.to_string()))
}

/// Decode text into a message of the expected kind
pub fn decode<M: CrawlMessage>(text: &str) -> Result<M, DecodeError> {
    let kind = M::KIND;
    let malformed = |reason: String| DecodeError::Malformed {
        kind: kind.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    let mut object = match value {
        Value::Object(object) => object,
        other => return Err(malformed(format!("expected an object, got {}", json_type(&other)))),
    };

    check_envelope::<M>(&mut object)?;

    serde_json::from_value(Value::Object(object)).map_err(|e| malformed(e.to_string()))
}

/// Validate and strip the envelope fields
fn check_envelope<M: CrawlMessage>(object: &mut Map<String, Value>) -> Result<(), DecodeError> {
    let kind = M::KIND;

    match object.remove(KIND_FIELD) {
        None => {}
        Some(Value::String(found)) if found == kind.as_str() => {}
        Some(Value::String(found)) => {
            return Err(DecodeError::KindMismatch {
                expected: kind.to_string(),
                found,
            });
        }
        Some(other) => {
            return Err(DecodeError::Malformed {
                kind: kind.to_string(),
                reason: format!("{} must be a string, got {}", KIND_FIELD, json_type(&other)),
            });
        }
    }

    match object.remove(VERSION_FIELD) {
        None => Ok(()),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v <= SCHEMA_VERSION as u64 => Ok(()),
            Some(v) => Err(DecodeError::UnsupportedVersion {
                kind: kind.to_string(),
                found: v,
                supported: SCHEMA_VERSION,
            }),
            None => Err(DecodeError::Malformed {
                kind: kind.to_string(),
                reason: format!("{} must be a non-negative integer, got {}", VERSION_FIELD, n),
            }),
        },
        Some(other) => Err(DecodeError::Malformed {
            kind: kind.to_string(),
            reason: format!("{} must be a number, got {}", VERSION_FIELD, json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::{CollectionInventoryMessage, DirectoryWorkItem, ProductMessage};

    fn sample_dir() -> DirectoryWorkItem {
        DirectoryWorkItem::root("job-7", "PDS_GEO", "/archive/mars").child("/archive/mars/bundle_a")
    }

    #[test]
    fn test_roundtrip_each_kind() {
        let dir = sample_dir();
        assert_eq!(decode::<DirectoryWorkItem>(&encode(&dir).unwrap()).unwrap(), dir);

        let product = ProductMessage::from_item(&dir, "/archive/mars/bundle_a/label.xml");
        assert_eq!(decode::<ProductMessage>(&encode(&product).unwrap()).unwrap(), product);

        let inventory =
            CollectionInventoryMessage::from_item(&dir, "/archive/mars/bundle_a/collection_data.csv");
        assert_eq!(
            decode::<CollectionInventoryMessage>(&encode(&inventory).unwrap()).unwrap(),
            inventory
        );
    }

    #[test]
    fn test_encoded_payload_is_self_describing() {
        let text = encode(&sample_dir()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[KIND_FIELD], "directory");
        assert_eq!(value[VERSION_FIELD], SCHEMA_VERSION);
        assert_eq!(value["jobId"], "job-7");
        assert_eq!(value["parentDir"], "/archive/mars");
    }

    #[test]
    fn test_decode_legacy_payload_without_envelope() {
        let text = r#"{"jobId":"j","nodeName":"n","dir":"/d","rootDir":"/d","depth":0}"#;
        let item: DirectoryWorkItem = decode(text).unwrap();
        assert_eq!(item.dir, "/d");
        assert!(item.parent_dir.is_none());
        assert!(!item.overwrite);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for text in ["", "not json", "[1,2]", "{\"jobId\":\"j\"}", "{\"jobId\":1,\"nodeName\":\"n\",\"dir\":\"/d\",\"rootDir\":\"/d\",\"depth\":0}"] {
            let err = decode::<DirectoryWorkItem>(text).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed { .. }), "{text}: {err}");
        }
    }

    #[test]
    fn test_decode_rejects_other_kind() {
        let dir = sample_dir();
        let product = ProductMessage::from_item(&dir, "/x.xml");
        let err = decode::<DirectoryWorkItem>(&encode(&product).unwrap()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::KindMismatch {
                expected: "directory".into(),
                found: "product".into(),
            }
        );
    }

    #[test]
    fn test_decode_rejects_newer_schema() {
        let text = r#"{"messageKind":"product","schemaVersion":2,"jobId":"j","nodeName":"n","file":"/f","dir":"/"}"#;
        let err = decode::<ProductMessage>(text).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion { found: 2, .. }));
    }
}
