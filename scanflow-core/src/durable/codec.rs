//! Versioned envelope for every value that crosses a workflow boundary.
//!
//! Inputs, outputs, step results and signal payloads are persisted and may be
//! read back by a different process (or a newer build) after a crash, so they
//! are wrapped as `{"version": N, "data": ...}` and checked on the way out.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{Result, ScanflowError};

pub const PAYLOAD_VERSION: u16 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    version: u16,
    data: &'a T,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    version: u16,
    data: Value,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(EnvelopeRef {
        version: PAYLOAD_VERSION,
        data: value,
    })?)
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    let envelope: Envelope = serde_json::from_value(value)?;
    if envelope.version != PAYLOAD_VERSION {
        return Err(ScanflowError::UnsupportedVersion {
            found: envelope.version,
            expected: PAYLOAD_VERSION,
        });
    }
    Ok(serde_json::from_value(envelope.data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_rejects_future_versions() {
        let raw = json!({ "version": 7, "data": 42 });
        let err = decode::<u32>(raw).unwrap_err();
        assert!(matches!(
            err,
            ScanflowError::UnsupportedVersion {
                found: 7,
                expected: PAYLOAD_VERSION
            }
        ));
    }

    #[test]
    fn decode_rejects_bare_payloads() {
        let err = decode::<u32>(json!(42)).unwrap_err();
        assert!(matches!(err, ScanflowError::Serialization(_)));
    }

    #[test]
    fn decode_surfaces_schema_mismatch() {
        let encoded = encode(&"not a number").unwrap();
        assert!(decode::<u32>(encoded).is_err());
    }
}
