//! Format-versioned persisted records
//!
//! Every record is written inside an envelope carrying its format version.
//! On load, older versions pass through a forward-only migration chain;
//! versions newer than this build are passed through unchanged. Payloads
//! without an envelope are treated as version 1.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Format version written by this build
pub const CURRENT_FORMAT_VERSION: u32 = 2;

/// Kinds of persisted records, each with its own migration chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    History,
    Calibration,
    EnsembleWeights,
    Fingerprint,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    payload: Value,
}

/// Serialize `value` inside a current-version envelope
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let envelope = Envelope {
        format_version: CURRENT_FORMAT_VERSION,
        payload: serde_json::to_value(value).context("Failed to serialize record")?,
    };
    serde_json::to_vec(&envelope).context("Failed to serialize record envelope")
}

/// Parse, migrate and deserialize a record
pub fn decode<T: DeserializeOwned>(bytes: &[u8], kind: RecordKind) -> Result<T> {
    let raw: Value = serde_json::from_slice(bytes).context("Record is not valid JSON")?;
    let (version, payload) = split_envelope(raw);
    let migrated = migrate(kind, version, payload);
    serde_json::from_value(migrated)
        .with_context(|| format!("Record does not match {:?} schema (version {})", kind, version))
}

fn split_envelope(raw: Value) -> (u32, Value) {
    if let Value::Object(ref map) = raw {
        if let (Some(version), Some(_)) = (map.get("format_version"), map.get("payload")) {
            if let Some(version) = version.as_u64() {
                if let Ok(envelope) = serde_json::from_value::<Envelope>(raw.clone()) {
                    return (version.min(u32::MAX as u64) as u32, envelope.payload);
                }
            }
        }
    }
    (1, raw)
}

/// Run migrations from `version` up to the current version
pub fn migrate(kind: RecordKind, mut version: u32, mut payload: Value) -> Value {
    while version < CURRENT_FORMAT_VERSION {
        payload = match (kind, version) {
            (RecordKind::History, 1) => history_v1_to_v2(payload),
            _ => payload,
        };
        version += 1;
    }
    payload
}

/// Version 1 history records predate streaming, adaptive chunking and
/// cross-machine transfer.
fn history_v1_to_v2(payload: Value) -> Value {
    let Value::Object(mut map) = payload else {
        return payload;
    };
    insert_missing(&mut map, "streaming", Value::Null);
    insert_missing(&mut map, "adaptive", Value::Null);
    insert_missing(&mut map, "fingerprint", Value::Null);
    insert_missing(&mut map, "trust_weight", Value::from(1.0));
    Value::Object(map)
}

fn insert_missing(map: &mut Map<String, Value>, key: &str, value: Value) {
    map.entry(key.to_string()).or_insert(value);
}
