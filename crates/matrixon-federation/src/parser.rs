// =============================================================================
// Matrixon Federation - Parser Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Turns untrusted PDU bytes into `Pdu` values. This covers checks 1 and 3
// of receipt-time validation: the event must be valid, and an event whose
// content hash does not match is redacted before it is processed further.
//
// =============================================================================

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ruma::{CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedEventId, RoomVersionId};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::{
    config::LoaderConfig,
    error::ParseError,
    traits::EventParser,
    types::{has_embedded_event_id, Pdu},
};

/// Largest PDU the federation API allows, in bytes
pub const MAX_PDU_SIZE: usize = 65_536;

/// Keys excluded from the content hash
const CONTENT_HASH_EXCLUDED_KEYS: [&str; 3] = ["unsigned", "signatures", "hashes"];

/// Computes the unpadded base64 SHA-256 content hash of an event
pub fn content_hash(json: &CanonicalJsonObject) -> Result<String, ParseError> {
    let mut stripped = json.clone();
    for key in CONTENT_HASH_EXCLUDED_KEYS {
        stripped.remove(key);
    }

    let canonical = serde_json::to_vec(&stripped)?;
    Ok(STANDARD_NO_PAD.encode(Sha256::digest(&canonical)))
}

fn declared_hash(json: &CanonicalJsonObject) -> Option<&str> {
    match json.get("hashes") {
        Some(CanonicalJsonValue::Object(hashes)) => match hashes.get("sha256") {
            Some(CanonicalJsonValue::String(hash)) => Some(hash.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Derives the event ID. Room versions 1 and 2 carry it in the JSON, later
/// versions use the reference hash, which is computed over the redacted
/// form and therefore identical for full and redacted copies.
fn event_id_for(
    json: &mut CanonicalJsonObject,
    room_version: &RoomVersionId,
) -> Result<OwnedEventId, ParseError> {
    if has_embedded_event_id(room_version) {
        return match json.get("event_id") {
            Some(CanonicalJsonValue::String(id)) => {
                EventId::parse(id).map_err(|e| ParseError::invalid("event_id", e.to_string()))
            }
            Some(_) => Err(ParseError::invalid("event_id", "must be a string")),
            None => Err(ParseError::MissingField("event_id")),
        };
    }

    json.remove("event_id");
    let hash = ruma::signatures::reference_hash(json, room_version)
        .map_err(|e| ParseError::EventId(e.to_string()))?;
    EventId::parse(format!("${hash}")).map_err(|e| ParseError::EventId(e.to_string()))
}

/// Canonical-JSON parser and redactor for federation PDUs
#[derive(Debug, Clone)]
pub struct CanonicalJsonParser {
    max_event_size: usize,
    max_auth_events: usize,
    max_prev_events: usize,
}

impl Default for CanonicalJsonParser {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

impl CanonicalJsonParser {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_event_size: config.max_event_size,
            max_auth_events: config.max_auth_events,
            max_prev_events: config.max_prev_events,
        }
    }
}

impl EventParser for CanonicalJsonParser {
    fn parse(&self, raw: &[u8], room_version: &RoomVersionId) -> Result<Pdu, ParseError> {
        if raw.len() > self.max_event_size {
            return Err(ParseError::TooLarge {
                size: raw.len(),
                max: self.max_event_size,
            });
        }

        let mut json: CanonicalJsonObject = serde_json::from_slice(raw)?;
        json.remove("unsigned");

        match json.get("type") {
            Some(CanonicalJsonValue::String(_)) => {}
            Some(_) => return Err(ParseError::invalid("type", "must be a string")),
            None => return Err(ParseError::MissingField("type")),
        }

        let event_id = event_id_for(&mut json, room_version)?;

        let computed = content_hash(&json)?;
        let redacted = declared_hash(&json) != Some(computed.as_str());
        if redacted {
            warn!("⚠️ Calculated hash does not match for {}, redacting", event_id);
            json = ruma::canonical_json::redact(json, room_version, None)
                .map_err(|e| ParseError::Redaction(e.to_string()))?;
        }

        let pdu = Pdu::from_canonical_json(event_id, json, room_version, redacted)?;

        if pdu.auth_events().len() > self.max_auth_events {
            return Err(ParseError::TooManyReferences {
                field: "auth_events",
                count: pdu.auth_events().len(),
                max: self.max_auth_events,
            });
        }
        if pdu.prev_events().len() > self.max_prev_events {
            return Err(ParseError::TooManyReferences {
                field: "prev_events",
                count: pdu.prev_events().len(),
                max: self.max_prev_events,
            });
        }

        trace!(event_id = %pdu.event_id(), redacted, "Parsed PDU");
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn hashed(value: serde_json::Value) -> CanonicalJsonObject {
        let mut json: CanonicalJsonObject = serde_json::from_value(value).unwrap();
        let hash = content_hash(&json).unwrap();
        json.insert(
            "hashes".to_owned(),
            CanonicalJsonValue::Object([("sha256".to_owned(), CanonicalJsonValue::String(hash))].into()),
        );
        json
    }

    fn message() -> CanonicalJsonObject {
        hashed(json!({
            "type": "m.room.message",
            "room_id": "!room:example.com",
            "sender": "@alice:example.com",
            "content": { "msgtype": "m.text", "body": "hello" },
            "auth_events": [],
            "prev_events": [],
            "depth": 4,
            "origin_server_ts": 1_700_000_000_000_u64,
        }))
    }

    fn bytes(json: &CanonicalJsonObject) -> Vec<u8> {
        serde_json::to_vec(json).unwrap()
    }

    #[test]
    fn test_valid_event_is_not_redacted() {
        let parser = CanonicalJsonParser::default();
        let pdu = parser.parse(&bytes(&message()), &RoomVersionId::V10).unwrap();

        assert!(!pdu.is_redacted());
        assert!(pdu.event_id().as_str().starts_with('$'));
        assert_eq!(pdu.content_str("body"), Some("hello"));
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let parser = CanonicalJsonParser::default();
        let raw = bytes(&message());
        let first = parser.parse(&raw, &RoomVersionId::V10).unwrap();
        let second = parser.parse(&raw, &RoomVersionId::V10).unwrap();
        assert_eq!(first.event_id(), second.event_id());
    }

    #[test]
    fn test_hash_mismatch_redacts() {
        let parser = CanonicalJsonParser::default();
        let original = parser.parse(&bytes(&message()), &RoomVersionId::V10).unwrap();

        let mut tampered = message();
        tampered.insert(
            "content".to_owned(),
            serde_json::from_value(json!({ "msgtype": "m.text", "body": "tampered" })).unwrap(),
        );
        let pdu = parser.parse(&bytes(&tampered), &RoomVersionId::V10).unwrap();

        assert!(pdu.is_redacted());
        assert_eq!(pdu.content_str("body"), None);
        assert_eq!(pdu.event_id(), original.event_id());
    }

    #[test]
    fn test_missing_hash_redacts() {
        let parser = CanonicalJsonParser::default();
        let mut json = message();
        json.remove("hashes");
        let pdu = parser.parse(&bytes(&json), &RoomVersionId::V10).unwrap();
        assert!(pdu.is_redacted());
    }

    #[test]
    fn test_unsigned_is_ignored() {
        let parser = CanonicalJsonParser::default();
        let mut json = message();
        json.insert(
            "unsigned".to_owned(),
            serde_json::from_value(json!({ "age": 5 })).unwrap(),
        );
        let pdu = parser.parse(&bytes(&json), &RoomVersionId::V10).unwrap();

        assert!(!pdu.is_redacted());
        assert!(pdu.as_canonical_json().get("unsigned").is_none());
    }

    #[test]
    fn test_too_large() {
        let parser = CanonicalJsonParser::from_config(&LoaderConfig {
            max_event_size: 16,
            ..LoaderConfig::default()
        });
        let err = parser.parse(&bytes(&message()), &RoomVersionId::V10).unwrap_err();
        assert!(matches!(err, ParseError::TooLarge { max: 16, .. }));
    }

    #[test]
    fn test_not_json() {
        let parser = CanonicalJsonParser::default();
        let err = parser.parse(b"not json", &RoomVersionId::V10).unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }

    #[test]
    fn test_floats_are_rejected() {
        let parser = CanonicalJsonParser::default();
        let raw = br#"{"type":"m.room.message","room_id":"!r:example.com","sender":"@a:example.com","depth":1.5}"#;
        let err = parser.parse(raw, &RoomVersionId::V10).unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }

    #[test]
    fn test_missing_type() {
        let parser = CanonicalJsonParser::default();
        let mut json = message();
        json.remove("type");
        let err = parser.parse(&bytes(&json), &RoomVersionId::V10).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("type")));
    }

    #[test]
    fn test_too_many_prev_events() {
        let parser = CanonicalJsonParser::default();
        let prev: Vec<String> = (0..21).map(|i| format!("$prev{i}")).collect();
        let mut json = message();
        json.insert("prev_events".to_owned(), serde_json::from_value(json!(prev)).unwrap());
        let json = hashed(serde_json::to_value(&json).unwrap());

        let err = parser.parse(&bytes(&json), &RoomVersionId::V10).unwrap_err();
        assert!(matches!(
            err,
            ParseError::TooManyReferences { field: "prev_events", count: 21, max: 20 }
        ));
    }

    #[test]
    fn test_v1_requires_embedded_event_id() {
        let parser = CanonicalJsonParser::default();
        let err = parser.parse(&bytes(&message()), &RoomVersionId::V1).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("event_id")));

        let json = hashed(json!({
            "event_id": "$abc:example.com",
            "type": "m.room.message",
            "room_id": "!room:example.com",
            "sender": "@alice:example.com",
            "content": { "body": "hi" },
            "auth_events": [],
            "prev_events": [],
            "depth": 1,
            "origin_server_ts": 1,
        }));
        let pdu = parser.parse(&bytes(&json), &RoomVersionId::V1).unwrap();
        assert_eq!(pdu.event_id().as_str(), "$abc:example.com");
        assert!(!pdu.is_redacted());
    }
}
