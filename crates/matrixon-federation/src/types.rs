// =============================================================================
// Matrixon Federation - Types Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the data model of the PDU loading pipeline: parsed
// events, version-headered events, resolved room state and the per-event
// validation outcome handed back to callers.
//
// =============================================================================

use std::{collections::BTreeMap, ops::Deref};

use ruma::{
    CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedEventId, OwnedRoomId, OwnedUserId,
    RoomId, RoomVersionId, UserId,
};

use crate::error::{EventError, ParseError};

/// Untrusted PDU bytes exactly as received from a remote server
pub type RawMessage = Vec<u8>;

/// `(event type, state key)` pair identifying a piece of room state
pub type StateKey = (String, String);

/// Whether `room_version` carries event IDs inside the event JSON
pub(crate) fn has_embedded_event_id(room_version: &RoomVersionId) -> bool {
    matches!(room_version, RoomVersionId::V1 | RoomVersionId::V2)
}

/// Whether `room_version` supports restricted joins authorised by another user
pub(crate) fn supports_restricted_joins(room_version: &RoomVersionId) -> bool {
    !matches!(
        room_version,
        RoomVersionId::V1
            | RoomVersionId::V2
            | RoomVersionId::V3
            | RoomVersionId::V4
            | RoomVersionId::V5
            | RoomVersionId::V6
            | RoomVersionId::V7
    )
}

/// A structurally valid PDU. Immutable once built.
#[derive(Clone, Debug)]
pub struct Pdu {
    event_id: OwnedEventId,
    room_id: OwnedRoomId,
    sender: OwnedUserId,
    kind: String,
    state_key: Option<String>,
    auth_events: Vec<OwnedEventId>,
    prev_events: Vec<OwnedEventId>,
    content_hash: Option<String>,
    redacted: bool,
    json: CanonicalJsonObject,
}

impl Pdu {
    /// Builds a PDU from its canonical JSON form.
    ///
    /// `json` must already be in whichever form (full or redacted) later
    /// checks should see; `redacted` records which one it is.
    pub fn from_canonical_json(
        event_id: OwnedEventId,
        json: CanonicalJsonObject,
        room_version: &RoomVersionId,
        redacted: bool,
    ) -> Result<Self, ParseError> {
        let kind = required_str(&json, "type")?.to_owned();
        let room_id = RoomId::parse(required_str(&json, "room_id")?)
            .map_err(|e| ParseError::invalid("room_id", e.to_string()))?;
        let sender = UserId::parse(required_str(&json, "sender")?)
            .map_err(|e| ParseError::invalid("sender", e.to_string()))?;

        let state_key = match json.get("state_key") {
            None => None,
            Some(CanonicalJsonValue::String(key)) => Some(key.clone()),
            Some(_) => return Err(ParseError::invalid("state_key", "must be a string")),
        };

        let auth_events = references(&json, "auth_events", room_version)?;
        let prev_events = references(&json, "prev_events", room_version)?;

        let content_hash = match json.get("hashes") {
            None => None,
            Some(CanonicalJsonValue::Object(hashes)) => match hashes.get("sha256") {
                None => None,
                Some(CanonicalJsonValue::String(hash)) => Some(hash.clone()),
                Some(_) => return Err(ParseError::invalid("hashes", "sha256 must be a string")),
            },
            Some(_) => return Err(ParseError::invalid("hashes", "must be an object")),
        };

        Ok(Self {
            event_id,
            room_id,
            sender,
            kind,
            state_key,
            auth_events,
            prev_events,
            content_hash,
            redacted,
            json,
        })
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    /// The event type, e.g. `m.room.member`
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The `(type, state_key)` slot this event occupies in room state
    pub fn state_slot(&self) -> Option<StateKey> {
        self.state_key
            .as_ref()
            .map(|key| (self.kind.clone(), key.clone()))
    }

    pub fn auth_events(&self) -> &[OwnedEventId] {
        &self.auth_events
    }

    pub fn prev_events(&self) -> &[OwnedEventId] {
        &self.prev_events
    }

    /// The `hashes.sha256` value the sender declared
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// True when the content hash did not match and the event was redacted
    pub fn is_redacted(&self) -> bool {
        self.redacted
    }

    pub fn content(&self) -> Option<&CanonicalJsonObject> {
        match self.json.get("content") {
            Some(CanonicalJsonValue::Object(content)) => Some(content),
            _ => None,
        }
    }

    pub fn content_str(&self, key: &str) -> Option<&str> {
        match self.content()?.get(key) {
            Some(CanonicalJsonValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn signatures(&self) -> Option<&CanonicalJsonValue> {
        self.json.get("signatures")
    }

    /// The canonical JSON object later checks operate on
    pub fn as_canonical_json(&self) -> &CanonicalJsonObject {
        &self.json
    }
}

fn required_str<'a>(json: &'a CanonicalJsonObject, field: &'static str) -> Result<&'a str, ParseError> {
    match json.get(field) {
        Some(CanonicalJsonValue::String(value)) => Ok(value.as_str()),
        Some(_) => Err(ParseError::invalid(field, "must be a string")),
        None => Err(ParseError::MissingField(field)),
    }
}

/// Reads `auth_events` / `prev_events`. Room versions 1 and 2 reference
/// events as `[event_id, hashes]` pairs, later versions as bare IDs.
fn references(
    json: &CanonicalJsonObject,
    field: &'static str,
    room_version: &RoomVersionId,
) -> Result<Vec<OwnedEventId>, ParseError> {
    let entries = match json.get(field) {
        None => return Ok(Vec::new()),
        Some(CanonicalJsonValue::Array(entries)) => entries,
        Some(_) => return Err(ParseError::invalid(field, "must be an array")),
    };

    entries
        .iter()
        .map(|entry| {
            let id = match (entry, has_embedded_event_id(room_version)) {
                (CanonicalJsonValue::Array(pair), true) => match pair.first() {
                    Some(CanonicalJsonValue::String(id)) => id,
                    _ => return Err(ParseError::invalid(field, "malformed event reference")),
                },
                (CanonicalJsonValue::String(id), false) => id,
                _ => return Err(ParseError::invalid(field, "malformed event reference")),
            };
            EventId::parse(id).map_err(|e| ParseError::invalid(field, e.to_string()))
        })
        .collect()
}

/// A PDU paired with the room version whose rules apply to it
#[derive(Clone, Debug)]
pub struct HeaderedEvent {
    room_version: RoomVersionId,
    event: Pdu,
}

impl HeaderedEvent {
    pub fn new(event: Pdu, room_version: RoomVersionId) -> Self {
        Self {
            room_version,
            event,
        }
    }

    pub fn room_version(&self) -> &RoomVersionId {
        &self.room_version
    }

    pub fn event(&self) -> &Pdu {
        &self.event
    }

    pub fn into_event(self) -> Pdu {
        self.event
    }
}

impl Deref for HeaderedEvent {
    type Target = Pdu;

    fn deref(&self) -> &Pdu {
        &self.event
    }
}

/// Resolved, deduplicated room state keyed by `(type, state_key)`
#[derive(Clone, Debug, Default)]
pub struct RoomState {
    events: BTreeMap<StateKey, Pdu>,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a state event, replacing whatever held its slot.
    /// Non-state events are ignored and returned back.
    pub fn insert(&mut self, event: Pdu) -> Option<Pdu> {
        match event.state_slot() {
            Some(slot) => {
                self.events.insert(slot, event);
                None
            }
            None => Some(event),
        }
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&Pdu> {
        self.events
            .get(&(event_type.to_owned(), state_key.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &Pdu)> {
        self.events.iter()
    }

    /// Keeps only the given slots
    pub fn select<'a>(&self, slots: impl IntoIterator<Item = &'a StateKey>) -> RoomState {
        let mut selected = RoomState::new();
        for slot in slots {
            if let Some(event) = self.events.get(slot) {
                selected.events.insert(slot.clone(), event.clone());
            }
        }
        selected
    }
}

impl FromIterator<Pdu> for RoomState {
    fn from_iter<I: IntoIterator<Item = Pdu>>(iter: I) -> Self {
        let mut state = RoomState::new();
        for event in iter {
            state.insert(event);
        }
        state
    }
}

/// Result of loading one untrusted PDU, positionally aligned with the input
#[derive(Debug)]
pub enum ValidationOutcome {
    /// Passed every check
    Accepted(HeaderedEvent),
    /// Passed every strict check but is not authorized by current room state
    SoftFailed(HeaderedEvent),
    /// Rejected; holds the first failing stage's reason
    Rejected(EventError),
}

impl ValidationOutcome {
    pub fn event(&self) -> Option<&HeaderedEvent> {
        match self {
            Self::Accepted(event) | Self::SoftFailed(event) => Some(event),
            Self::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&EventError> {
        match self {
            Self::Rejected(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    pub fn is_soft_failed(&self) -> bool {
        matches!(self, Self::SoftFailed(_))
    }
}
