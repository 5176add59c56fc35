// =============================================================================
// Matrixon Federation - Test Utilities
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Builders for well-formed, correctly hashed PDUs used by unit tests.
//
// =============================================================================

#![cfg(any(test, feature = "testing"))]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Once,
};

use ruma::{CanonicalJsonObject, CanonicalJsonValue, OwnedEventId, RoomVersionId};
use serde_json::{json, Value};

use crate::{
    parser::{content_hash, CanonicalJsonParser},
    traits::EventParser,
    types::{HeaderedEvent, Pdu},
};

static INIT: Once = Once::new();
static CLOCK: AtomicU64 = AtomicU64::new(1_700_000_000_000);

pub const ROOM_ID: &str = "!room:example.com";
pub const ALICE: &str = "@alice:example.com";
pub const BOB: &str = "@bob:remote.org";

pub fn init_test_environment() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    });
}

/// Fills in the envelope fields an event needs and adds a matching hash
pub fn hashed_event(mut value: Value) -> CanonicalJsonObject {
    let fields = value.as_object_mut().expect("event must be a JSON object");
    fields.entry("room_id").or_insert_with(|| json!(ROOM_ID));
    fields.entry("content").or_insert_with(|| json!({}));
    fields.entry("auth_events").or_insert_with(|| json!([]));
    fields.entry("prev_events").or_insert_with(|| json!([]));
    fields.entry("depth").or_insert_with(|| json!(1));
    fields
        .entry("origin_server_ts")
        .or_insert_with(|| json!(CLOCK.fetch_add(1, Ordering::SeqCst)));

    let mut object: CanonicalJsonObject = serde_json::from_value(value).expect("canonical JSON");
    let hash = content_hash(&object).expect("hashable event");
    object.insert(
        "hashes".to_owned(),
        CanonicalJsonValue::Object([("sha256".to_owned(), CanonicalJsonValue::String(hash))].into()),
    );
    object
}

pub fn raw_event(value: Value) -> Vec<u8> {
    serde_json::to_vec(&hashed_event(value)).expect("serializable event")
}

pub fn pdu(value: Value) -> Pdu {
    CanonicalJsonParser::default()
        .parse(&raw_event(value), &RoomVersionId::V10)
        .expect("valid test event")
}

pub fn headered(value: Value) -> HeaderedEvent {
    HeaderedEvent::new(pdu(value), RoomVersionId::V10)
}

/// A small room: alice created it and joined, set power levels giving bob
/// `bob_level`, made it public, and bob joined.
pub struct TestRoom {
    pub create: Pdu,
    pub alice_join: Pdu,
    pub power_levels: Pdu,
    pub join_rules: Pdu,
    pub bob_join: Pdu,
}

impl TestRoom {
    pub fn new(bob_level: i64) -> Self {
        let create = pdu(json!({
            "type": "m.room.create",
            "sender": ALICE,
            "state_key": "",
            "content": { "creator": ALICE, "room_version": "10" },
        }));
        let alice_join = pdu(json!({
            "type": "m.room.member",
            "sender": ALICE,
            "state_key": ALICE,
            "content": { "membership": "join" },
            "auth_events": [create.event_id()],
        }));
        let power_levels = Self::power_levels_event(&create, &alice_join, bob_level);
        let join_rules = pdu(json!({
            "type": "m.room.join_rules",
            "sender": ALICE,
            "state_key": "",
            "content": { "join_rule": "public" },
            "auth_events": [create.event_id(), alice_join.event_id(), power_levels.event_id()],
        }));
        let bob_join = pdu(json!({
            "type": "m.room.member",
            "sender": BOB,
            "state_key": BOB,
            "content": { "membership": "join" },
            "auth_events": [create.event_id(), power_levels.event_id(), join_rules.event_id()],
        }));

        Self {
            create,
            alice_join,
            power_levels,
            join_rules,
            bob_join,
        }
    }

    pub fn power_levels_event(create: &Pdu, alice_join: &Pdu, bob_level: i64) -> Pdu {
        pdu(json!({
            "type": "m.room.power_levels",
            "sender": ALICE,
            "state_key": "",
            "content": {
                "users": { ALICE: 100, BOB: bob_level },
                "state_default": 50,
                "events_default": 0,
                "events": { "m.room.topic": 50 },
            },
            "auth_events": [create.event_id(), alice_join.event_id()],
        }))
    }

    pub fn state_events(&self) -> Vec<Pdu> {
        vec![
            self.create.clone(),
            self.alice_join.clone(),
            self.power_levels.clone(),
            self.join_rules.clone(),
            self.bob_join.clone(),
        ]
    }

    /// IDs bob's events cite as auth events
    pub fn bob_auth_ids(&self) -> Vec<OwnedEventId> {
        vec![
            self.create.event_id().to_owned(),
            self.power_levels.event_id().to_owned(),
            self.bob_join.event_id().to_owned(),
        ]
    }

    /// A topic change by bob, which needs power level 50
    pub fn bob_topic(&self, topic: &str) -> Value {
        json!({
            "type": "m.room.topic",
            "sender": BOB,
            "state_key": "",
            "content": { "topic": topic },
            "auth_events": self.bob_auth_ids(),
            "prev_events": [self.bob_join.event_id()],
        })
    }
}
