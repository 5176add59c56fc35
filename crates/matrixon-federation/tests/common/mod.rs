//! Shared fixtures for the federation integration tests
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-03-21

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use matrixon_federation::{
    AuthChainProvider, BasicAuthRules, CanonicalJsonParser, CurrentStateProvider, EventParser, EventsLoader,
    FetchError, HeaderedEvent, KeyFetcher, KeyRing, Pdu, Result, RoomState, ServerKeys, SignatureError,
    SignatureVerifier, StateProvider,
};
use ruma::{
    serde::Base64,
    signatures::{hash_and_sign_event, Ed25519KeyPair, PublicKeyMap, PublicKeySet},
    CanonicalJsonObject, OwnedEventId, OwnedServerName, RoomVersionId,
};
use serde_json::{json, Value};

pub const ROOM_ID: &str = "!room:example.com";
pub const ALICE: &str = "@alice:example.com";
pub const BOB: &str = "@bob:remote.org";

static INIT: Once = Once::new();
static CLOCK: AtomicU64 = AtomicU64::new(1_700_000_000_000);

pub fn init_test_environment() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    });
}

/// Deterministic signing key from a PKCS#8 v1 document
fn signing_key(seed: u8) -> Ed25519KeyPair {
    let document: Vec<u8> = [48, 46, 2, 1, 0, 48, 5, 6, 3, 43, 101, 112, 4, 34, 4, 32]
        .iter()
        .copied()
        .chain([seed; 32])
        .collect();
    Ed25519KeyPair::from_der(&document, "test".to_owned()).expect("valid test key")
}

/// Signing keys for the two servers taking part in the test room
pub struct Servers {
    keys: BTreeMap<String, Ed25519KeyPair>,
}

impl Servers {
    pub fn new() -> Self {
        Self {
            keys: [
                ("example.com".to_owned(), signing_key(1)),
                ("remote.org".to_owned(), signing_key(2)),
            ]
            .into(),
        }
    }

    /// Public keys as a key server would publish them
    pub fn server_keys(&self) -> ServerKeys {
        let keys: PublicKeyMap = self
            .keys
            .iter()
            .map(|(server, key)| {
                let set: PublicKeySet = [("ed25519:test".to_owned(), Base64::new(key.public_key().to_vec()))].into();
                (server.clone(), set)
            })
            .collect();
        ServerKeys {
            keys,
            unreachable: BTreeSet::new(),
        }
    }

    /// Fills in the envelope of `value`, then hashes and signs it as the
    /// sender's server
    pub fn sign(&self, mut value: Value) -> CanonicalJsonObject {
        let fields = value.as_object_mut().expect("event must be a JSON object");
        fields.entry("room_id").or_insert_with(|| json!(ROOM_ID));
        fields.entry("content").or_insert_with(|| json!({}));
        fields.entry("auth_events").or_insert_with(|| json!([]));
        fields.entry("prev_events").or_insert_with(|| json!([]));
        fields.entry("depth").or_insert_with(|| json!(1));
        fields
            .entry("origin_server_ts")
            .or_insert_with(|| json!(CLOCK.fetch_add(1, Ordering::SeqCst)));
        let sender = fields["sender"].as_str().expect("sender").to_owned();
        let server = sender.split_once(':').expect("user ID").1.to_owned();

        let mut object: CanonicalJsonObject = serde_json::from_value(value).expect("canonical JSON");
        hash_and_sign_event(&server, &self.keys[&server], &mut object, &RoomVersionId::V10)
            .expect("signable event");
        object
    }

    pub fn raw(&self, value: Value) -> Vec<u8> {
        serde_json::to_vec(&self.sign(value)).expect("serializable event")
    }

    pub fn pdu(&self, value: Value) -> Pdu {
        CanonicalJsonParser::default()
            .parse(&self.raw(value), &RoomVersionId::V10)
            .expect("valid test event")
    }
}

/// Alice's public room where bob joined with power level `bob_level`
pub struct TestRoom {
    pub create: Pdu,
    pub alice_join: Pdu,
    pub power_levels: Pdu,
    pub join_rules: Pdu,
    pub bob_join: Pdu,
}

impl TestRoom {
    pub fn new(servers: &Servers, bob_level: i64) -> Self {
        let create = servers.pdu(json!({
            "type": "m.room.create",
            "sender": ALICE,
            "state_key": "",
            "content": { "creator": ALICE, "room_version": "10" },
        }));
        let alice_join = servers.pdu(json!({
            "type": "m.room.member",
            "sender": ALICE,
            "state_key": ALICE,
            "content": { "membership": "join" },
            "auth_events": [create.event_id()],
        }));
        let power_levels = Self::power_levels(servers, &create, &alice_join, bob_level);
        let join_rules = servers.pdu(json!({
            "type": "m.room.join_rules",
            "sender": ALICE,
            "state_key": "",
            "content": { "join_rule": "public" },
            "auth_events": [create.event_id(), alice_join.event_id(), power_levels.event_id()],
        }));
        let bob_join = servers.pdu(json!({
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

    pub fn power_levels(servers: &Servers, create: &Pdu, alice_join: &Pdu, bob_level: i64) -> Pdu {
        servers.pdu(json!({
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

    pub fn state(&self) -> RoomState {
        self.state_events().into_iter().collect()
    }

    /// The room state after alice demotes bob to `bob_level`
    pub fn demoted_state(&self, servers: &Servers, bob_level: i64) -> RoomState {
        let mut state = self.state();
        state.insert(Self::power_levels(servers, &self.create, &self.alice_join, bob_level));
        state
    }

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

    /// A message by bob, which anyone joined may send
    pub fn bob_message(&self, body: &str) -> Value {
        json!({
            "type": "m.room.message",
            "sender": BOB,
            "content": { "msgtype": "m.text", "body": body },
            "auth_events": self.bob_auth_ids(),
            "prev_events": [self.bob_join.event_id()],
        })
    }
}

/// Serves fixed keys and counts lookups
pub struct StaticKeys {
    keys: ServerKeys,
    pub lookups: AtomicUsize,
}

impl StaticKeys {
    pub fn new(keys: ServerKeys) -> Self {
        Self {
            keys,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KeyFetcher for StaticKeys {
    async fn fetch_keys(&self, servers: &BTreeSet<OwnedServerName>) -> Result<ServerKeys> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let keys: PublicKeyMap = self
            .keys
            .keys
            .iter()
            .filter(|(server, _)| servers.iter().any(|wanted| wanted.as_str() == server.as_str()))
            .map(|(server, set)| (server.clone(), set.clone()))
            .collect();
        Ok(ServerKeys {
            keys,
            unreachable: self.keys.unreachable.clone(),
        })
    }
}

/// Answers auth event lookups from a fixed set of events
pub struct EventStore {
    events: Vec<Pdu>,
}

impl EventStore {
    pub fn new(events: Vec<Pdu>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl AuthChainProvider for EventStore {
    async fn auth_events(
        &self,
        _room_version: &RoomVersionId,
        event_ids: &[OwnedEventId],
    ) -> std::result::Result<Vec<Pdu>, FetchError> {
        Ok(self
            .events
            .iter()
            .filter(|event| event_ids.iter().any(|id| id.as_str() == event.event_id().as_str()))
            .cloned()
            .collect())
    }
}

/// Returns the same room state for every event, after an optional delay
pub struct FixedState {
    state: RoomState,
    delay: Option<Duration>,
}

impl FixedState {
    pub fn new(state: RoomState) -> Self {
        Self { state, delay: None }
    }

    pub fn slow(state: RoomState, delay: Duration) -> Self {
        Self {
            state,
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl StateProvider for FixedState {
    async fn state_before_event(&self, _event: &HeaderedEvent) -> std::result::Result<RoomState, FetchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.clone())
    }
}

#[async_trait]
impl CurrentStateProvider for FixedState {
    async fn current_state(&self, _event: &HeaderedEvent) -> std::result::Result<RoomState, FetchError> {
        Ok(self.state.clone())
    }
}

/// Returns one verdict fewer than it was given events
pub struct ShortVerifier;

#[async_trait]
impl SignatureVerifier for ShortVerifier {
    async fn verify_batch(
        &self,
        _room_version: &RoomVersionId,
        events: &[Option<Pdu>],
    ) -> Result<Vec<Option<SignatureError>>> {
        Ok(vec![None; events.len().saturating_sub(1)])
    }
}

/// Everything a loader for the test room needs
pub struct Harness {
    pub servers: Servers,
    pub room: TestRoom,
    pub keys: Arc<StaticKeys>,
}

impl Harness {
    pub fn new() -> Self {
        init_test_environment();
        let servers = Servers::new();
        let room = TestRoom::new(&servers, 50);
        let keys = Arc::new(StaticKeys::new(servers.server_keys()));
        Self { servers, room, keys }
    }

    pub fn loader_with_state(&self, state: FixedState) -> EventsLoader {
        EventsLoader::new(
            RoomVersionId::V10,
            Arc::new(CanonicalJsonParser::default()),
            Arc::new(KeyRing::new(self.keys.clone())),
            Arc::new(EventStore::new(self.room.state_events())),
            Arc::new(state),
            Arc::new(BasicAuthRules),
        )
    }

    pub fn loader(&self) -> EventsLoader {
        self.loader_with_state(FixedState::new(self.room.state()))
    }
}
