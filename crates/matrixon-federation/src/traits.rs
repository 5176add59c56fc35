// =============================================================================
// Matrixon Federation - Traits Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the capability interfaces the PDU loader consumes:
// parsing, batched signature verification, signing key lookup, auth event
// and room state retrieval, and the authorization rule set. Real
// implementations perform network I/O and cryptography; tests inject
// deterministic stubs.
//
// =============================================================================

use std::collections::BTreeSet;

use async_trait::async_trait;
use ruma::{OwnedEventId, OwnedServerName, RoomVersionId};

use crate::{
    error::{AuthRuleViolation, FetchError, ParseError, Result, SignatureError},
    keyring::ServerKeys,
    types::{HeaderedEvent, Pdu, RoomState},
};

/// Turns untrusted bytes into a PDU, applying the room version's
/// redaction rule when the content hash does not match.
pub trait EventParser: Send + Sync {
    fn parse(&self, raw: &[u8], room_version: &RoomVersionId) -> std::result::Result<Pdu, ParseError>;
}

/// Verifies signatures for a whole batch at once.
///
/// A `None` slot marks an input that failed to parse. The returned vector
/// must have exactly one verdict per slot, `None` meaning the signatures
/// are valid. An `Err` aborts the whole load.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_batch(
        &self,
        room_version: &RoomVersionId,
        events: &[Option<Pdu>],
    ) -> Result<Vec<Option<SignatureError>>>;
}

/// Looks up public signing keys for remote servers
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetches keys for every server in `servers`. Servers that could not
    /// be reached go into `ServerKeys::unreachable`; an `Err` means the
    /// lookup machinery itself failed.
    async fn fetch_keys(&self, servers: &BTreeSet<OwnedServerName>) -> Result<ServerKeys>;
}

/// Resolves auth event IDs to events, possibly over federation
#[async_trait]
pub trait AuthChainProvider: Send + Sync {
    async fn auth_events(
        &self,
        room_version: &RoomVersionId,
        event_ids: &[OwnedEventId],
    ) -> std::result::Result<Vec<Pdu>, FetchError>;
}

/// Produces the resolved room state immediately before an event
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn state_before_event(&self, event: &HeaderedEvent) -> std::result::Result<RoomState, FetchError>;
}

/// Produces the room's current state, resolved from its forward extremities
#[async_trait]
pub trait CurrentStateProvider: Send + Sync {
    async fn current_state(&self, event: &HeaderedEvent) -> std::result::Result<RoomState, FetchError>;
}

/// A room version's authorization rules
pub trait AuthRules: Send + Sync {
    /// Checks `event` against the auth events selected for it
    fn check(&self, event: &HeaderedEvent, auth_events: &RoomState) -> std::result::Result<(), AuthRuleViolation>;
}
