// =============================================================================
// Matrixon Federation - Error Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the two error classes of the PDU loading pipeline:
// per-event errors, which are always attributable to exactly one input
// position and never abort a batch, and infrastructure errors, which void
// the whole call.
//
// =============================================================================

use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName};
use thiserror::Error;
use tracing::{error, warn};

/// Infrastructure error that aborts a whole `load_and_verify` call
#[derive(Error, Debug)]
pub enum FederationError {
    /// The signature verifier broke the batch contract
    #[error("Bulk event signature verification length mismatch: {actual} != {expected}")]
    SignatureBatchLength { expected: usize, actual: usize },

    /// The caller cancelled the call
    #[error("Event loading was cancelled")]
    Cancelled,

    /// The call exceeded its deadline
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Signing keys could not be fetched at all
    #[error("Key fetch error: {0}")]
    KeyFetch(String),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for federation operations
pub type Result<T> = std::result::Result<T, FederationError>;

impl FederationError {
    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates a new key fetch error
    pub fn key_fetch(msg: impl Into<String>) -> Self {
        Self::KeyFetch(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(ms: u64) -> Self {
        Self::Timeout(ms)
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Logs the error with appropriate level and context
    pub fn log(&self) {
        match self {
            Self::SignatureBatchLength { expected, actual } => {
                error!("❌ Signature batch length mismatch: {} != {}", actual, expected)
            }
            Self::Cancelled => warn!("⚠️ Event loading cancelled"),
            Self::Timeout(ms) => warn!("⚠️ Event loading timed out after {}ms", ms),
            Self::KeyFetch(msg) => error!("❌ Key fetch error: {}", msg),
            Self::InvalidConfig(msg) => error!("❌ Invalid configuration: {}", msg),
            Self::Internal(msg) => error!("❌ Internal error: {}", msg),
        }
    }
}

/// The first per-event error recorded for an input position
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Invalid event: {0}")]
    Parse(#[from] ParseError),

    #[error("Signature check failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("Rejected by auth events: {0}")]
    AuthChain(#[from] AuthChainError),

    #[error("Rejected by state before event: {0}")]
    StateAuth(#[from] StateAuthError),
}

impl EventError {
    /// Name of the pipeline stage that produced this error
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Signature(_) => "signature",
            Self::AuthChain(_) => "auth_chain",
            Self::StateAuth(_) => "state",
        }
    }
}

/// Structural failures while turning raw bytes into a PDU
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Event is {size} bytes, larger than the maximum of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Event is not canonical JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Too many entries in `{field}`: {count} > {max}")]
    TooManyReferences {
        field: &'static str,
        count: usize,
        max: usize,
    },

    #[error("Could not compute event ID: {0}")]
    EventId(String),

    #[error("Redaction failed: {0}")]
    Redaction(String),
}

impl ParseError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Per-event verdicts of the batched signature verifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The slot held no parsed event
    #[error("No event to verify at this position")]
    MissingEvent,

    #[error("Event is not signed by {server}")]
    MissingSignature { server: OwnedServerName },

    #[error("No valid signing key known for {server}")]
    MissingKey { server: OwnedServerName },

    #[error("Signing server {server} is unreachable")]
    Unreachable { server: OwnedServerName },

    #[error("Malformed signatures block: {0}")]
    Malformed(String),

    #[error("Invalid signature: {0}")]
    Invalid(String),
}

/// Failures of collaborators that fetch events or state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Event {0} not found")]
    NotFound(OwnedEventId),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

/// An authorization rule rejected the event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct AuthRuleViolation(pub String);

impl AuthRuleViolation {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The event is not authorized by its own declared auth events
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthChainError {
    #[error("Failed to fetch auth events: {0}")]
    Fetch(#[from] FetchError),

    #[error("Auth event {0} could not be found")]
    MissingAuthEvent(OwnedEventId),

    #[error("Auth event {event_id} belongs to room {room_id}")]
    WrongRoom {
        event_id: OwnedEventId,
        room_id: OwnedRoomId,
    },

    #[error("Auth event {0} is not a state event")]
    NotStateEvent(OwnedEventId),

    #[error("Auth event type and state key ({event_type}, {state_key}) appear more than once")]
    DuplicateAuthEvent {
        event_type: String,
        state_key: String,
    },

    #[error("Auth check failed: {0}")]
    Rules(#[from] AuthRuleViolation),
}

/// The event is not authorized by the resolved state before it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateAuthError {
    #[error("Failed to fetch state: {0}")]
    Fetch(#[from] FetchError),

    #[error("Auth check failed: {0}")]
    Rules(#[from] AuthRuleViolation),
}
