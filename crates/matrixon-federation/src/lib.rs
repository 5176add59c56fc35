//! Matrixon Federation Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-03-21
//!
//! Receipt-time validation of PDUs received over federation. Every event
//! handed to [`EventsLoader::load_and_verify`] must:
//!
//! 1. Be a valid event, otherwise it is dropped.
//! 2. Pass signature checks, otherwise it is dropped.
//! 3. Pass hash checks, otherwise it is redacted before being processed
//!    further.
//! 4. Pass authorization rules based on the event's auth events,
//!    otherwise it is rejected.
//! 5. Pass authorization rules based on the state before the event,
//!    otherwise it is rejected.
//! 6. Pass authorization rules based on the current state of the room,
//!    otherwise it is soft failed (only when the soft-fail check is
//!    enabled).
//!
//! # Examples
//! ```rust,no_run
//! use std::sync::Arc;
//! use matrixon_federation::{
//!     AuthChainProvider, BasicAuthRules, CanonicalJsonParser, EventsLoader, KeyFetcher, KeyRing,
//!     LoaderConfig, Result, StateProvider,
//! };
//! use ruma::RoomVersionId;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example(
//!     fetcher: Arc<dyn KeyFetcher>,
//!     auth_chain: Arc<dyn AuthChainProvider>,
//!     state: Arc<dyn StateProvider>,
//!     raw_events: Vec<Vec<u8>>,
//! ) -> Result<()> {
//!     let config = LoaderConfig::load(None)?;
//!     let loader = EventsLoader::new(
//!         RoomVersionId::V10,
//!         Arc::new(CanonicalJsonParser::from_config(&config)),
//!         Arc::new(KeyRing::new(fetcher)),
//!         auth_chain,
//!         state,
//!         Arc::new(BasicAuthRules),
//!     )
//!     .with_config(&config);
//!
//!     for outcome in loader.load_and_verify(&CancellationToken::new(), &raw_events).await? {
//!         if let Some(err) = outcome.error() {
//!             println!("rejected at {}: {}", err.stage(), err);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod keyring;
pub mod loader;
pub mod logging;
pub mod parser;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use auth::{
    auth_types_for_event, verify_auth_rules_at_state, verify_event_auth_chain, BasicAuthRules, StateCheck,
    StateVerdict,
};
pub use config::LoaderConfig;
pub use error::{
    AuthChainError, AuthRuleViolation, EventError, FederationError, FetchError, ParseError, Result,
    SignatureError, StateAuthError,
};
pub use keyring::{required_signers, KeyRing, ServerKeys};
pub use loader::EventsLoader;
pub use parser::{content_hash, CanonicalJsonParser, MAX_PDU_SIZE};
pub use traits::{
    AuthChainProvider, AuthRules, CurrentStateProvider, EventParser, KeyFetcher, SignatureVerifier, StateProvider,
};
pub use types::{HeaderedEvent, Pdu, RawMessage, RoomState, StateKey, ValidationOutcome};
