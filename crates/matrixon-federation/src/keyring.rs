// =============================================================================
// Matrixon Federation - KeyRing Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Batched signature verification (check 2 of receipt-time validation).
// Signing keys for every server a batch needs are fetched with a single
// lookup, then each event is verified independently.
//
// =============================================================================

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use ruma::{
    signatures::PublicKeyMap, CanonicalJsonValue, OwnedServerName, RoomVersionId, UserId,
};
use tracing::{debug, instrument, warn};

use crate::{
    auth::ROOM_MEMBER,
    error::{Result, SignatureError},
    traits::{KeyFetcher, SignatureVerifier},
    types::{has_embedded_event_id, supports_restricted_joins, Pdu},
};

/// Keys returned by a `KeyFetcher`
#[derive(Debug, Clone, Default)]
pub struct ServerKeys {
    /// Currently valid public keys, by server name then key ID
    pub keys: PublicKeyMap,
    /// Servers whose keys could not be retrieved
    pub unreachable: BTreeSet<OwnedServerName>,
}

/// Servers whose signatures `event` must carry
pub fn required_signers(
    event: &Pdu,
    room_version: &RoomVersionId,
) -> std::result::Result<BTreeSet<OwnedServerName>, SignatureError> {
    let mut servers = BTreeSet::from([event.sender().server_name().to_owned()]);

    if has_embedded_event_id(room_version) {
        if let Some(server) = event.event_id().server_name() {
            servers.insert(server.to_owned());
        }
    }

    if event.kind() == ROOM_MEMBER
        && event.content_str("membership") == Some("join")
        && supports_restricted_joins(room_version)
    {
        if let Some(authoriser) = event.content_str("join_authorised_via_users_server") {
            let authoriser = UserId::parse(authoriser).map_err(|e| {
                SignatureError::Malformed(format!("invalid join_authorised_via_users_server: {e}"))
            })?;
            servers.insert(authoriser.server_name().to_owned());
        }
    }

    Ok(servers)
}

/// Verifies PDU signatures against keys from a `KeyFetcher`
pub struct KeyRing {
    fetcher: Arc<dyn KeyFetcher>,
}

impl KeyRing {
    pub fn new(fetcher: Arc<dyn KeyFetcher>) -> Self {
        Self { fetcher }
    }

    fn verify_one(
        event: &Pdu,
        signers: &BTreeSet<OwnedServerName>,
        keys: &ServerKeys,
        room_version: &RoomVersionId,
    ) -> Option<SignatureError> {
        let signatures = match event.signatures() {
            Some(CanonicalJsonValue::Object(signatures)) => signatures,
            Some(_) => return Some(SignatureError::Malformed("signatures must be an object".to_owned())),
            None => {
                return Some(SignatureError::MissingSignature {
                    server: event.sender().server_name().to_owned(),
                })
            }
        };

        for server in signers {
            if keys.unreachable.contains(server) {
                return Some(SignatureError::Unreachable {
                    server: server.clone(),
                });
            }
            if !keys
                .keys
                .get(server.as_str())
                .is_some_and(|set| !set.is_empty())
            {
                return Some(SignatureError::MissingKey {
                    server: server.clone(),
                });
            }
            match signatures.get(server.as_str()) {
                Some(CanonicalJsonValue::Object(_)) => {}
                Some(_) => {
                    return Some(SignatureError::Malformed(format!(
                        "signatures for {server} must be an object"
                    )))
                }
                None => {
                    return Some(SignatureError::MissingSignature {
                        server: server.clone(),
                    })
                }
            }
        }

        match ruma::signatures::verify_event(&keys.keys, event.as_canonical_json(), room_version) {
            Ok(_) => None,
            Err(e) => Some(SignatureError::Invalid(e.to_string())),
        }
    }
}

#[async_trait]
impl SignatureVerifier for KeyRing {
    #[instrument(level = "debug", skip_all, fields(batch = events.len()))]
    async fn verify_batch(
        &self,
        room_version: &RoomVersionId,
        events: &[Option<Pdu>],
    ) -> Result<Vec<Option<SignatureError>>> {
        let signers: Vec<std::result::Result<BTreeSet<OwnedServerName>, SignatureError>> = events
            .iter()
            .map(|slot| match slot {
                Some(event) => required_signers(event, room_version),
                None => Err(SignatureError::MissingEvent),
            })
            .collect();

        let servers: BTreeSet<OwnedServerName> = signers
            .iter()
            .filter_map(|required| required.as_ref().ok())
            .flatten()
            .cloned()
            .collect();

        let keys = if servers.is_empty() {
            ServerKeys::default()
        } else {
            debug!("🔑 Fetching signing keys for {} servers", servers.len());
            self.fetcher.fetch_keys(&servers).await?
        };

        let verdicts: Vec<Option<SignatureError>> = events
            .iter()
            .zip(signers)
            .map(|(slot, required)| match (slot, required) {
                (Some(event), Ok(required)) => Self::verify_one(event, &required, &keys, room_version),
                (_, Err(err)) => Some(err),
                (None, Ok(_)) => Some(SignatureError::MissingEvent),
            })
            .collect();

        let failed = verdicts.iter().filter(|verdict| verdict.is_some()).count();
        if failed > 0 {
            warn!("⚠️ {} of {} events failed signature checks", failed, events.len());
        }

        Ok(verdicts)
    }
}
