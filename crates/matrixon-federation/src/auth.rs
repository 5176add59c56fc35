// =============================================================================
// Matrixon Federation - Auth Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Checks 4 to 6 of receipt-time validation: an event must pass the
// authorization rules based on its own auth events, then based on the
// resolved state before it, and finally (soft-fail) based on the current
// state of the room.
//
// =============================================================================

use std::collections::HashMap;

use ruma::{CanonicalJsonObject, CanonicalJsonValue, OwnedEventId, UserId};
use tracing::{debug, instrument, trace};

use crate::{
    error::{AuthChainError, AuthRuleViolation, StateAuthError},
    traits::{AuthChainProvider, AuthRules, CurrentStateProvider, StateProvider},
    types::{supports_restricted_joins, HeaderedEvent, Pdu, RoomState, StateKey},
};

pub const ROOM_CREATE: &str = "m.room.create";
pub const ROOM_MEMBER: &str = "m.room.member";
pub const ROOM_POWER_LEVELS: &str = "m.room.power_levels";
pub const ROOM_JOIN_RULES: &str = "m.room.join_rules";
pub const ROOM_THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";

fn object_field<'a>(object: &'a CanonicalJsonObject, key: &str) -> Option<&'a CanonicalJsonObject> {
    match object.get(key) {
        Some(CanonicalJsonValue::Object(inner)) => Some(inner),
        _ => None,
    }
}

fn str_field<'a>(object: &'a CanonicalJsonObject, key: &str) -> Option<&'a str> {
    match object.get(key) {
        Some(CanonicalJsonValue::String(value)) => Some(value.as_str()),
        _ => None,
    }
}

fn third_party_invite_token(event: &Pdu) -> Option<&str> {
    let invite = object_field(event.content()?, "third_party_invite")?;
    str_field(object_field(invite, "signed")?, "token")
}

/// The state slots the authorization rules consult for `event`
pub fn auth_types_for_event(event: &HeaderedEvent) -> Vec<StateKey> {
    if event.kind() == ROOM_CREATE {
        return Vec::new();
    }

    let mut types = vec![
        (ROOM_CREATE.to_owned(), String::new()),
        (ROOM_POWER_LEVELS.to_owned(), String::new()),
        (ROOM_MEMBER.to_owned(), event.sender().to_string()),
    ];

    if event.kind() == ROOM_MEMBER {
        if let Some(target) = event.state_key() {
            types.push((ROOM_MEMBER.to_owned(), target.to_owned()));
        }

        let membership = event.content_str("membership");
        if matches!(membership, Some("join" | "invite" | "knock")) {
            types.push((ROOM_JOIN_RULES.to_owned(), String::new()));
        }

        if membership == Some("invite") {
            if let Some(token) = third_party_invite_token(event) {
                types.push((ROOM_THIRD_PARTY_INVITE.to_owned(), token.to_owned()));
            }
        }

        if membership == Some("join") && supports_restricted_joins(event.room_version()) {
            if let Some(authoriser) = event.content_str("join_authorised_via_users_server") {
                types.push((ROOM_MEMBER.to_owned(), authoriser.to_owned()));
            }
        }
    }

    types.sort();
    types.dedup();
    types
}

/// Checks `event` against the events it cites as its auth events.
///
/// Every cited event must be retrievable, belong to the same room, be a
/// state event and occupy a distinct `(type, state_key)` slot.
#[instrument(level = "debug", skip_all, fields(event_id = %event.event_id()))]
pub async fn verify_event_auth_chain(
    event: &HeaderedEvent,
    provider: &dyn AuthChainProvider,
    rules: &dyn AuthRules,
) -> Result<(), AuthChainError> {
    let ids = event.auth_events();
    let fetched = if ids.is_empty() {
        Vec::new()
    } else {
        provider.auth_events(event.room_version(), ids).await?
    };
    let by_id: HashMap<OwnedEventId, &Pdu> = fetched
        .iter()
        .map(|pdu| (pdu.event_id().to_owned(), pdu))
        .collect();

    let mut auth_events = RoomState::new();
    for id in ids {
        let auth_event = by_id
            .get(id)
            .ok_or_else(|| AuthChainError::MissingAuthEvent(id.clone()))?;

        if auth_event.room_id() != event.room_id() {
            return Err(AuthChainError::WrongRoom {
                event_id: id.clone(),
                room_id: auth_event.room_id().to_owned(),
            });
        }

        let (event_type, state_key) = auth_event
            .state_slot()
            .ok_or_else(|| AuthChainError::NotStateEvent(id.clone()))?;
        if auth_events.get(&event_type, &state_key).is_some() {
            return Err(AuthChainError::DuplicateAuthEvent {
                event_type,
                state_key,
            });
        }
        auth_events.insert((*auth_event).clone());
    }

    trace!("Auth check for {} based on {} auth events", event.event_id(), auth_events.len());
    rules.check(event, &auth_events)?;
    Ok(())
}

/// Which state an event is authorized against
#[derive(Clone, Copy)]
pub enum StateCheck<'a> {
    /// Resolved state immediately before the event; failure rejects it
    Strict(&'a dyn StateProvider),
    /// Current state of the room; failure soft-fails it
    Lenient(&'a dyn CurrentStateProvider),
}

/// Outcome of a successful state authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateVerdict {
    Authorized,
    /// Authorized by the state at the event but not by current state
    SoftFailed(StateAuthError),
}

async fn check_state(
    event: &HeaderedEvent,
    check: StateCheck<'_>,
    rules: &dyn AuthRules,
) -> Result<(), StateAuthError> {
    let state = match check {
        StateCheck::Strict(provider) => provider.state_before_event(event).await?,
        StateCheck::Lenient(provider) => provider.current_state(event).await?,
    };
    let auth_events = state.select(auth_types_for_event(event).iter());
    rules.check(event, &auth_events)?;
    Ok(())
}

/// Checks `event` against room state. Strict failures are returned as
/// errors; lenient failures never are and come back as
/// `StateVerdict::SoftFailed`.
#[instrument(level = "debug", skip_all, fields(event_id = %event.event_id(), strict = matches!(check, StateCheck::Strict(_))))]
pub async fn verify_auth_rules_at_state(
    event: &HeaderedEvent,
    check: StateCheck<'_>,
    rules: &dyn AuthRules,
) -> Result<StateVerdict, StateAuthError> {
    match (check_state(event, check, rules).await, check) {
        (Ok(()), _) => Ok(StateVerdict::Authorized),
        (Err(err), StateCheck::Strict(_)) => Err(err),
        (Err(err), StateCheck::Lenient(_)) => {
            debug!("Event {} is not allowed by current state: {}", event.event_id(), err);
            Ok(StateVerdict::SoftFailed(err))
        }
    }
}

fn as_level(value: &CanonicalJsonValue) -> Option<i64> {
    match value {
        CanonicalJsonValue::Integer(level) => Some(i64::from(*level)),
        CanonicalJsonValue::String(level) => level.parse().ok(),
        _ => None,
    }
}

/// Power levels in effect for an authorization check
struct PowerLevels {
    users: HashMap<String, i64>,
    users_default: i64,
    events: HashMap<String, i64>,
    events_default: i64,
    state_default: i64,
    invite: i64,
    kick: i64,
    ban: i64,
}

impl PowerLevels {
    fn from_content(content: &CanonicalJsonObject) -> Self {
        let level = |key: &str, default: i64| content.get(key).and_then(as_level).unwrap_or(default);
        let level_map = |key: &str| -> HashMap<String, i64> {
            object_field(content, key)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|(name, value)| Some((name.clone(), as_level(value)?)))
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            users: level_map("users"),
            users_default: level("users_default", 0),
            events: level_map("events"),
            events_default: level("events_default", 0),
            state_default: level("state_default", 50),
            invite: level("invite", 0),
            kick: level("kick", 50),
            ban: level("ban", 50),
        }
    }

    fn from_auth_events(auth_events: &RoomState, creator: &str) -> Self {
        if let Some(content) = auth_events
            .get(ROOM_POWER_LEVELS, "")
            .and_then(Pdu::content)
        {
            return Self::from_content(content);
        }

        Self {
            users: HashMap::from([(creator.to_owned(), 100)]),
            users_default: 0,
            events: HashMap::new(),
            events_default: 0,
            state_default: 0,
            invite: 0,
            kick: 50,
            ban: 50,
        }
    }

    fn user_level(&self, user: &str) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }

    fn required_level(&self, event: &Pdu) -> i64 {
        self.events.get(event.kind()).copied().unwrap_or(if event.is_state() {
            self.state_default
        } else {
            self.events_default
        })
    }
}

fn membership<'a>(auth_events: &'a RoomState, user: &str) -> Option<&'a str> {
    auth_events
        .get(ROOM_MEMBER, user)
        .and_then(|member| member.content_str("membership"))
}

/// Membership and power-level checks covering the common authorization
/// rules. Not a complete room-version rule set.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAuthRules;

impl BasicAuthRules {
    fn check_membership(
        &self,
        event: &HeaderedEvent,
        auth_events: &RoomState,
        creator: &str,
        levels: &PowerLevels,
    ) -> Result<(), AuthRuleViolation> {
        let sender = event.sender().as_str();
        let target = event
            .state_key()
            .ok_or_else(|| AuthRuleViolation::new("membership event without state key"))?;
        UserId::parse(target).map_err(|e| AuthRuleViolation::new(format!("invalid member {target}: {e}")))?;

        let sender_membership = membership(auth_events, sender);
        let target_membership = membership(auth_events, target);
        let sender_level = levels.user_level(sender);
        let target_level = levels.user_level(target);

        match event.content_str("membership") {
            Some("join") => {
                if target != sender {
                    return Err(AuthRuleViolation::new("cannot join on behalf of another user"));
                }
                if target_membership == Some("ban") {
                    return Err(AuthRuleViolation::new("banned users cannot join"));
                }
                if sender == creator || target_membership == Some("join") {
                    return Ok(());
                }
                let join_rule = auth_events
                    .get(ROOM_JOIN_RULES, "")
                    .and_then(|rules| rules.content_str("join_rule"));
                match (join_rule, target_membership) {
                    (Some("public"), _) | (_, Some("invite")) => Ok(()),
                    _ => Err(AuthRuleViolation::new("room is not public and user is not invited")),
                }
            }
            Some("invite") => {
                if sender_membership != Some("join") {
                    return Err(AuthRuleViolation::new("inviter is not joined"));
                }
                if matches!(target_membership, Some("join" | "ban")) {
                    return Err(AuthRuleViolation::new("invitee is already joined or banned"));
                }
                if sender_level < levels.invite {
                    return Err(AuthRuleViolation::new("insufficient power level to invite"));
                }
                Ok(())
            }
            Some("leave") if target == sender => {
                if matches!(sender_membership, Some("join" | "invite" | "knock")) {
                    Ok(())
                } else {
                    Err(AuthRuleViolation::new("cannot leave a room the user is not in"))
                }
            }
            Some("leave") => {
                if sender_membership != Some("join") {
                    return Err(AuthRuleViolation::new("kicker is not joined"));
                }
                if target_membership == Some("ban") && sender_level < levels.ban {
                    return Err(AuthRuleViolation::new("insufficient power level to unban"));
                }
                if sender_level < levels.kick || target_level >= sender_level {
                    return Err(AuthRuleViolation::new("insufficient power level to kick"));
                }
                Ok(())
            }
            Some("ban") => {
                if sender_membership != Some("join") {
                    return Err(AuthRuleViolation::new("banner is not joined"));
                }
                if sender_level < levels.ban || target_level >= sender_level {
                    return Err(AuthRuleViolation::new("insufficient power level to ban"));
                }
                Ok(())
            }
            Some(other) => Err(AuthRuleViolation::new(format!("unsupported membership {other}"))),
            None => Err(AuthRuleViolation::new("membership event without membership")),
        }
    }
}

impl AuthRules for BasicAuthRules {
    fn check(&self, event: &HeaderedEvent, auth_events: &RoomState) -> Result<(), AuthRuleViolation> {
        if event.kind() == ROOM_CREATE {
            if !event.auth_events().is_empty() || !event.prev_events().is_empty() {
                return Err(AuthRuleViolation::new("create event must be the first event"));
            }
            return Ok(());
        }

        let create = auth_events
            .get(ROOM_CREATE, "")
            .ok_or_else(|| AuthRuleViolation::new("no create event in auth events"))?;
        let creator = create
            .content_str("creator")
            .unwrap_or_else(|| create.sender().as_str());
        let levels = PowerLevels::from_auth_events(auth_events, creator);

        if event.kind() == ROOM_MEMBER {
            return self.check_membership(event, auth_events, creator, &levels);
        }

        let sender = event.sender().as_str();
        if membership(auth_events, sender) != Some("join") {
            return Err(AuthRuleViolation::new(format!("sender {sender} is not joined")));
        }

        let sender_level = levels.user_level(sender);
        let required = levels.required_level(event);
        if sender_level < required {
            return Err(AuthRuleViolation::new(format!(
                "sender power level {sender_level} is below {required} required for {}",
                event.kind()
            )));
        }

        if event.kind() == ROOM_POWER_LEVELS {
            if let Some(content) = event.content() {
                let proposed = PowerLevels::from_content(content);
                if let Some((user, level)) = proposed
                    .users
                    .iter()
                    .find(|(user, level)| **level > sender_level && levels.user_level(user) != **level)
                {
                    return Err(AuthRuleViolation::new(format!(
                        "cannot raise {user} to {level}, above own level {sender_level}"
                    )));
                }
            }
        }

        Ok(())
    }
}
