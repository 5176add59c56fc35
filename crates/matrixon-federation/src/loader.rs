// =============================================================================
// Matrixon Federation - Events Loader Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Loads untrusted PDUs and runs the receipt-time checks over them in
// order: parse (with hash-based redaction), batched signature
// verification, authorization by auth events, authorization by the state
// before the event and, when enabled, the soft-fail check against current
// state. The result always has exactly one outcome per input, in input
// order.
//
// =============================================================================

use std::{mem, sync::Arc, time::Instant};

use futures::{stream, StreamExt};
use ruma::RoomVersionId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::{verify_auth_rules_at_state, verify_event_auth_chain, StateCheck, StateVerdict},
    config::LoaderConfig,
    error::{EventError, FederationError, Result},
    traits::{AuthChainProvider, AuthRules, CurrentStateProvider, EventParser, SignatureVerifier, StateProvider},
    types::{HeaderedEvent, Pdu, ValidationOutcome},
};

/// Where one input position is in the pipeline
enum EventProgress {
    /// Parsed; the PDU waits in the signature batch
    Parsed,
    /// Signatures verified; authorization pending
    Pending(HeaderedEvent),
    Failed(EventError),
    Passed(HeaderedEvent),
    SoftFailed(HeaderedEvent),
}

impl EventProgress {
    fn into_outcome(self) -> Option<ValidationOutcome> {
        match self {
            Self::Passed(event) => Some(ValidationOutcome::Accepted(event)),
            Self::SoftFailed(event) => Some(ValidationOutcome::SoftFailed(event)),
            Self::Failed(err) => Some(ValidationOutcome::Rejected(err)),
            Self::Parsed | Self::Pending(_) => None,
        }
    }
}

/// Loads untrusted events for one room version and verifies them
pub struct EventsLoader {
    room_version: RoomVersionId,
    parser: Arc<dyn EventParser>,
    key_ring: Arc<dyn SignatureVerifier>,
    auth_chain_provider: Arc<dyn AuthChainProvider>,
    state_provider: Arc<dyn StateProvider>,
    rules: Arc<dyn AuthRules>,
    current_state: Option<Arc<dyn CurrentStateProvider>>,
    soft_fail_check: bool,
    concurrency: usize,
    timeout_ms: Option<u64>,
}

impl EventsLoader {
    /// Creates a loader with the default configuration and the soft-fail
    /// check disabled
    pub fn new(
        room_version: RoomVersionId,
        parser: Arc<dyn EventParser>,
        key_ring: Arc<dyn SignatureVerifier>,
        auth_chain_provider: Arc<dyn AuthChainProvider>,
        state_provider: Arc<dyn StateProvider>,
        rules: Arc<dyn AuthRules>,
    ) -> Self {
        let config = LoaderConfig::default();
        Self {
            room_version,
            parser,
            key_ring,
            auth_chain_provider,
            state_provider,
            rules,
            current_state: None,
            soft_fail_check: config.soft_fail_check,
            concurrency: config.concurrency,
            timeout_ms: config.timeout_ms,
        }
    }

    /// Applies concurrency, deadline and soft-fail settings from `config`.
    /// The soft-fail check still needs a provider from
    /// `with_soft_fail_check` to take effect.
    pub fn with_config(mut self, config: &LoaderConfig) -> Self {
        self.concurrency = config.concurrency.max(1);
        self.timeout_ms = config.timeout_ms;
        self.soft_fail_check = config.soft_fail_check;
        if self.soft_fail_check && self.current_state.is_none() {
            debug!("Soft-fail check requested without a current state provider");
        }
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Enables the soft-fail check against the state from `provider`
    pub fn with_soft_fail_check(mut self, provider: Arc<dyn CurrentStateProvider>) -> Self {
        self.current_state = Some(provider);
        self.soft_fail_check = true;
        self
    }

    pub fn room_version(&self) -> &RoomVersionId {
        &self.room_version
    }

    pub fn soft_fail_enabled(&self) -> bool {
        self.soft_fail_check && self.current_state.is_some()
    }

    /// Loads untrusted events and verifies them.
    ///
    /// On success the result holds exactly one outcome per entry of
    /// `raw_events`, at the same index. Cancellation, the deadline and
    /// infrastructure faults fail the whole call; no partial results are
    /// ever returned.
    #[instrument(level = "debug", skip_all, fields(room_version = %self.room_version, batch = raw_events.len()))]
    pub async fn load_and_verify<R>(
        &self,
        cancel: &CancellationToken,
        raw_events: &[R],
    ) -> Result<Vec<ValidationOutcome>>
    where
        R: AsRef<[u8]> + Sync,
    {
        if cancel.is_cancelled() {
            return Err(FederationError::Cancelled);
        }
        if raw_events.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let run = async {
            match self.timeout_ms {
                Some(ms) => tokio::time::timeout(
                    std::time::Duration::from_millis(ms),
                    self.run_checks(raw_events),
                )
                .await
                .map_err(|_| FederationError::timeout(ms))?,
                None => self.run_checks(raw_events).await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FederationError::Cancelled),
            result = run => result,
        };

        match &result {
            Ok(outcomes) => {
                let accepted = outcomes.iter().filter(|outcome| outcome.is_accepted()).count();
                info!(
                    "✅ Loaded {} of {} events in {:?}",
                    accepted,
                    outcomes.len(),
                    start.elapsed()
                );
            }
            Err(err) => err.log(),
        }
        result
    }

    async fn run_checks<R>(&self, raw_events: &[R]) -> Result<Vec<ValidationOutcome>>
    where
        R: AsRef<[u8]> + Sync,
    {
        let (mut progress, batch) = self.parse_all(raw_events);
        self.check_signatures(&mut progress, batch).await?;
        self.authorize_pending(&mut progress).await;

        progress
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.into_outcome().ok_or_else(|| {
                    FederationError::internal(format!("event {index} left the pipeline without a verdict"))
                })
            })
            .collect()
    }

    /// 1. Is a valid event, otherwise it is dropped.
    /// 3. Passes hash checks, otherwise it is redacted before being
    ///    processed further.
    fn parse_all<R: AsRef<[u8]>>(&self, raw_events: &[R]) -> (Vec<EventProgress>, Vec<Option<Pdu>>) {
        let mut progress = Vec::with_capacity(raw_events.len());
        let mut batch = Vec::with_capacity(raw_events.len());

        for (index, raw) in raw_events.iter().enumerate() {
            match self.parser.parse(raw.as_ref(), &self.room_version) {
                Ok(event) => {
                    progress.push(EventProgress::Parsed);
                    batch.push(Some(event));
                }
                Err(err) => {
                    warn!("⚠️ Dropping invalid event at index {}: {}", index, err);
                    progress.push(EventProgress::Failed(err.into()));
                    batch.push(None);
                }
            }
        }

        debug!("Parsed {} of {} events", batch.iter().flatten().count(), raw_events.len());
        (progress, batch)
    }

    /// 2. Passes signature checks, otherwise it is dropped.
    ///
    /// Every position takes part, including ones that failed to parse.
    async fn check_signatures(
        &self,
        progress: &mut [EventProgress],
        mut batch: Vec<Option<Pdu>>,
    ) -> Result<()> {
        let verdicts = self.key_ring.verify_batch(&self.room_version, &batch).await?;
        if verdicts.len() != batch.len() {
            return Err(FederationError::SignatureBatchLength {
                expected: batch.len(),
                actual: verdicts.len(),
            });
        }

        for (index, (slot, verdict)) in progress.iter_mut().zip(verdicts).enumerate() {
            if !matches!(slot, EventProgress::Parsed) {
                continue;
            }
            let Some(event) = batch[index].take() else {
                continue;
            };
            *slot = match verdict {
                Some(err) => {
                    warn!("⚠️ Dropping event {} with bad signatures: {}", event.event_id(), err);
                    EventProgress::Failed(err.into())
                }
                None => EventProgress::Pending(HeaderedEvent::new(event, self.room_version.clone())),
            };
        }
        Ok(())
    }

    /// 4. Passes authorization rules based on the event's auth events,
    ///    otherwise it is rejected.
    /// 5. Passes authorization rules based on the state before the event,
    ///    otherwise it is rejected.
    /// 6. Passes authorization rules based on the current state of the
    ///    room, otherwise it is soft failed.
    async fn authorize(&self, event: HeaderedEvent) -> EventProgress {
        if let Err(err) =
            verify_event_auth_chain(&event, self.auth_chain_provider.as_ref(), self.rules.as_ref()).await
        {
            warn!("⚠️ Rejecting event {} due to auth events: {}", event.event_id(), err);
            return EventProgress::Failed(err.into());
        }

        let strict = StateCheck::Strict(self.state_provider.as_ref());
        if let Err(err) = verify_auth_rules_at_state(&event, strict, self.rules.as_ref()).await {
            warn!("⚠️ Rejecting event {} due to state before event: {}", event.event_id(), err);
            return EventProgress::Failed(err.into());
        }

        let Some(current) = self.current_state.as_ref().filter(|_| self.soft_fail_check) else {
            return EventProgress::Passed(event);
        };
        match verify_auth_rules_at_state(&event, StateCheck::Lenient(current.as_ref()), self.rules.as_ref()).await {
            Ok(StateVerdict::SoftFailed(reason)) => {
                info!("Soft failing event {}: {}", event.event_id(), reason);
                EventProgress::SoftFailed(event)
            }
            Ok(StateVerdict::Authorized) | Err(_) => EventProgress::Passed(event),
        }
    }

    /// Runs the per-event authorization checks for every pending position
    /// on a pool of `concurrency` workers, writing results back by index
    async fn authorize_pending(&self, progress: &mut [EventProgress]) {
        let pending: Vec<(usize, HeaderedEvent)> = progress
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match mem::replace(slot, EventProgress::Parsed) {
                EventProgress::Pending(event) => Some((index, event)),
                other => {
                    *slot = other;
                    None
                }
            })
            .collect();
        debug!("Authorizing {} events", pending.len());

        let verdicts: Vec<(usize, EventProgress)> = stream::iter(pending)
            .map(|(index, event)| async move { (index, self.authorize(event).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (index, verdict) in verdicts {
            progress[index] = verdict;
        }
    }
}
