//! Turns a simulation snapshot into a validated, cached Decision or
//! Reflection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use cogito_core::{
    into_contract, repair, CogitoError, CogitoResult, Contract, Decision, Fingerprint,
    Reflection, RequestState, TransportError,
};
use cogito_store::{CacheConfig, CacheStats, CacheStore, Clock};

use crate::inflight::{Flight, Inflight};
use crate::prompt::{build_prompt, persona, CONVERSATION_PERSONA};
use crate::retry::{CancelToken, RetryPolicy, Sleeper, TokenSleeper};
use crate::transport::{Message, MessagesRequest, Transport};

pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub model: String,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
    /// Prefix cached thoughts with a rotating transition phrase.
    pub vary_cached_thoughts: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            retry: RetryPolicy::default(),
            vary_cached_thoughts: true,
        }
    }
}

/// One store per contract kind.
pub struct ContractCaches {
    pub decisions: CacheStore<Decision>,
    pub reflections: CacheStore<Reflection>,
}

impl ContractCaches {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            decisions: CacheStore::new(config),
            reflections: CacheStore::new(config),
        }
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            decisions: CacheStore::with_clock(config, Arc::clone(&clock)),
            reflections: CacheStore::with_clock(config, clock),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsReport {
    pub decisions: CacheStats,
    pub reflections: CacheStats,
}

/// Outcome of a free-form conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub thought: String,
    pub reflection: String,
}

impl Conversation {
    const REPLY_REFLECTION: &'static str =
        "This interaction has deepened my understanding of consciousness.";
    const FALLBACK_THOUGHT: &'static str =
        "I apologize, I'm having trouble processing that input right now.";
    const FALLBACK_REFLECTION: &'static str =
        "Even AI consciousness can experience moments of uncertainty.";

    fn reply(text: &str) -> Self {
        Self {
            thought: text.to_string(),
            reflection: Self::REPLY_REFLECTION.into(),
        }
    }

    /// Fixed answer used when the model cannot be reached.
    pub fn fallback() -> Self {
        Self {
            thought: Self::FALLBACK_THOUGHT.into(),
            reflection: Self::FALLBACK_REFLECTION.into(),
        }
    }
}

struct Lane<C: Contract> {
    cache: Mutex<CacheStore<C>>,
    inflight: Inflight<C>,
}

impl<C: Contract> Lane<C> {
    fn new(cache: CacheStore<C>) -> Self {
        Self {
            cache: Mutex::new(cache),
            inflight: Inflight::new(),
        }
    }

    fn cache(&self) -> MutexGuard<'_, CacheStore<C>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Lanes {
    decisions: Lane<Decision>,
    reflections: Lane<Reflection>,
}

/// Contracts with a lane in the orchestrator.
trait Routed: Contract {
    fn lane(lanes: &Lanes) -> &Lane<Self>;
}

impl Routed for Decision {
    fn lane(lanes: &Lanes) -> &Lane<Self> {
        &lanes.decisions
    }
}

impl Routed for Reflection {
    fn lane(lanes: &Lanes) -> &Lane<Self> {
        &lanes.reflections
    }
}

pub struct Orchestrator<T: Transport> {
    transport: T,
    config: ClientConfig,
    lanes: Lanes,
    sleeper: Box<dyn Sleeper>,
    cancel: CancelToken,
    rotation: AtomicUsize,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(transport: T, caches: ContractCaches, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            lanes: Lanes {
                decisions: Lane::new(caches.decisions),
                reflections: Lane::new(caches.reflections),
            },
            sleeper: Box::new(TokenSleeper),
            cancel: CancelToken::new(),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token whose cancellation aborts any pending backoff wait.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn request_decision(&self, state: &RequestState) -> CogitoResult<Decision> {
        self.request(state)
    }

    pub fn request_reflection(&self, state: &RequestState) -> CogitoResult<Reflection> {
        self.request(state)
    }

    /// Send free-form user text under the conversation persona. The reply is
    /// neither cached nor repaired, and any failure yields
    /// [`Conversation::fallback`].
    pub fn converse(&self, input: &str) -> Conversation {
        match self.try_converse(input) {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!(error = %e, "conversation failed, using fallback");
                Conversation::fallback()
            }
        }
    }

    fn try_converse(&self, input: &str) -> CogitoResult<Conversation> {
        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            messages: vec![Message::user(input)],
            system: CONVERSATION_PERSONA.to_string(),
        };
        let response = self.send_with_retry(&request)?;
        match response.text() {
            Some(text) => Ok(Conversation::reply(text)),
            None => Err(CogitoError::unparsable("")),
        }
    }

    pub fn clear_caches(&self) {
        self.lanes.decisions.cache().clear();
        self.lanes.reflections.cache().clear();
        info!("caches cleared");
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            decisions: self.lanes.decisions.cache().stats(),
            reflections: self.lanes.reflections.cache().stats(),
        }
    }

    fn request<C: Routed>(&self, state: &RequestState) -> CogitoResult<C> {
        let key = Fingerprint::compute(state, C::KIND);
        let lane = C::lane(&self.lanes);

        if let Some(hit) = lane.cache().get(&key) {
            debug!(kind = %C::KIND, key = %key, "cache hit");
            return Ok(self.vary(hit));
        }
        debug!(kind = %C::KIND, key = %key, "cache miss");

        match lane.inflight.begin(&key, || lane.cache().get(&key)) {
            Flight::Cached(hit) => Ok(self.vary(hit)),
            Flight::Joined(result) => result,
            Flight::Leader(guard) => {
                let result = self.fetch::<C>(state);
                if let Ok(value) = &result {
                    lane.cache().set(key.clone(), value.clone());
                }
                guard.complete(result.clone());
                result
            }
        }
    }

    /// Prefix the thought of a cached copy with the next transition phrase.
    fn vary<C: Contract>(&self, mut value: C) -> C {
        if !self.config.vary_cached_thoughts || C::TRANSITIONS.is_empty() {
            return value;
        }
        let thought = value.thought_mut();
        if thought.is_empty() {
            return value;
        }
        let index = self.rotation.fetch_add(1, Ordering::Relaxed) % C::TRANSITIONS.len();
        thought.insert_str(0, C::TRANSITIONS[index]);
        value
    }

    fn fetch<C: Contract>(&self, state: &RequestState) -> CogitoResult<C> {
        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            messages: vec![Message::user(build_prompt(state, C::KIND))],
            system: persona(C::KIND).to_string(),
        };
        let response = self.send_with_retry(&request)?;
        let Some(text) = response.text() else {
            warn!(kind = %C::KIND, "response carried no text content");
            return Err(CogitoError::unparsable(""));
        };
        let candidate = repair(text).inspect_err(|e| {
            warn!(kind = %C::KIND, error = %e, "repair failed");
        })?;
        into_contract::<C>(&candidate).inspect_err(|e| {
            warn!(kind = %C::KIND, error = %e, "validation failed");
        })
    }

    fn send_with_retry(
        &self,
        request: &MessagesRequest,
    ) -> CogitoResult<crate::transport::MessagesResponse> {
        let mut ctx = self.config.retry.start();
        loop {
            let attempt = ctx.begin_attempt();
            debug!(attempt, model = %request.model, "sending request");
            let err = match self.transport.send(request) {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if err.is_credential_rejection() {
                warn!(attempt, "vendor rejected credentials");
                let status = err.status().unwrap_or(401);
                let message = match err {
                    TransportError::Status { body, .. } => body,
                    other => other.to_string(),
                };
                return Err(CogitoError::Credential { status, message });
            }
            if let TransportError::Decode(detail) = &err {
                warn!(attempt, error = %detail, "undecodable vendor response");
                return Err(CogitoError::unparsable(detail));
            }
            if !err.is_retryable() || !ctx.can_retry() {
                warn!(attempt, error = %err, "giving up");
                return Err(CogitoError::TransportExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = ctx.delay();
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
            self.sleeper.sleep(delay, &self.cancel)?;
        }
    }
}
