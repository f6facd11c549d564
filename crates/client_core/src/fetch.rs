//! Page loading with bounded retry and per-channel cancellation.
//!
//! Each attempt is a step in a small state machine: an attempt either yields a
//! page, fails for good, or schedules a backoff before the next attempt.
//! Cancellation is observed at every await point and always wins.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use shared::{
    domain::{ChannelId, MessageId},
    protocol::{MessagePayload, MessageQuery},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    e2ee::pending_decryptions,
    engine::SyncEngine,
    error::{EngineError, TransportError},
    model::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_step: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Linear backoff: one step after the first failure, two after the second.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt.saturating_add(1))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Page(Vec<MessagePayload>),
    Failed { attempts: u32, error: TransportError },
    Cancelled,
}

#[derive(Debug)]
pub enum FetchState {
    Attempting { attempt: u32 },
    BackingOff { attempt: u32, delay: Duration },
    Done(FetchOutcome),
}

/// Transition taken once attempt number `attempt` (zero-based) has resolved.
pub fn after_attempt(
    attempt: u32,
    result: Result<Vec<MessagePayload>, TransportError>,
    policy: &RetryPolicy,
    cancelled: bool,
) -> FetchState {
    if cancelled {
        return FetchState::Done(FetchOutcome::Cancelled);
    }
    match result {
        Ok(page) => FetchState::Done(FetchOutcome::Page(page)),
        Err(error) if error.is_transient() && attempt < policy.max_retries => {
            FetchState::BackingOff {
                attempt,
                delay: policy.backoff_for(attempt),
            }
        }
        Err(error) => FetchState::Done(FetchOutcome::Failed {
            attempts: attempt + 1,
            error,
        }),
    }
}

/// Drives `attempt_fn` through the retry state machine until it settles.
pub async fn run_fetch<F, Fut>(
    channel_id: &ChannelId,
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut attempt_fn: F,
) -> FetchOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<MessagePayload>, TransportError>>,
{
    let mut state = FetchState::Attempting { attempt: 0 };
    loop {
        state = match state {
            FetchState::Attempting { attempt } => {
                debug!(
                    channel_id = %channel_id,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    "fetch: page attempt"
                );
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return FetchOutcome::Cancelled,
                    result = tokio::time::timeout(policy.attempt_timeout, attempt_fn()) => {
                        result.unwrap_or(Err(TransportError::Timeout(policy.attempt_timeout)))
                    }
                };
                after_attempt(attempt, result, policy, token.is_cancelled())
            }
            FetchState::BackingOff { attempt, delay } => {
                warn!(
                    channel_id = %channel_id,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "fetch: transient failure, retrying"
                );
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return FetchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                if token.is_cancelled() {
                    FetchState::Done(FetchOutcome::Cancelled)
                } else {
                    FetchState::Attempting {
                        attempt: attempt + 1,
                    }
                }
            }
            FetchState::Done(outcome) => return outcome,
        };
    }
}

/// In-flight fetches keyed by channel. Starting a fetch for one channel
/// cancels whatever is still running for any other channel.
#[derive(Default)]
pub struct FetchRegistry {
    active: Mutex<HashMap<ChannelId, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl FetchRegistry {
    pub fn begin(&self, channel_id: &ChannelId) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|other, (_, other_token)| {
            if other == channel_id {
                return true;
            }
            info!(channel_id = %other, "fetch: cancelling fetch for deselected channel");
            other_token.cancel();
            false
        });
        active.insert(channel_id.clone(), (generation, token.clone()));
        (generation, token)
    }

    /// Unregisters the fetch if it is still the current one for the channel.
    pub fn finish(&self, channel_id: &ChannelId, generation: u64) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active
            .get(channel_id)
            .is_some_and(|(current, _)| *current == generation)
        {
            active.remove(channel_id);
        }
    }

    pub fn cancel(&self, channel_id: &ChannelId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, token)) = active.remove(channel_id) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, (_, token)) in active.drain() {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub before: Option<MessageId>,
    pub after: Option<MessageId>,
    /// Falls back to the configured page limit.
    pub limit: Option<u32>,
}

impl PageRequest {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn older_than(message_id: MessageId) -> Self {
        Self {
            before: Some(message_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// A load for this channel was already running; nothing was started.
    AlreadyLoading,
    Loaded { count: usize, has_more: bool },
    Cancelled,
    /// `load_older` found no more history to request.
    Exhausted,
}

struct LoadingGuard<'a> {
    engine: &'a SyncEngine,
    channel_id: ChannelId,
    generation: u64,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.engine.store.set_loading(&self.channel_id, false);
        self.engine.fetches.finish(&self.channel_id, self.generation);
    }
}

impl SyncEngine {
    /// Fetches one page and merges it. A page with `before` is older history
    /// and merges in front; anything else replaces the timeline.
    pub async fn load_page(
        &self,
        channel_id: &ChannelId,
        request: PageRequest,
    ) -> Result<PageOutcome, EngineError> {
        if !self.store.try_begin_loading(channel_id) {
            debug!(channel_id = %channel_id, "fetch: load already in progress");
            return Ok(PageOutcome::AlreadyLoading);
        }
        let (generation, token) = self.fetches.begin(channel_id);
        let _guard = LoadingGuard {
            engine: self,
            channel_id: channel_id.clone(),
            generation,
        };

        let limit = request
            .limit
            .unwrap_or(self.settings.page_limit)
            .clamp(1, crate::config::MAX_PAGE_LIMIT);
        let query = MessageQuery {
            before: request.before.clone(),
            after: request.after.clone(),
            limit,
        };
        let policy = self.settings.retry_policy();
        let outcome = run_fetch(channel_id, &policy, &token, || {
            self.transport.fetch_messages(channel_id, &query)
        })
        .await;

        match outcome {
            FetchOutcome::Page(page) => {
                if token.is_cancelled() {
                    debug!(channel_id = %channel_id, "fetch: discarding page for cancelled load");
                    return Ok(PageOutcome::Cancelled);
                }
                let count = page.len();
                let has_more = count == limit as usize;
                self.merge_page(channel_id, page, request.before.is_some());
                self.store.set_has_more(channel_id, has_more);
                info!(channel_id = %channel_id, count, has_more, "fetch: page merged");
                Ok(PageOutcome::Loaded { count, has_more })
            }
            FetchOutcome::Cancelled => {
                debug!(channel_id = %channel_id, "fetch: load cancelled");
                Ok(PageOutcome::Cancelled)
            }
            FetchOutcome::Failed { attempts, error } => {
                warn!(channel_id = %channel_id, attempts, %error, "fetch: page load failed");
                let error = EngineError::from_transport(error, attempts);
                self.report(&error);
                Err(error)
            }
        }
    }

    /// Requests the page preceding the oldest loaded message.
    pub async fn load_older(&self, channel_id: &ChannelId) -> Result<PageOutcome, EngineError> {
        let timeline = self.store.timeline(channel_id);
        let Some(oldest) = timeline.messages.first() else {
            return self.load_page(channel_id, PageRequest::latest()).await;
        };
        if !timeline.has_more {
            return Ok(PageOutcome::Exhausted);
        }
        self.load_page(channel_id, PageRequest::older_than(oldest.id.clone()))
            .await
    }

    /// Cancels any in-flight load for the channel. The loading flag clears
    /// once the load observes the cancellation.
    pub fn cancel_load(&self, channel_id: &ChannelId) {
        self.fetches.cancel(channel_id);
    }

    fn merge_page(&self, channel_id: &ChannelId, page: Vec<MessagePayload>, older: bool) {
        // Pages arrive newest first.
        let messages: Vec<Message> = page.into_iter().rev().map(Message::from_payload).collect();
        let pending = pending_decryptions(&messages);

        if older {
            self.store.prepend(channel_id, messages);
        } else {
            self.store.clear_polls(channel_id);
            self.store.replace(channel_id, messages);
        }
        if !pending.is_empty() {
            self.e2ee.schedule(channel_id, pending);
        }
    }
}

#[cfg(test)]
#[path = "tests/fetch_tests.rs"]
mod tests;
