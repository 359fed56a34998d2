// SPDX-License-Identifier: MIT OR Apache-2.0
//! Candidate selection and the failover loop.

use crate::classify::{FailureClass, classify_response, parse_retry_after};
use crate::cooldown::CooldownMap;
use crate::provider::{AssistEvent, AssistReply, AssistRequest, Candidate, ProviderFailure};
use crate::storm::{StormControl, StormOutcome};
use chrono::Utc;
use ocw_core::TraceId;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Failover layer configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Per-call timeout.
    pub timeout: Duration,
    /// Storm dedupe window.
    pub storm_window: Duration,
    /// How long a storm waiter blocks before fast-failing onward.
    pub storm_wait: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            storm_window: Duration::from_secs(10),
            storm_wait: Duration::from_secs(2),
        }
    }
}

/// Terminal failover outcomes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FailoverError {
    /// Every candidate is cooling or failed.
    #[error("no provider available")]
    Unavailable {
        /// Soonest cooldown expiry across candidates, for `Retry-After`.
        retry_after: Option<Duration>,
    },
    /// The request itself is invalid; no candidate can serve it.
    #[error("provider rejected request: {detail}")]
    InvalidRequest {
        /// Provider status code.
        status: u16,
        /// Truncated provider detail.
        detail: String,
    },
    /// No candidates are configured at all.
    #[error("no providers configured")]
    NoCandidates,
}

/// Notes the router surfaces to the observability layer.
#[derive(Debug, Clone)]
pub enum FailoverNote {
    /// A candidate entered cooldown.
    Cooldown {
        /// Provider id.
        provider_id: String,
        /// Model.
        model: String,
        /// Failure class that triggered it.
        class: FailureClass,
    },
    /// A concurrent request was coalesced or skipped by storm control.
    StormDrop {
        /// Provider id.
        provider_id: String,
        /// Model.
        model: String,
    },
}

/// Observer hook for [`FailoverNote`]s (trace/bus wiring lives upstream).
pub type FailoverObserver = Arc<dyn Fn(&TraceId, FailoverNote) + Send + Sync>;

/// Orders candidates, applies cooldowns and storms, runs the failover loop.
pub struct FailoverRouter {
    candidates: Vec<Candidate>,
    cooldowns: Arc<CooldownMap>,
    storms: Arc<StormControl>,
    http: reqwest::Client,
    config: FailoverConfig,
    observer: Option<FailoverObserver>,
}

impl FailoverRouter {
    /// Build a router over ordered candidates.
    #[must_use]
    pub fn new(candidates: Vec<Candidate>, config: FailoverConfig) -> Self {
        Self {
            candidates,
            cooldowns: Arc::new(CooldownMap::new()),
            storms: Arc::new(StormControl::new(config.storm_window)),
            http: reqwest::Client::new(),
            config,
            observer: None,
        }
    }

    /// Attach an observer for cooldown/storm notes.
    #[must_use]
    pub fn with_observer(mut self, observer: FailoverObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Shared cooldown state (capabilities/diagnostics read it).
    #[must_use]
    pub fn cooldowns(&self) -> Arc<CooldownMap> {
        Arc::clone(&self.cooldowns)
    }

    /// Configured candidates.
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    fn note(&self, trace_id: &TraceId, note: FailoverNote) {
        if let Some(observer) = &self.observer {
            observer(trace_id, note);
        }
    }

    /// Deterministic candidate order: available first, score-descending,
    /// ties broken by a hash of `(trace seed, candidate)` so identical state
    /// plus an identical seed always yields the same order.
    #[must_use]
    pub fn select_order(&self, trace_id: &TraceId) -> Vec<usize> {
        let now = Utc::now();
        let mut order: Vec<usize> = (0..self.candidates.len())
            .filter(|&i| {
                let c = &self.candidates[i];
                !self.cooldowns.in_cooldown(&c.provider_id, &c.model, now)
            })
            .collect();
        order.sort_by(|&a, &b| {
            let ca = &self.candidates[a];
            let cb = &self.candidates[b];
            let score_a = self.cooldowns.score(&ca.provider_id, &ca.model);
            let score_b = self.cooldowns.score(&cb.provider_id, &cb.model);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tiebreak(trace_id, ca).cmp(&tiebreak(trace_id, cb)))
        });
        order
    }

    /// Soonest cooldown expiry across all candidates.
    fn soonest_recovery(&self) -> Option<Duration> {
        let now = Utc::now();
        self.candidates
            .iter()
            .filter_map(|c| self.cooldowns.remaining(&c.provider_id, &c.model, now))
            .min()
    }

    /// Non-streaming failover call.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] when no candidate can serve the request.
    pub async fn invoke(
        &self,
        request: &AssistRequest,
        trace_id: &TraceId,
    ) -> Result<AssistReply, FailoverError> {
        if self.candidates.is_empty() {
            return Err(FailoverError::NoCandidates);
        }

        for index in self.select_order(trace_id) {
            let candidate = &self.candidates[index];
            match self.try_candidate(candidate, request, trace_id).await {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(FailoverError::Unavailable {
            retry_after: self.soonest_recovery(),
        })
    }

    /// Attempt one candidate. `Ok(None)` means "move to the next one".
    async fn try_candidate(
        &self,
        candidate: &Candidate,
        request: &AssistRequest,
        trace_id: &TraceId,
    ) -> Result<Option<AssistReply>, FailoverError> {
        if !self.enter_storm_gate(candidate, trace_id).await {
            return Ok(None);
        }

        let result = candidate
            .call(&self.http, request, self.config.timeout)
            .await;
        self.storms.resolve(&candidate.provider_id, &candidate.model);

        match result {
            Ok(reply) => {
                self.cooldowns
                    .record_success(&candidate.provider_id, &candidate.model);
                info!(
                    provider = %candidate.provider_id,
                    model = %candidate.model,
                    "assist call served"
                );
                Ok(Some(reply))
            }
            Err(failure) => self.absorb_failure(candidate, failure, trace_id),
        }
    }

    /// Gate a suspect candidate through storm control.
    ///
    /// Healthy candidates are not gated. Returns `false` when the caller
    /// should skip this candidate (storm waiter woke into a cooldown or the
    /// probe slot stayed busy).
    async fn enter_storm_gate(&self, candidate: &Candidate, trace_id: &TraceId) -> bool {
        let suspect = self
            .cooldowns
            .entry(&candidate.provider_id, &candidate.model)
            .map(|e| e.consecutive_failures > 0)
            .unwrap_or(false);
        if !suspect {
            return true;
        }

        match self.storms.enter(&candidate.provider_id, &candidate.model) {
            StormOutcome::Proceed => true,
            StormOutcome::Wait(notify) => {
                self.note(
                    trace_id,
                    FailoverNote::StormDrop {
                        provider_id: candidate.provider_id.clone(),
                        model: candidate.model.clone(),
                    },
                );
                let _ = tokio::time::timeout(self.config.storm_wait, notify.notified()).await;
                // Woken (or timed out): if the probe put the pair into
                // cooldown, skip; if it recovered, claim the slot.
                if self
                    .cooldowns
                    .in_cooldown(&candidate.provider_id, &candidate.model, Utc::now())
                {
                    return false;
                }
                matches!(
                    self.storms.enter(&candidate.provider_id, &candidate.model),
                    StormOutcome::Proceed
                )
            }
        }
    }

    /// Classify a failure, update cooldowns, decide whether to fail over.
    fn absorb_failure(
        &self,
        candidate: &Candidate,
        failure: ProviderFailure,
        trace_id: &TraceId,
    ) -> Result<Option<AssistReply>, FailoverError> {
        let (class, reset_hint, status, detail) = match &failure {
            ProviderFailure::Http {
                status,
                headers,
                body,
            } => (
                classify_response(*status, body),
                parse_retry_after(headers, body),
                *status,
                body.clone(),
            ),
            ProviderFailure::Timeout => (FailureClass::Timeout, None, 0, "timeout".to_string()),
            ProviderFailure::Transport(message) | ProviderFailure::Malformed(message) => {
                (FailureClass::ServerError, None, 0, message.clone())
            }
        };

        warn!(
            provider = %candidate.provider_id,
            model = %candidate.model,
            ?class,
            "assist call failed"
        );

        if class == FailureClass::InvalidRequest {
            // The same request fails everywhere; do not poison other
            // candidates' scores for it.
            return Err(FailoverError::InvalidRequest { status, detail });
        }

        self.cooldowns
            .record_failure(&candidate.provider_id, &candidate.model, class, reset_hint);
        self.note(
            trace_id,
            FailoverNote::Cooldown {
                provider_id: candidate.provider_id.clone(),
                model: candidate.model.clone(),
                class,
            },
        );
        Ok(None)
    }

    /// Streaming failover call; events land on the returned channel.
    ///
    /// Failover happens only before the first delta; once a candidate has
    /// streamed output, its failure surfaces as an `Error` event and the
    /// client falls back to the non-streaming contract.
    #[must_use]
    pub fn invoke_stream(
        self: &Arc<Self>,
        request: AssistRequest,
        trace_id: TraceId,
    ) -> mpsc::Receiver<AssistEvent> {
        let (tx, rx) = mpsc::channel(64);
        let router = Arc::clone(self);
        let _stream_task = tokio::spawn(async move {
            router.run_stream(request, trace_id, tx).await;
        });
        rx
    }

    async fn run_stream(
        &self,
        request: AssistRequest,
        trace_id: TraceId,
        tx: mpsc::Sender<AssistEvent>,
    ) {
        if self.candidates.is_empty() {
            let _ = tx
                .send(AssistEvent::Error {
                    error: "provider_unavailable".into(),
                    detail: "no providers configured".into(),
                })
                .await;
            return;
        }

        for index in self.select_order(&trace_id) {
            let candidate = &self.candidates[index];
            if !self.enter_storm_gate(candidate, &trace_id).await {
                continue;
            }
            if tx
                .send(AssistEvent::Stage {
                    detail: format!("trying {}/{}", candidate.provider_id, candidate.model),
                })
                .await
                .is_err()
            {
                // Client went away; stop issuing provider calls.
                self.storms.resolve(&candidate.provider_id, &candidate.model);
                return;
            }

            let (delta_tx, mut delta_rx) = mpsc::channel::<AssistEvent>(64);
            let forward_tx = tx.clone();
            let forwarder = tokio::spawn(async move {
                let mut forwarded = 0usize;
                while let Some(event) = delta_rx.recv().await {
                    forwarded += 1;
                    if forward_tx.send(event).await.is_err() {
                        break;
                    }
                }
                forwarded
            });

            let result = candidate
                .call_streaming(&self.http, &request, self.config.timeout, &delta_tx)
                .await;
            drop(delta_tx);
            let streamed = forwarder.await.unwrap_or(0);
            self.storms.resolve(&candidate.provider_id, &candidate.model);

            match result {
                Ok(reply) => {
                    self.cooldowns
                        .record_success(&candidate.provider_id, &candidate.model);
                    let _ = tx.send(AssistEvent::Final { reply }).await;
                    return;
                }
                Err(failure) => {
                    let terminal = streamed > 0;
                    match self.absorb_failure(candidate, failure, &trace_id) {
                        Err(FailoverError::InvalidRequest { status, detail }) => {
                            let _ = tx
                                .send(AssistEvent::Error {
                                    error: "invalid_request".into(),
                                    detail: format!("status {status}: {detail}"),
                                })
                                .await;
                            return;
                        }
                        _ if terminal => {
                            // Mid-stream degradation: the client retries on
                            // the non-streaming path.
                            let _ = tx
                                .send(AssistEvent::Error {
                                    error: "provider_unavailable".into(),
                                    detail: "stream interrupted".into(),
                                })
                                .await;
                            return;
                        }
                        _ => continue,
                    }
                }
            }
        }

        let _ = tx
            .send(AssistEvent::Error {
                error: "provider_unavailable".into(),
                detail: "all candidates cooling or failing".into(),
            })
            .await;
    }
}

/// Stable tiebreak hash over `(trace seed, candidate identity)`.
fn tiebreak(trace_id: &TraceId, candidate: &Candidate) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(trace_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(candidate.provider_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(candidate.model.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}
