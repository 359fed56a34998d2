// SPDX-License-Identifier: MIT OR Apache-2.0
//! Callback watcher: poll history, assemble the result, deliver it.
//!
//! One task per watched job. Polling is bounded by interval and an overall
//! TTL; delivery retries with exponential backoff, honoring `Retry-After`
//! from the destination. Exhausted deliveries land in the dead-letter log.

use crate::client::{EngineClient, HistoryOutcome, JobOutput};
use crate::deadletter::{DeadLetter, DeadLetterLog};
use chrono::Utc;
use hmac::{Hmac, Mac};
use ocw_core::{CallbackAuthMode, CallbackDescriptor, EventKind, JobSpec};
use ocw_redact::{EventBus, TraceStore};
use ocw_safeio::{IoPolicy, OutboundRequest, SafeIoError, open, policy_client};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Polling and delivery knobs.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Base interval between history polls.
    pub poll_interval: Duration,
    /// Hard cap on the jittered poll interval.
    pub poll_interval_cap: Duration,
    /// Overall time to keep polling one job.
    pub poll_ttl: Duration,
    /// Per-attempt delivery timeout.
    pub delivery_timeout: Duration,
    /// Secrets available to callback auth, keyed by `secret_ref`.
    pub delivery_secrets: HashMap<String, String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            poll_interval_cap: Duration::from_secs(10),
            poll_ttl: Duration::from_secs(600),
            delivery_timeout: Duration::from_secs(15),
            delivery_secrets: HashMap::new(),
        }
    }
}

/// Watches jobs with callbacks and pushes their results out.
pub struct CallbackWatcher {
    engine: EngineClient,
    policy: IoPolicy,
    http: reqwest::Client,
    traces: Arc<TraceStore>,
    bus: Arc<EventBus>,
    deadletter: Arc<DeadLetterLog>,
    config: WatcherConfig,
}

impl CallbackWatcher {
    /// Create a watcher delivering through the given callback policy.
    #[must_use]
    pub fn new(
        engine: EngineClient,
        policy: IoPolicy,
        traces: Arc<TraceStore>,
        bus: Arc<EventBus>,
        deadletter: Arc<DeadLetterLog>,
        config: WatcherConfig,
    ) -> Self {
        let http = policy_client(config.delivery_timeout);
        Self {
            engine,
            policy,
            http,
            traces,
            bus,
            deadletter,
            config,
        }
    }

    /// Shared dead-letter log (read surface).
    #[must_use]
    pub fn deadletter(&self) -> Arc<DeadLetterLog> {
        Arc::clone(&self.deadletter)
    }

    /// Spawn the watch task for one submitted job.
    ///
    /// The job must carry a callback; jobs without one are not watched.
    pub fn spawn(self: &Arc<Self>, job: JobSpec, prompt_id: String) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.run(job, prompt_id).await;
        })
    }

    async fn run(&self, job: JobSpec, prompt_id: String) {
        let Some(callback) = job.callback.clone() else {
            return;
        };

        let outcome = self.poll_until_ready(&prompt_id).await;
        let (status, outputs, error) = match outcome {
            Ok(outputs) => {
                self.traces.append(
                    &job.trace_id,
                    EventKind::HistoryReady,
                    serde_json::json!({"prompt_id": prompt_id, "outputs": outputs.len()}),
                );
                self.bus.publish(
                    &job.trace_id,
                    EventKind::HistoryReady,
                    serde_json::json!({"prompt_id": prompt_id}),
                );
                ("completed", outputs, None)
            }
            Err(message) => ("failed", Vec::new(), Some(message)),
        };

        let payload = serde_json::json!({
            "status": status,
            "prompt_id": prompt_id,
            "trace_id": job.trace_id.as_str(),
            "outputs": outputs,
            "error": error,
        });
        self.deliver(&job, &prompt_id, &callback, payload).await;
    }

    /// Poll history until the job resolves or the TTL elapses.
    async fn poll_until_ready(&self, prompt_id: &str) -> Result<Vec<JobOutput>, String> {
        let deadline = tokio::time::Instant::now() + self.config.poll_ttl;
        loop {
            match self.engine.history(prompt_id).await {
                Ok(HistoryOutcome::Ready(outputs)) => return Ok(outputs),
                Ok(HistoryOutcome::Failed(message)) => return Err(message),
                Ok(HistoryOutcome::Pending) => {}
                // Transient history errors are absorbed by the next poll.
                Err(err) => warn!(prompt_id, error = %err, "history poll failed"),
            }

            let interval = jittered(self.config.poll_interval).min(self.config.poll_interval_cap);
            if tokio::time::Instant::now() + interval >= deadline {
                return Err("poll ttl exhausted".to_string());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Deliver with bounded retries and exponential backoff.
    async fn deliver(
        &self,
        job: &JobSpec,
        prompt_id: &str,
        callback: &CallbackDescriptor,
        payload: serde_json::Value,
    ) {
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let url = match reqwest::Url::parse(&callback.url) {
            Ok(url) => url,
            Err(e) => {
                self.abandon(job, prompt_id, callback, 0, format!("bad url: {e}"));
                return;
            }
        };

        let mut last_error = String::new();
        for attempt in 0..callback.max_attempts {
            let mut request = OutboundRequest::post_json(url.clone(), body.clone());
            self.attach_auth(callback, &body, &mut request);

            match open(&self.http, request, &self.policy, None).await {
                Ok(response) if response.status().is_success() => {
                    info!(prompt_id, url = %callback.url, attempt, "callback delivered");
                    self.traces.append(
                        &job.trace_id,
                        EventKind::DeliverOk,
                        serde_json::json!({"url": callback.url, "attempt": attempt}),
                    );
                    self.bus.publish(
                        &job.trace_id,
                        EventKind::DeliverOk,
                        serde_json::json!({"prompt_id": prompt_id}),
                    );
                    return;
                }
                Ok(response) => {
                    let status = response.status();
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    last_error = format!("destination status {status}");
                    self.record_attempt_failure(job, callback, attempt, &last_error);
                    if attempt + 1 < callback.max_attempts {
                        tokio::time::sleep(retry_delay(callback, attempt, retry_after)).await;
                    }
                }
                Err(SafeIoError::Blocked { reason }) => {
                    // Policy refusals are terminal; retrying cannot help.
                    self.abandon(job, prompt_id, callback, attempt + 1, format!("ssrf_blocked: {reason}"));
                    return;
                }
                Err(SafeIoError::Transport(message)) => {
                    last_error = message;
                    self.record_attempt_failure(job, callback, attempt, &last_error);
                    if attempt + 1 < callback.max_attempts {
                        tokio::time::sleep(retry_delay(callback, attempt, None)).await;
                    }
                }
            }
        }
        self.abandon(job, prompt_id, callback, callback.max_attempts, last_error);
    }

    fn attach_auth(
        &self,
        callback: &CallbackDescriptor,
        body: &[u8],
        request: &mut OutboundRequest,
    ) {
        let secret = callback
            .secret_ref
            .as_deref()
            .and_then(|name| self.config.delivery_secrets.get(name));
        match (callback.auth_mode, secret) {
            (CallbackAuthMode::Hmac, Some(secret)) => {
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("hmac accepts any key length");
                mac.update(body);
                let digest = mac.finalize().into_bytes();
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                request
                    .headers
                    .push(("x-signature".into(), format!("sha256={hex}")));
            }
            (CallbackAuthMode::Bearer, Some(secret)) => {
                request
                    .headers
                    .push(("authorization".into(), format!("Bearer {secret}")));
            }
            _ => {}
        }
    }

    fn record_attempt_failure(
        &self,
        job: &JobSpec,
        callback: &CallbackDescriptor,
        attempt: u32,
        error: &str,
    ) {
        warn!(url = %callback.url, attempt, error, "callback delivery attempt failed");
        self.traces.append(
            &job.trace_id,
            EventKind::DeliverFail,
            serde_json::json!({"url": callback.url, "attempt": attempt, "error": error}),
        );
        self.bus.publish(
            &job.trace_id,
            EventKind::DeliverFail,
            serde_json::json!({"attempt": attempt}),
        );
    }

    fn abandon(
        &self,
        job: &JobSpec,
        prompt_id: &str,
        callback: &CallbackDescriptor,
        attempts: u32,
        last_error: String,
    ) {
        warn!(prompt_id, url = %callback.url, attempts, "callback dead-lettered");
        self.deadletter.push(DeadLetter {
            prompt_id: prompt_id.to_string(),
            trace_id: job.trace_id.as_str().to_string(),
            url: callback.url.clone(),
            attempts,
            last_error,
            abandoned_at: Utc::now(),
        });
    }
}

/// Exponential backoff with jitter, bounded by `Retry-After` when present.
fn retry_delay(callback: &CallbackDescriptor, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = Duration::from_millis(callback.backoff_base_ms);
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let delay = jittered(exp).min(Duration::from_secs(60));
    match retry_after {
        Some(hint) => delay.max(hint),
        None => delay,
    }
}

/// Subtract up to half the nominal delay, seeded from the clock.
fn jittered(nominal: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let millis = nominal.as_millis() as u64;
    if millis == 0 {
        return nominal;
    }
    let jitter = nanos % (millis / 2 + 1);
    Duration::from_millis(millis - jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocw_core::{Source, TraceId};
    use ocw_redact::TraceStoreConfig;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn watcher_for(server: &MockServer, secrets: HashMap<String, String>) -> Arc<CallbackWatcher> {
        let uri = server.uri();
        let url = reqwest::Url::parse(&uri).unwrap();
        let host_port = format!("{}:{}", url.host_str().unwrap(), url.port().unwrap());
        let mut policy = IoPolicy::for_hosts([host_port]);
        policy.allow_http = true;
        policy.allow_private = true;

        let engine = EngineClient::new(&uri, Duration::from_secs(5)).unwrap();
        Arc::new(CallbackWatcher::new(
            engine,
            policy,
            Arc::new(TraceStore::new(TraceStoreConfig::default())),
            Arc::new(EventBus::new()),
            Arc::new(DeadLetterLog::new(16)),
            WatcherConfig {
                poll_interval: Duration::from_millis(20),
                poll_interval_cap: Duration::from_millis(50),
                poll_ttl: Duration::from_secs(5),
                delivery_timeout: Duration::from_secs(2),
                delivery_secrets: secrets,
            },
        ))
    }

    fn job_with_callback(server: &MockServer, auth_mode: CallbackAuthMode) -> JobSpec {
        let mut job = JobSpec::new(
            "sdxl_basic",
            BTreeMap::new(),
            Source::Webhook,
            TraceId("t-w".into()),
        );
        job.callback = Some(CallbackDescriptor {
            url: format!("{}/hook", server.uri()),
            auth_mode,
            secret_ref: Some("cb".into()),
            max_attempts: 3,
            backoff_base_ms: 10,
        });
        job
    }

    fn ready_history(prompt_id: &str) -> serde_json::Value {
        serde_json::json!({
            prompt_id: {
                "outputs": {
                    "9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}
                }
            }
        })
    }

    #[tokio::test]
    async fn delivers_completed_payload_with_signature() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ready_history("p-1")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("x-signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let secrets = HashMap::from([("cb".to_string(), "s3cret".to_string())]);
        let watcher = watcher_for(&server, secrets);
        let job = job_with_callback(&server, CallbackAuthMode::Hmac);
        watcher.spawn(job, "p-1".into()).await.unwrap();
        assert!(watcher.deadletter().is_empty());
    }

    #[tokio::test]
    async fn retries_then_dead_letters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ready_history("p-2")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let watcher = watcher_for(&server, HashMap::new());
        let job = job_with_callback(&server, CallbackAuthMode::None);
        watcher.spawn(job, "p-2".into()).await.unwrap();

        let letters = watcher.deadletter().entries();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].prompt_id, "p-2");
        assert_eq!(letters[0].attempts, 3);
    }

    #[tokio::test]
    async fn failed_job_delivers_failure_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "p-3": {"status": {"status_str": "error", "messages": ["oom"]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let watcher = watcher_for(&server, HashMap::new());
        let job = job_with_callback(&server, CallbackAuthMode::None);
        watcher.spawn(job, "p-3".into()).await.unwrap();
        assert!(watcher.deadletter().is_empty());
    }

    #[test]
    fn retry_delay_honors_retry_after_floor() {
        let callback = CallbackDescriptor {
            url: "https://x.example/h".into(),
            auth_mode: CallbackAuthMode::None,
            secret_ref: None,
            max_attempts: 5,
            backoff_base_ms: 10,
        };
        let delay = retry_delay(&callback, 0, Some(Duration::from_secs(30)));
        assert!(delay >= Duration::from_secs(30));
    }
}
