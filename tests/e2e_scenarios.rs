// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-crate end-to-end scenarios: webhook submission with callback
//! delivery, scheduler catch-up through the real admission pipeline, and
//! assist failover through the HTTP surface.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use ocw_approval::ApprovalStore;
use ocw_auth::{WebhookAuth, webhook_signature};
use ocw_config::{ConfigStore, Settings};
use ocw_daemon::{AppState, BridgeDeviceMap, LogRing, PresetStore, build_app};
use ocw_engine::{CallbackWatcher, DeadLetterLog, EngineClient, WatcherConfig};
use ocw_failover::{Candidate, FailoverConfig, FailoverRouter, ProviderApi};
use ocw_gate::{InflightGate, RateLimiter};
use ocw_idempotency::IdempotencyStore;
use ocw_redact::{EventBus, TraceStore, TraceStoreConfig};
use ocw_safeio::IoPolicy;
use ocw_scheduler::{
    MissedPolicy, RunStore, RunStoreConfig, ScheduleAdmitter, ScheduleSpec, ScheduleStore, Ticker,
    TickerConfig, TriggerSpec,
};
use ocw_template::TemplateRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WEBHOOK_SECRET: &str = "wh-secret";

struct Harness {
    state: Arc<AppState>,
    app: Router,
}

fn harness(engine_url: &str, tune: impl FnOnce(&mut Settings)) -> Harness {
    let mut settings = Settings::from_lookup(|_| None).unwrap();
    settings.engine_url = engine_url.to_string();
    settings.auth.webhook = WebhookAuth::Hmac(WEBHOOK_SECRET.into());
    settings.auth.admin_token = Some("adm".into());
    tune(&mut settings);

    let traces = Arc::new(TraceStore::new(TraceStoreConfig::default()));
    let bus = Arc::new(EventBus::new());
    let logring = Arc::new(LogRing::new(1024));
    let _drain = logring.attach(&bus);
    let deadletter = Arc::new(DeadLetterLog::new(16));

    let engine = EngineClient::new(engine_url, Duration::from_secs(5)).unwrap();
    let callback_policy = IoPolicy {
        allow_http: settings.safety.allow_insecure_base_url,
        allowed_hosts: settings.safety.callback_allow_hosts.clone(),
        allow_loopback_for: Default::default(),
        // Test destinations listen on loopback.
        allow_private: true,
        max_redirects: 3,
    };
    let watcher = Arc::new(CallbackWatcher::new(
        engine.clone(),
        callback_policy,
        Arc::clone(&traces),
        Arc::clone(&bus),
        Arc::clone(&deadletter),
        WatcherConfig {
            poll_interval: Duration::from_millis(20),
            poll_interval_cap: Duration::from_millis(50),
            poll_ttl: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(2),
            delivery_secrets: HashMap::new(),
        },
    ));

    let failover = Arc::new(FailoverRouter::new(
        settings.llm_candidates.clone(),
        FailoverConfig {
            timeout: Duration::from_secs(5),
            storm_window: Duration::from_secs(10),
            storm_wait: Duration::from_millis(100),
        },
    ));

    let posture = settings.posture_snapshot(false);
    let inflight = InflightGate::new(settings.budgets.inflight.clone());
    let state = Arc::new(AppState {
        posture,
        traces,
        bus,
        logring,
        idempotency: Arc::new(IdempotencyStore::new(256, Duration::from_secs(600))),
        templates: Arc::new(TemplateRegistry::with_builtins()),
        approvals: Arc::new(ApprovalStore::in_memory()),
        inflight,
        limiter: Arc::new(RateLimiter::new()),
        engine,
        watcher,
        deadletter,
        schedules: Arc::new(ScheduleStore::in_memory()),
        runs: Arc::new(RunStore::in_memory(RunStoreConfig::default())),
        failover,
        config_store: Arc::new(ConfigStore::in_memory()),
        presets: Arc::new(PresetStore::in_memory()),
        bridge_devices: Arc::new(BridgeDeviceMap::default()),
        started_at: Instant::now(),
        settings,
    });
    let app = build_app(Arc::clone(&state));
    Harness { state, app }
}

fn signed_webhook(body: &serde_json::Value, nonce: &str) -> Request<Body> {
    let body_bytes = serde_json::to_vec(body).unwrap();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = webhook_signature(
        WEBHOOK_SECRET,
        "POST",
        "/openclaw/webhook",
        &timestamp,
        nonce,
        &body_bytes,
    );
    Request::builder()
        .method("POST")
        .uri("/openclaw/webhook")
        .header("content-type", "application/json")
        .header("x-timestamp", timestamp)
        .header("x-nonce", nonce)
        .header("x-signature", signature)
        .body(Body::from(body_bytes))
        .unwrap()
}

async fn json_response(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn host_port(server: &MockServer) -> String {
    let url = reqwest::Url::parse(&server.uri()).unwrap();
    format!("{}:{}", url.host_str().unwrap(), url.port().unwrap())
}

// ---------------------------------------------------------------------------
// Webhook submit with callback, delivered end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn webhook_with_callback_delivers_results() {
    let engine = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"prompt_id": "p-cb"})),
        )
        .mount(&engine)
        .await;
    Mock::given(method("GET"))
        .and(path("/history/p-cb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "p-cb": {
                "outputs": {
                    "9": {"images": [{"filename": "cat.png", "subfolder": "", "type": "output"}]}
                }
            }
        })))
        .mount(&engine)
        .await;

    let destination = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&destination)
        .await;

    let destination_host = host_port(&destination);
    let harness = harness(&engine.uri(), |settings| {
        settings.safety.allow_insecure_base_url = true;
        settings.safety.callback_allow_hosts.insert(destination_host);
    });

    let body = serde_json::json!({
        "template_id": "sdxl_basic",
        "inputs": {"prompt": "a cat"},
        "callback": {"url": format!("{}/hook", destination.uri())}
    });
    let (status, envelope) = json_response(harness.app.clone(), signed_webhook(&body, "n-1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(envelope["data"]["prompt_id"], "p-cb");

    // Wait for poll + delivery.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let delivered = destination
            .received_requests()
            .await
            .unwrap()
            .iter()
            .any(|r| r.url.path() == "/hook");
        if delivered {
            break;
        }
        assert!(Instant::now() < deadline, "delivery did not happen in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The delivered payload carries status, outputs, and the trace id.
    let requests = destination.received_requests().await.unwrap();
    let delivery = requests.iter().find(|r| r.url.path() == "/hook").unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["prompt_id"], "p-cb");
    assert_eq!(payload["outputs"][0]["filename"], "cat.png");
    assert!(
        payload["outputs"][0]["view_url"]
            .as_str()
            .unwrap()
            .contains("filename=cat.png")
    );
    assert!(payload["trace_id"].is_string());
    assert!(harness.state.deadletter.is_empty());
}

// ---------------------------------------------------------------------------
// Scheduler catch-up through the real pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduler_catchup_admits_through_pipeline_without_duplicates() {
    let engine = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"prompt_id": "p-s"})),
        )
        .mount(&engine)
        .await;

    let harness = harness(&engine.uri(), |_| {});
    let pipeline = Arc::new(harness.state.pipeline());
    let ticker = Ticker::new(
        Arc::clone(&harness.state.schedules),
        Arc::clone(&harness.state.runs),
        pipeline as Arc<dyn ScheduleAdmitter>,
        TickerConfig {
            tick_interval: Duration::from_secs(3600),
            max_catchup_per_tick: 3,
            jitter_max: Duration::ZERO,
        },
    );

    let schedule = harness
        .state
        .schedules
        .create(ScheduleSpec {
            name: "every-10-min".into(),
            trigger: TriggerSpec::Interval { secs: 600 },
            template_id: "sdxl_basic".into(),
            inputs: [(
                "prompt".to_string(),
                ocw_core::InputValue::Str("scheduled cat".into()),
            )]
            .into_iter()
            .collect(),
            enabled: true,
            serial: false,
            missed_policy: MissedPolicy::CatchUp,
        })
        .unwrap();

    // 90 minutes of downtime: 9 due firings, capped at 3 per tick.
    let now = schedule.last_tick_ts + ChronoDuration::minutes(90);
    assert_eq!(ticker.run_tick(now).await.fired, 3);
    assert_eq!(ticker.run_tick(now).await.fired, 3);
    assert_eq!(ticker.run_tick(now).await.fired, 3);
    assert_eq!(ticker.run_tick(now).await.fired, 0);

    // Exactly one engine submission per firing, one RunRecord per fire_ts.
    let submissions = engine
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/prompt")
        .count();
    assert_eq!(submissions, 9);

    let runs = harness.state.runs.for_schedule(&schedule.schedule_id);
    assert_eq!(runs.len(), 9);
    let mut fire_ts: Vec<_> = runs.iter().map(|r| r.fire_ts).collect();
    fire_ts.sort();
    fire_ts.dedup();
    assert_eq!(fire_ts.len(), 9);

    // A rerun of the same window is suppressed by run history + fire keys.
    assert_eq!(ticker.run_tick(now).await.fired, 0);
    assert_eq!(
        harness.state.runs.for_schedule(&schedule.schedule_id).len(),
        9
    );
}

// ---------------------------------------------------------------------------
// Assist failover over the HTTP surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn assist_fails_over_and_reports_provider() {
    let engine = MockServer::start().await;
    let limited = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "60"))
        .mount(&limited)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "a cat, cinematic lighting"}}]
        })))
        .mount(&healthy)
        .await;

    let harness = harness(&engine.uri(), |settings| {
        settings.llm_candidates = vec![
            Candidate {
                provider_id: "a".into(),
                model: "m".into(),
                base_url: limited.uri(),
                api: ProviderApi::OpenAiChat,
                api_key: None,
            },
            Candidate {
                provider_id: "b".into(),
                model: "m".into(),
                base_url: healthy.uri(),
                api: ProviderApi::OpenAiChat,
                api_key: None,
            },
        ];
    });
    // Bias selection so the rate-limited provider is tried first.
    harness.state.failover.cooldowns().record_success("a", "m");

    let request = Request::builder()
        .method("POST")
        .uri("/openclaw/assist/planner")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"prompt": "make this cat prompt better"}"#))
        .unwrap();
    let (status, envelope) = json_response(harness.app.clone(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["data"]["provider_id"], "b");
    assert_eq!(envelope["data"]["text"], "a cat, cinematic lighting");

    // The rate-limited provider is cooling with the advertised horizon.
    let cooldowns = harness.state.failover.cooldowns();
    assert!(cooldowns.in_cooldown("a", "m", Utc::now()));

    // A second call goes straight to the healthy provider.
    let request = Request::builder()
        .method("POST")
        .uri("/openclaw/assist/refiner")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"prompt": "again"}"#))
        .unwrap();
    let (status, envelope) = json_response(harness.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["data"]["provider_id"], "b");
    assert_eq!(
        limited.received_requests().await.unwrap().len(),
        1,
        "cooling provider must not be retried"
    );
}
