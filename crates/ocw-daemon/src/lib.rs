// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control plane for the OpenClaw render pipeline.
//!
//! The daemon wires every subsystem together: the admission pipeline, the
//! admin/observability surface, webhook ingestion, assist endpoints, the
//! bridge subtree, and the SSE event stream. Routes live under the
//! canonical `/openclaw/` prefix; the legacy `/moltbot/` alias maps onto
//! the same handlers for read-only and webhook paths.
#![deny(unsafe_code)]

mod api;
mod approvals_api;
mod assist;
mod bridge;
mod logring;
mod middleware;
mod normalize;
mod pipeline;
mod presets;
mod schedules_api;
mod sse;
mod webhook;

pub use bridge::{BridgeDevice, BridgeDeviceMap};
pub use logring::LogRing;
pub use pipeline::{AdmissionPipeline, AdmissionRequest, AdmissionResponse};
pub use presets::PresetStore;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use ocw_approval::ApprovalStore;
use ocw_auth::PostureSnapshot;
use ocw_config::{ConfigStore, Settings};
use ocw_core::{Envelope, ErrorKind, OcwError, RetryHint};
use ocw_engine::{CallbackWatcher, DeadLetterLog, EngineClient};
use ocw_failover::FailoverRouter;
use ocw_gate::{InflightGate, RateLimiter};
use ocw_idempotency::IdempotencyStore;
use ocw_redact::{EventBus, TraceStore};
use ocw_scheduler::{RunStore, ScheduleStore};
use ocw_template::TemplateRegistry;
use std::sync::Arc;
use std::time::Instant;

/// Shared state behind every handler.
pub struct AppState {
    /// Resolved settings snapshot.
    pub settings: Settings,
    /// Locked posture snapshot (capabilities surface reports it).
    pub posture: PostureSnapshot,
    /// Per-trace event timelines.
    pub traces: Arc<TraceStore>,
    /// SSE fan-out bus.
    pub bus: Arc<EventBus>,
    /// Bounded retained event ring for logs-tail and /events.
    pub logring: Arc<LogRing>,
    /// Idempotency store (admissions + webhook nonces).
    pub idempotency: Arc<IdempotencyStore>,
    /// Template allowlist.
    pub templates: Arc<TemplateRegistry>,
    /// Approval store.
    pub approvals: Arc<ApprovalStore>,
    /// In-flight permit gate.
    pub inflight: InflightGate,
    /// Per-client token buckets.
    pub limiter: Arc<RateLimiter>,
    /// Render-engine transport.
    pub engine: EngineClient,
    /// Callback watcher.
    pub watcher: Arc<CallbackWatcher>,
    /// Dead-letter log (shared with the watcher).
    pub deadletter: Arc<DeadLetterLog>,
    /// Schedule definitions.
    pub schedules: Arc<ScheduleStore>,
    /// Run history.
    pub runs: Arc<RunStore>,
    /// LLM failover layer.
    pub failover: Arc<FailoverRouter>,
    /// Persistent non-secret configuration.
    pub config_store: Arc<ConfigStore>,
    /// Saved presets.
    pub presets: Arc<PresetStore>,
    /// Registered bridge devices.
    pub bridge_devices: Arc<BridgeDeviceMap>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// The admission pipeline over this state.
    #[must_use]
    pub fn pipeline(self: &Arc<Self>) -> AdmissionPipeline {
        AdmissionPipeline::new(Arc::clone(self))
    }
}

/// Handler-level error: an [`OcwError`] rendered as the JSON envelope with
/// the taxonomy's status code and a `Retry-After` header when applicable.
#[derive(Debug)]
pub struct ApiError(pub OcwError);

impl From<OcwError> for ApiError {
    fn from(err: OcwError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut envelope = Envelope::err(&self.0);
        // Error details can carry text echoed from providers, engines, or
        // callers; every error payload passes through redaction before it
        // leaves the process.
        if let Some(detail) = envelope.detail.take() {
            envelope.detail = Some(ocw_redact::redact(&detail, false));
        }
        let mut response = (status, axum::Json(envelope)).into_response();
        if let RetryHint::After(delay) = self.0.retry_hint() {
            if let Ok(value) = delay.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Convenience constructor used across handler modules.
pub(crate) fn api_err(kind: ErrorKind, detail: impl Into<String>) -> ApiError {
    ApiError(OcwError::new(kind, detail))
}

/// Build the full router.
///
/// The caller must already have passed the posture gate; this function
/// performs no fail-closed checks of its own.
pub fn build_app(state: Arc<AppState>) -> Router {
    let canonical = routes(Arc::clone(&state), false);
    let legacy = routes(Arc::clone(&state), true);

    // Browser clients may read cross-origin; writes stay same-origin and
    // are covered by the admin CSRF checks.
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .nest("/openclaw", canonical)
        .nest("/moltbot", legacy)
        .layer(cors)
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .with_state(state)
}

/// The route table. The legacy alias carries read-only and webhook paths
/// only; admin writes exist solely under the canonical prefix.
fn routes(state: Arc<AppState>, legacy: bool) -> Router<Arc<AppState>> {
    let mut router = Router::new()
        // Read surface.
        .route("/health", get(api::get_health))
        .route("/capabilities", get(api::get_capabilities))
        .route("/config", get(api::get_config))
        .route("/logs/tail", get(api::get_logs_tail))
        .route("/trace/{prompt_id}", get(api::get_trace))
        .route("/events", get(api::get_events))
        .route("/events/stream", get(sse::events_stream))
        .route("/deadletter", get(api::get_deadletter))
        .route("/presets", get(presets::list_presets))
        .route("/presets/{name}", get(presets::get_preset))
        .route("/schedules", get(schedules_api::list_schedules))
        .route("/schedules/{id}", get(schedules_api::get_schedule))
        .route("/schedules/{id}/runs", get(schedules_api::get_schedule_runs))
        .route("/approvals", get(approvals_api::list_approvals))
        .route("/approvals/{id}", get(approvals_api::get_approval))
        // Webhook surface (shared with the legacy prefix; same idempotency
        // scope since the handler is the same).
        .route("/webhook", post(webhook::post_webhook))
        .route("/webhook/submit", post(webhook::post_webhook))
        .route("/webhook/validate", post(webhook::post_webhook_validate));

    if !legacy {
        router = router
            // Assist surface, canonical prefix only.
            .route("/assist/planner", post(assist::post_planner))
            .route("/assist/planner/stream", post(assist::post_planner_stream))
            .route("/assist/refiner", post(assist::post_refiner))
            .route("/assist/refiner/stream", post(assist::post_refiner_stream))
            // Admin write surface, canonical prefix only.
            .route("/config", put(api::put_config))
            .route("/presets/{name}", put(presets::put_preset))
            .route("/presets/{name}", delete(presets::delete_preset))
            .route("/schedules", post(schedules_api::create_schedule))
            .route("/schedules/{id}", put(schedules_api::update_schedule))
            .route("/schedules/{id}", delete(schedules_api::delete_schedule))
            .route("/triggers/fire", post(schedules_api::fire_trigger))
            .route("/approvals/{id}/approve", post(approvals_api::approve))
            .route("/approvals/{id}/reject", post(approvals_api::reject))
            .route("/jobs/{prompt_id}/interrupt", post(api::post_interrupt));

        if state.settings.safety.bridge_enabled {
            router = router
                .route("/bridge/handshake", post(bridge::post_handshake))
                .route("/bridge/submit", post(bridge::post_submit))
                .route("/bridge/deliver", post(bridge::post_deliver))
                .route("/bridge/health", get(bridge::get_health));
        } else {
            router = router
                .route("/bridge/handshake", post(bridge::disabled))
                .route("/bridge/submit", post(bridge::disabled))
                .route("/bridge/deliver", post(bridge::disabled))
                .route("/bridge/health", get(bridge::disabled_get));
        }
    }

    router
}
