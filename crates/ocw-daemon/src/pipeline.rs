// SPDX-License-Identifier: MIT OR Apache-2.0
//! The admission pipeline.
//!
//! Every request that will touch the render engine flows through
//! [`AdmissionPipeline::admit`]: trace open, identity record, idempotency,
//! normalization (done upstream), template validation, callback policy,
//! approval interposition, render + size cap, concurrency gate, queue
//! submission, watcher registration. Each step emits one trace event.

use crate::AppState;
use async_trait::async_trait;
use ocw_core::{
    CallbackDescriptor, Envelope, ErrorKind, EventKind, InputValue, JobSpec, OcwError, Source,
    TraceId,
};
use ocw_idempotency::Begin;
use ocw_safeio::IoPolicy;
use ocw_scheduler::{ScheduleAdmitter, ScheduledFire};
use ocw_template::TemplateError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a duplicate caller waits for the first caller's outcome.
const IN_FLIGHT_WAIT: Duration = Duration::from_secs(2);
/// Backoff before the single submit retry.
const SUBMIT_RETRY_BACKOFF: Duration = Duration::from_millis(250);
/// Approval TTL.
const APPROVAL_TTL: Duration = Duration::from_secs(24 * 3600);

/// One fully-normalized admission.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// Originating surface.
    pub source: Source,
    /// Template to render.
    pub template_id: String,
    /// Normalized inputs.
    pub inputs: BTreeMap<String, InputValue>,
    /// Declared callback.
    pub callback: Option<CallbackDescriptor>,
    /// Caller-supplied dedupe key.
    pub idempotency_key: Option<String>,
    /// Correlation id (minted upstream when absent).
    pub trace_id: TraceId,
    /// Caller identity label for audit.
    pub requested_by: String,
    /// Validate and render without submitting.
    pub dry_run: bool,
}

/// The response an admission produced: HTTP status plus envelope body.
///
/// Stored verbatim in the idempotency store so a replay is byte-identical.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdmissionResponse {
    /// HTTP status to answer with.
    pub status: u16,
    /// The JSON envelope body.
    pub envelope: Value,
}

impl AdmissionResponse {
    fn accepted(data: Value, trace_id: &TraceId) -> Self {
        Self {
            status: 202,
            envelope: serde_json::to_value(
                Envelope::ok(data).with_trace(trace_id.clone()),
            )
            .unwrap_or(Value::Null),
        }
    }
}

/// Orchestrates one admission across the component crates.
pub struct AdmissionPipeline {
    state: Arc<AppState>,
}

impl AdmissionPipeline {
    /// Pipeline over shared state.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn emit(&self, trace_id: &TraceId, kind: EventKind, payload: Value) {
        self.state.traces.append(trace_id, kind, payload.clone());
        self.state.bus.publish(trace_id, kind, payload);
    }

    /// Record an authentication failure on the trace (handlers call this;
    /// the pipeline itself only sees authenticated requests).
    pub fn record_auth_failure(&self, trace_id: &TraceId, detail: &str) {
        self.emit(
            trace_id,
            EventKind::AuthFail,
            serde_json::json!({ "detail": detail }),
        );
    }

    /// Run the full admission.
    ///
    /// # Errors
    ///
    /// Returns an [`OcwError`] carrying the taxonomy kind for every refusal.
    pub async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, OcwError> {
        let trace_id = request.trace_id.clone();
        let fail = |err: OcwError| err.with_trace(trace_id.clone());

        self.emit(
            &trace_id,
            EventKind::Admit,
            serde_json::json!({
                "source": request.source.as_str(),
                "template_id": request.template_id,
            }),
        );
        self.emit(
            &trace_id,
            EventKind::AuthOk,
            serde_json::json!({ "requested_by": request.requested_by }),
        );

        // Idempotency (dry runs never claim keys).
        let claimed_key = if request.dry_run {
            None
        } else if let Some(key) = request.idempotency_key.clone() {
            match self.state.idempotency.begin(&key) {
                Begin::Done(prior) => {
                    self.emit(&trace_id, EventKind::DedupeHit, serde_json::json!({"key": key}));
                    return Ok(decode_cached(prior));
                }
                Begin::InFlight => {
                    match self.state.idempotency.wait_for(&key, IN_FLIGHT_WAIT).await {
                        Some(prior) => {
                            self.emit(
                                &trace_id,
                                EventKind::DedupeHit,
                                serde_json::json!({"key": key}),
                            );
                            return Ok(decode_cached(prior));
                        }
                        None => {
                            return Err(fail(OcwError::new(
                                ErrorKind::IdempotencyInFlight,
                                "another request with this key is in flight",
                            )));
                        }
                    }
                }
                Begin::Fresh => Some(key),
            }
        } else {
            None
        };

        let result = self.admit_inner(&request, &trace_id).await;
        match (&result, claimed_key) {
            (Ok(response), Some(key)) => {
                let cached = serde_json::to_value(response).unwrap_or(Value::Null);
                self.state.idempotency.commit(&key, cached);
            }
            (Err(_), Some(key)) => self.state.idempotency.abort(&key),
            _ => {}
        }
        result.map_err(fail)
    }

    async fn admit_inner(
        &self,
        request: &AdmissionRequest,
        trace_id: &TraceId,
    ) -> Result<AdmissionResponse, OcwError> {
        // Template + input validation.
        let normalized = self
            .state
            .templates
            .validate(&request.template_id, &request.inputs)
            .map_err(template_error)?;

        // Callback destination policy.
        if let Some(callback) = &request.callback {
            self.check_callback(callback, trace_id).await?;
        }

        let mut job = JobSpec::new(
            request.template_id.clone(),
            normalized,
            request.source,
            trace_id.clone(),
        );
        job.callback = request.callback.clone();

        // Approval interposition.
        if self.requires_approval(request) {
            let approval = self
                .state
                .approvals
                .create(job, request.requested_by.clone(), APPROVAL_TTL)
                .map_err(|e| OcwError::new(ErrorKind::Internal, e.to_string()))?;
            info!(approval_id = %approval.approval_id, trace_id = %trace_id, "admission parked for approval");
            return Ok(AdmissionResponse::accepted(
                serde_json::json!({
                    "approval_id": approval.approval_id,
                    "status": "pending",
                }),
                trace_id,
            ));
        }

        // Render + byte cap + submit + watch.
        let (prompt_id, job_id) = self.render_and_submit(&job, trace_id).await?;
        Ok(AdmissionResponse::accepted(
            serde_json::json!({
                "prompt_id": prompt_id,
                "job_id": job_id,
                "trace_id": trace_id.as_str(),
            }),
            trace_id,
        ))
    }

    fn requires_approval(&self, request: &AdmissionRequest) -> bool {
        if request.dry_run {
            return false;
        }
        self.state.settings.require_approval
            && matches!(request.source, Source::Webhook | Source::Bridge)
    }

    async fn check_callback(
        &self,
        callback: &CallbackDescriptor,
        trace_id: &TraceId,
    ) -> Result<(), OcwError> {
        let url = reqwest::Url::parse(&callback.url).map_err(|e| {
            OcwError::new(ErrorKind::ValidationError, format!("field 'callback.url': {e}"))
        })?;
        let policy = self.callback_policy();
        ocw_safeio::resolve(&url, &policy, None).await.map_err(|e| {
            warn!(trace_id = %trace_id, url = %callback.url, error = %e, "callback blocked");
            OcwError::new(ErrorKind::SsrfBlocked, e.to_string())
        })?;
        Ok(())
    }

    /// The outbound policy for callback destinations.
    ///
    /// Single-host deployments may deliver to private/loopback destinations
    /// (the host allowlist still applies); lan/public postures never do.
    #[must_use]
    pub fn callback_policy(&self) -> IoPolicy {
        IoPolicy {
            allow_http: self.state.settings.safety.allow_insecure_base_url,
            allowed_hosts: self.state.settings.safety.callback_allow_hosts.clone(),
            allow_loopback_for: Default::default(),
            allow_private: self.state.settings.profile == ocw_auth::DeploymentProfile::Local,
            max_redirects: 3,
        }
    }

    /// Steps 8–11: render, measure, gate, submit, watch.
    ///
    /// Shared by the normal path, the dry-run path (which stops after the
    /// size check), and approved-execution.
    async fn render_and_submit(
        &self,
        job: &JobSpec,
        trace_id: &TraceId,
    ) -> Result<(String, String), OcwError> {
        let rendered = self
            .state
            .templates
            .render(&job.template_id, &job.inputs)
            .map_err(template_error)?;
        let size = serde_json::to_vec(&rendered).map(|v| v.len()).unwrap_or(0);
        self.emit(
            trace_id,
            EventKind::TemplateRender,
            serde_json::json!({"template_id": job.template_id, "bytes": size}),
        );

        let cap = self.state.settings.budgets.max_rendered_workflow_bytes;
        if size > cap {
            return Err(OcwError::new(
                ErrorKind::PayloadTooLarge,
                format!("rendered workflow is {size} bytes, cap is {cap}"),
            ));
        }

        // Concurrency gate. The permit covers submission only: the engine
        // queues the actual compute, so holding permits across render time
        // would serialize on the wrong resource.
        let permit = match self.state.inflight.acquire(job.source) {
            Ok(permit) => permit,
            Err(refusal) => {
                let err = gate_error(refusal);
                self.emit(
                    trace_id,
                    EventKind::Error,
                    serde_json::json!({
                        "stage": "gate",
                        "error": err.kind().wire_name(),
                        "detail": err.detail(),
                    }),
                );
                return Err(err);
            }
        };

        let mut last_error = None;
        let mut prompt_id = None;
        for attempt in 0..2u32 {
            match self.state.engine.submit(&rendered, trace_id).await {
                Ok(id) => {
                    prompt_id = Some(id);
                    break;
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, attempt, error = %err, "queue submit failed");
                    last_error = Some(err.to_string());
                    if attempt == 0 {
                        tokio::time::sleep(SUBMIT_RETRY_BACKOFF).await;
                    }
                }
            }
        }
        permit.release();

        let Some(prompt_id) = prompt_id else {
            let detail = last_error.unwrap_or_else(|| "submit failed".to_string());
            self.emit(
                trace_id,
                EventKind::Error,
                serde_json::json!({"stage": "submit", "detail": detail}),
            );
            return Err(OcwError::new(ErrorKind::SubmitFailed, detail));
        };

        self.state.traces.record_prompt(&prompt_id, trace_id);
        self.emit(
            trace_id,
            EventKind::Submit,
            serde_json::json!({"prompt_id": prompt_id}),
        );

        if job.callback.is_some() {
            let _watch = self.state.watcher.spawn(job.clone(), prompt_id.clone());
        }
        Ok((prompt_id, job.job_id.clone()))
    }

    /// Dry-run admission: validate, check callback, render, measure. No
    /// queue submission, no idempotency claim.
    ///
    /// # Errors
    ///
    /// Returns the same errors the real path would, short of submission.
    pub async fn validate_only(
        &self,
        request: AdmissionRequest,
    ) -> Result<AdmissionResponse, OcwError> {
        let trace_id = request.trace_id.clone();
        self.emit(
            &trace_id,
            EventKind::Admit,
            serde_json::json!({
                "source": request.source.as_str(),
                "template_id": request.template_id,
                "dry_run": true,
            }),
        );

        let normalized = self
            .state
            .templates
            .validate(&request.template_id, &request.inputs)
            .map_err(template_error)
            .map_err(|e| e.with_trace(trace_id.clone()))?;

        if let Some(callback) = &request.callback {
            self.check_callback(callback, &trace_id)
                .await
                .map_err(|e| e.with_trace(trace_id.clone()))?;
        }

        let rendered = self
            .state
            .templates
            .render(&request.template_id, &normalized)
            .map_err(template_error)
            .map_err(|e| e.with_trace(trace_id.clone()))?;
        let size = serde_json::to_vec(&rendered).map(|v| v.len()).unwrap_or(0);
        self.emit(
            &trace_id,
            EventKind::TemplateRender,
            serde_json::json!({"template_id": request.template_id, "bytes": size, "dry_run": true}),
        );

        let cap = self.state.settings.budgets.max_rendered_workflow_bytes;
        if size > cap {
            return Err(OcwError::new(
                ErrorKind::PayloadTooLarge,
                format!("rendered workflow is {size} bytes, cap is {cap}"),
            )
            .with_trace(trace_id));
        }

        Ok(AdmissionResponse {
            status: 200,
            envelope: serde_json::to_value(
                Envelope::ok(serde_json::json!({
                    "valid": true,
                    "rendered_bytes": size,
                }))
                .with_trace(trace_id),
            )
            .unwrap_or(Value::Null),
        })
    }

    /// Execute an approved request (approval steps 8–11).
    ///
    /// # Errors
    ///
    /// Returns `approval_state_conflict` when the request is not approved,
    /// and records execution failures on the approval without consuming it.
    pub async fn execute_approved(&self, approval_id: &str) -> Result<AdmissionResponse, OcwError> {
        let approval = self
            .state
            .approvals
            .get(approval_id)
            .map_err(approval_error)?;
        if approval.status != ocw_approval::ApprovalStatus::Approved {
            return Err(OcwError::new(
                ErrorKind::ApprovalStateConflict,
                format!("approval is {:?}", approval.status),
            ));
        }

        let mut job = approval.job.clone();
        job.source = Source::Approval;
        job.approval_ref = Some(approval.approval_id.clone());
        let trace_id = job.trace_id.clone();

        match self.render_and_submit(&job, &trace_id).await {
            Ok((prompt_id, _)) => {
                self.state
                    .approvals
                    .mark_executed(approval_id, &prompt_id)
                    .map_err(approval_error)?;
                Ok(AdmissionResponse {
                    status: 200,
                    envelope: serde_json::to_value(
                        Envelope::ok(serde_json::json!({
                            "executed": true,
                            "prompt_id": prompt_id,
                        }))
                        .with_trace(trace_id),
                    )
                    .unwrap_or(Value::Null),
                })
            }
            Err(err) => {
                let _ = self
                    .state
                    .approvals
                    .record_execute_failure(approval_id, err.detail());
                Err(err.with_trace(trace_id))
            }
        }
    }
}

/// Decode a cached admission outcome back into a response.
fn decode_cached(prior: Value) -> AdmissionResponse {
    serde_json::from_value(prior.clone()).unwrap_or(AdmissionResponse {
        status: 202,
        envelope: prior,
    })
}

fn template_error(err: TemplateError) -> OcwError {
    match err {
        TemplateError::Denied { template_id } => OcwError::new(
            ErrorKind::TemplateDenied,
            format!("template not allowed: {template_id}"),
        ),
        TemplateError::Validation { field, reason } => OcwError::new(
            ErrorKind::ValidationError,
            format!("field '{field}': {reason}"),
        ),
        TemplateError::HashMismatch { template_id } => OcwError::new(
            ErrorKind::Internal,
            format!("skeleton pin mismatch for {template_id}"),
        ),
    }
}

pub(crate) fn gate_error(err: ocw_gate::GateError) -> OcwError {
    match err {
        ocw_gate::GateError::BudgetExceeded { scope, retry_after } => {
            OcwError::new(ErrorKind::BudgetExceeded, format!("{scope} in-flight cap"))
                .with_retry_after(retry_after)
        }
        ocw_gate::GateError::RateLimitExceeded { retry_after } => {
            OcwError::new(ErrorKind::RateLimitExceeded, "rate limit exceeded")
                .with_retry_after(retry_after)
        }
        ocw_gate::GateError::PayloadTooLarge { size, cap } => OcwError::new(
            ErrorKind::PayloadTooLarge,
            format!("rendered workflow is {size} bytes, cap is {cap}"),
        ),
    }
}

pub(crate) fn approval_error(err: ocw_approval::ApprovalError) -> OcwError {
    match err {
        ocw_approval::ApprovalError::NotFound { approval_id } => OcwError::new(
            ErrorKind::NotFound,
            format!("approval not found: {approval_id}"),
        ),
        ocw_approval::ApprovalError::StateConflict { from, to, .. } => OcwError::new(
            ErrorKind::ApprovalStateConflict,
            format!("cannot move {from:?} -> {to:?}"),
        ),
        ocw_approval::ApprovalError::Persist(detail) => {
            OcwError::new(ErrorKind::Internal, detail)
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler hook
// ---------------------------------------------------------------------------

/// The scheduler's admissions flow through the same pipeline, with the
/// deterministic fire key as their idempotency key.
#[async_trait]
impl ScheduleAdmitter for AdmissionPipeline {
    async fn admit_fire(&self, fire: ScheduledFire) -> Result<Option<String>, OcwError> {
        let request = AdmissionRequest {
            source: Source::Scheduler,
            template_id: fire.template_id,
            inputs: fire.inputs,
            callback: None,
            idempotency_key: Some(fire.idem_key),
            trace_id: TraceId::mint(),
            requested_by: format!("schedule:{}", fire.schedule_id),
            dry_run: false,
        };
        let response = self.admit(request).await?;
        Ok(response
            .envelope
            .pointer("/data/prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}
