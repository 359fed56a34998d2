// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport onto the render engine's HTTP queue.

use ocw_core::TraceId;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Render-engine transport failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Queue submission was rejected or unreachable.
    #[error("submit failed: {0}")]
    Submit(String),
    /// History/view retrieval failed.
    #[error("engine request failed: {0}")]
    Transport(String),
    /// The engine answered with an unexpected shape.
    #[error("engine response malformed: {0}")]
    Malformed(String),
}

/// One produced output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    /// Output filename.
    pub filename: String,
    /// Subfolder under the engine's output root.
    #[serde(default)]
    pub subfolder: String,
    /// Output type label (`output`, `temp`).
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Fully-formed `/view` URL for retrieval.
    #[serde(default)]
    pub view_url: String,
}

/// What history said about a prompt.
#[derive(Debug, Clone)]
pub enum HistoryOutcome {
    /// Not finished yet.
    Pending,
    /// Finished; outputs collected.
    Ready(Vec<JobOutput>),
    /// The engine recorded a failure for this prompt.
    Failed(String),
}

/// Thin client for the engine's queue endpoints.
///
/// Pure transport: no retries here. Admission retries bounded in the
/// pipeline; watcher retries live in [`crate::CallbackWatcher`].
#[derive(Debug, Clone)]
pub struct EngineClient {
    base_url: Url,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a serde_json::Value,
    extra_data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
}

impl EngineClient {
    /// Create a client for the engine at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Malformed`] when the URL cannot be parsed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let base_url =
            Url::parse(base_url).map_err(|e| EngineError::Malformed(format!("base url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
        self.base_url
            .join(path)
            .map_err(|e| EngineError::Malformed(format!("endpoint {path}: {e}")))
    }

    /// Submit a rendered workflow; returns the engine's prompt id.
    ///
    /// The trace id rides along as opaque metadata the engine echoes back.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Submit`] on refusal or transport failure.
    pub async fn submit(
        &self,
        rendered: &serde_json::Value,
        trace_id: &TraceId,
    ) -> Result<String, EngineError> {
        let url = self.endpoint("prompt")?;
        let body = PromptRequest {
            prompt: rendered,
            extra_data: serde_json::json!({ "trace_id": trace_id.as_str() }),
        };
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Submit(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Submit(format!("status {status}: {text}")));
        }
        let parsed: PromptResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        info!(prompt_id = %parsed.prompt_id, trace_id = %trace_id, "workflow queued");
        Ok(parsed.prompt_id)
    }

    /// Ask history whether a prompt finished.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] / [`EngineError::Malformed`].
    pub async fn history(&self, prompt_id: &str) -> Result<HistoryOutcome, EngineError> {
        let url = self.endpoint(&format!("history/{prompt_id}"))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "history status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))?;

        // History is keyed by prompt id; an empty object means "not yet".
        let Some(entry) = body.get(prompt_id) else {
            return Ok(HistoryOutcome::Pending);
        };

        if let Some(status) = entry.pointer("/status/status_str").and_then(|v| v.as_str())
            && status == "error"
        {
            let message = entry
                .pointer("/status/messages")
                .map(|m| m.to_string())
                .unwrap_or_else(|| "engine reported error".to_string());
            return Ok(HistoryOutcome::Failed(message));
        }

        let mut outputs = Vec::new();
        if let Some(nodes) = entry.get("outputs").and_then(|v| v.as_object()) {
            for node in nodes.values() {
                let Some(images) = node.get("images").and_then(|v| v.as_array()) else {
                    continue;
                };
                for image in images {
                    let Ok(mut output) = serde_json::from_value::<JobOutput>(image.clone()) else {
                        continue;
                    };
                    output.view_url = self
                        .view_url(&output.filename, &output.subfolder, &output.kind)
                        .unwrap_or_default();
                    outputs.push(output);
                }
            }
        }
        debug!(prompt_id, outputs = outputs.len(), "history ready");
        Ok(HistoryOutcome::Ready(outputs))
    }

    /// Build the `/view` URL for one output file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Malformed`] when URL construction fails.
    pub fn view_url(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<String, EngineError> {
        let mut url = self.endpoint("view")?;
        url.query_pairs_mut()
            .append_pair("filename", filename)
            .append_pair("subfolder", subfolder)
            .append_pair("type", if kind.is_empty() { "output" } else { kind });
        Ok(url.to_string())
    }

    /// Route an admin-initiated interrupt to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] on failure.
    pub async fn interrupt(&self) -> Result<(), EngineError> {
        let url = self.endpoint("interrupt")?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Transport(format!(
                "interrupt status {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> EngineClient {
        EngineClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn submit_returns_prompt_id_and_sends_trace() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .and(body_partial_json(serde_json::json!({
                "extra_data": {"trace_id": "t-1"}
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"prompt_id": "p-9"})),
            )
            .mount(&server)
            .await;

        let engine = client(&server).await;
        let prompt_id = engine
            .submit(&serde_json::json!({"1": {}}), &TraceId("t-1".into()))
            .await
            .unwrap();
        assert_eq!(prompt_id, "p-9");
    }

    #[tokio::test]
    async fn submit_surfaces_engine_refusal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad workflow"))
            .mount(&server)
            .await;

        let engine = client(&server).await;
        let err = engine
            .submit(&serde_json::json!({}), &TraceId("t-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Submit(_)));
    }

    #[tokio::test]
    async fn history_pending_when_prompt_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let engine = client(&server).await;
        assert!(matches!(
            engine.history("p-1").await.unwrap(),
            HistoryOutcome::Pending
        ));
    }

    #[tokio::test]
    async fn history_collects_outputs_with_view_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "p-1": {
                    "outputs": {
                        "9": {
                            "images": [
                                {"filename": "cat_0001.png", "subfolder": "", "type": "output"}
                            ]
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let engine = client(&server).await;
        match engine.history("p-1").await.unwrap() {
            HistoryOutcome::Ready(outputs) => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0].filename, "cat_0001.png");
                assert!(outputs[0].view_url.contains("filename=cat_0001.png"));
                assert!(outputs[0].view_url.contains("type=output"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_reports_engine_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "p-1": {"status": {"status_str": "error", "messages": ["boom"]}}
            })))
            .mount(&server)
            .await;

        let engine = client(&server).await;
        assert!(matches!(
            engine.history("p-1").await.unwrap(),
            HistoryOutcome::Failed(_)
        ));
    }

    #[test]
    fn view_url_defaults_type() {
        let engine = EngineClient::new("http://127.0.0.1:8188", Duration::from_secs(1)).unwrap();
        let url = engine.view_url("a.png", "sub", "").unwrap();
        assert!(url.contains("type=output"));
        assert!(url.contains("subfolder=sub"));
    }
}
