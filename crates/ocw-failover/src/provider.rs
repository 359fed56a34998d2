// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provider candidates and the closed API adapter set.

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Which assist surface a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistTask {
    /// Prompt planning: turn a rough idea into template inputs.
    Planner,
    /// Prompt refinement: improve an existing prompt.
    Refiner,
}

impl AssistTask {
    /// System prompt for this task.
    #[must_use]
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Planner => {
                "You plan image-generation jobs. Given a request, reply with a \
                 short prompt, a negative prompt, and suggested parameters."
            }
            Self::Refiner => {
                "You refine image-generation prompts. Improve wording and \
                 detail without changing the subject."
            }
        }
    }
}

/// A request into the failover layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistRequest {
    /// Which assist surface.
    pub task: AssistTask,
    /// User text.
    pub prompt: String,
    /// Optional extra context (current template inputs etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// A non-streaming reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistReply {
    /// Provider that served the request.
    pub provider_id: String,
    /// Model that served the request.
    pub model: String,
    /// Reply text.
    pub text: String,
}

/// Streaming event vocabulary; `Final` is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum AssistEvent {
    /// Progress marker (candidate selection, retries).
    Stage {
        /// What is happening.
        detail: String,
    },
    /// Best-effort incremental text.
    Delta {
        /// Text fragment.
        text: String,
    },
    /// Authoritative final reply.
    Final {
        /// Complete reply.
        reply: AssistReply,
    },
    /// Terminal failure.
    Error {
        /// Stable error tag.
        error: String,
        /// Detail for the client.
        detail: String,
    },
    /// Connection keepalive.
    Keepalive,
}

/// Wire API a candidate speaks. Closed set; no dynamic dispatch by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderApi {
    /// OpenAI-compatible `/v1/chat/completions`.
    OpenAiChat,
    /// Ollama `/api/chat`.
    Ollama,
}

/// One ordered failover candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable provider identifier.
    pub provider_id: String,
    /// Model name sent to the provider.
    pub model: String,
    /// Base URL of the provider.
    pub base_url: String,
    /// Wire API.
    pub api: ProviderApi,
    /// API key, if the provider needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// A failed provider call, with enough detail to classify.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderFailure {
    /// The provider answered with a non-success status.
    #[error("provider http {status}")]
    Http {
        /// Status code.
        status: u16,
        /// Response headers (lowercased names).
        headers: Vec<(String, String)>,
        /// Response body (truncated).
        body: String,
    },
    /// The call timed out.
    #[error("provider timeout")]
    Timeout,
    /// Transport-level failure.
    #[error("provider transport: {0}")]
    Transport(String),
    /// The provider replied with an unexpected shape.
    #[error("provider reply malformed: {0}")]
    Malformed(String),
}

impl Candidate {
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.api {
            ProviderApi::OpenAiChat => format!("{base}/v1/chat/completions"),
            ProviderApi::Ollama => format!("{base}/api/chat"),
        }
    }

    fn request_body(&self, request: &AssistRequest, stream: bool) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.task.system_prompt(),
        })];
        if let Some(context) = &request.context {
            messages.push(serde_json::json!({"role": "user", "content": format!("Context: {context}")}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        })
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// One non-streaming call.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderFailure`] with classification material on failure.
    pub async fn call(
        &self,
        client: &reqwest::Client,
        request: &AssistRequest,
        timeout: Duration,
    ) -> Result<AssistReply, ProviderFailure> {
        let builder = client
            .post(self.endpoint())
            .timeout(timeout)
            .json(&self.request_body(request, false));
        let response = self.apply_auth(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderFailure::Timeout
            } else {
                ProviderFailure::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_ascii_lowercase(),
                        v.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(2048);
            return Err(ProviderFailure::Http {
                status,
                headers,
                body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;
        let text = match self.api {
            ProviderApi::OpenAiChat => json
                .pointer("/choices/0/message/content")
                .and_then(|v| v.as_str()),
            ProviderApi::Ollama => json.pointer("/message/content").and_then(|v| v.as_str()),
        }
        .ok_or_else(|| ProviderFailure::Malformed("missing content".into()))?
        .to_string();

        Ok(AssistReply {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            text,
        })
    }

    /// One streaming call; deltas land on `tx`, the accumulated text is
    /// returned for the authoritative `final`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderFailure`]; when deltas were already emitted the
    /// caller decides whether to fail over or surface the error.
    pub async fn call_streaming(
        &self,
        client: &reqwest::Client,
        request: &AssistRequest,
        timeout: Duration,
        tx: &mpsc::Sender<AssistEvent>,
    ) -> Result<AssistReply, ProviderFailure> {
        let builder = client
            .post(self.endpoint())
            .timeout(timeout)
            .json(&self.request_body(request, true));
        let response = self.apply_auth(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderFailure::Timeout
            } else {
                ProviderFailure::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_ascii_lowercase(),
                        v.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(2048);
            return Err(ProviderFailure::Http {
                status,
                headers,
                body,
            });
        }

        let mut accumulated = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderFailure::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);
                if let Some(delta) = self.parse_stream_line(&line) {
                    if !delta.is_empty() {
                        accumulated.push_str(&delta);
                        let _ = tx
                            .send(AssistEvent::Delta { text: delta })
                            .await;
                    }
                }
            }
        }

        Ok(AssistReply {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            text: accumulated,
        })
    }

    /// Extract a delta fragment from one stream line, if it carries one.
    fn parse_stream_line(&self, line: &str) -> Option<String> {
        match self.api {
            ProviderApi::OpenAiChat => {
                let data = line.strip_prefix("data:")?.trim();
                if data == "[DONE]" {
                    return None;
                }
                let json: serde_json::Value = serde_json::from_str(data).ok()?;
                json.pointer("/choices/0/delta/content")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            }
            ProviderApi::Ollama => {
                // Ollama streams newline-delimited JSON objects.
                let json: serde_json::Value = serde_json::from_str(line).ok()?;
                json.pointer("/message/content")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate(server: &MockServer, api: ProviderApi) -> Candidate {
        Candidate {
            provider_id: "prov".into(),
            model: "test-model".into(),
            base_url: server.uri(),
            api,
            api_key: Some("sk-test-key".into()),
        }
    }

    fn request() -> AssistRequest {
        AssistRequest {
            task: AssistTask::Planner,
            prompt: "a cat in the rain".into(),
            context: None,
        }
    }

    #[tokio::test]
    async fn openai_call_parses_reply_and_sends_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test-key"))
            .and(body_partial_json(serde_json::json!({"model": "test-model", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "a cat, rainy street"}}]
            })))
            .mount(&server)
            .await;

        let reply = candidate(&server, ProviderApi::OpenAiChat)
            .call(&reqwest::Client::new(), &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.text, "a cat, rainy street");
        assert_eq!(reply.provider_id, "prov");
    }

    #[tokio::test]
    async fn ollama_call_parses_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "rainy cat"}
            })))
            .mount(&server)
            .await;

        let reply = candidate(&server, ProviderApi::Ollama)
            .call(&reqwest::Client::new(), &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.text, "rainy cat");
    }

    #[tokio::test]
    async fn http_failure_carries_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "60")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let err = candidate(&server, ProviderApi::OpenAiChat)
            .call(&reqwest::Client::new(), &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ProviderFailure::Http {
                status,
                headers,
                body,
            } => {
                assert_eq!(status, 429);
                assert!(headers.iter().any(|(k, v)| k == "retry-after" && v == "60"));
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_emits_deltas_and_accumulates() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a cat\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\", rainy\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let reply = candidate(&server, ProviderApi::OpenAiChat)
            .call_streaming(&reqwest::Client::new(), &request(), Duration::from_secs(5), &tx)
            .await
            .unwrap();
        assert_eq!(reply.text, "a cat, rainy");

        drop(tx);
        let mut deltas = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AssistEvent::Delta { text } = event {
                deltas.push(text);
            }
        }
        assert_eq!(deltas, vec!["a cat", ", rainy"]);
    }
}
