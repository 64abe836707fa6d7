//! Inference Client (§4.1): OpenAI-compatible chat + streaming against a local server.
//!
//! Failures never cross the boundary as panics or `Err` that bubble past this
//! module's own API surface for `chat`/`generate` — the caller gets a
//! [`ChatResponse`] whose `error` field is populated. `stream` instead terminates
//! its item sequence with a final `Err` element, since a lazy sequence has no other
//! channel to report a mid-stream failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::error::InferenceError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A completed chat response. Always returned (never an `Err`); `error` carries
/// failure detail when the call did not succeed, in which case `content` is empty.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub latency: Duration,
    pub error: Option<InferenceError>,
}

impl ChatResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(model: &str, latency: Duration, error: InferenceError) -> Self {
        Self {
            content: String::new(),
            model: model.to_string(),
            usage: TokenUsage::default(),
            finish_reason: None,
            latency,
            error: Some(error),
        }
    }
}

/// A single incremental delta from a streaming response, or a terminal error.
pub type StreamItem = Result<String, InferenceError>;

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiMessage>,
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Stateless (beyond its HTTP connection pool) client against an OpenAI-compatible server.
pub struct InferenceClient {
    http: Client,
    base_url: String,
    config: Arc<Config>,
}

impl InferenceClient {
    pub fn new(config: Arc<Config>) -> Self {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");
        let base_url = config.vllm_base_url.clone();
        Self { http, base_url, config }
    }

    /// Resolve a model alias (`default`/`coder`/`fast`/`tiny`) to a concrete identity.
    pub fn resolve_model<'a>(&'a self, alias: &'a str) -> &'a str {
        self.config.model_aliases.resolve(alias)
    }

    #[instrument(skip(self, messages), fields(model = %model, n_messages = messages.len()))]
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> ChatResponse {
        let model = self.resolve_model(model).to_string();
        let start = Instant::now();
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                let err = InferenceError::Timeout(start.elapsed());
                warn!(error = %e, "inference call timed out");
                return ChatResponse::failed(&model, start.elapsed(), err);
            }
            Err(e) => {
                let err = InferenceError::Connect(e.to_string());
                warn!(error = %e, "could not reach inference server");
                return ChatResponse::failed(&model, start.elapsed(), err);
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = InferenceError::Http(status.as_u16(), text);
            warn!(status = %status, "inference server returned non-200");
            return ChatResponse::failed(&model, start.elapsed(), err);
        }

        let parsed: Result<OpenAiChatResponse, _> = resp.json().await;
        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                let err = InferenceError::Malformed(e.to_string());
                warn!(error = %e, "malformed chat completion payload");
                return ChatResponse::failed(&model, start.elapsed(), err);
            }
        };

        let latency = start.elapsed();
        let Some(choice) = parsed.choices.into_iter().next() else {
            let err = InferenceError::Malformed("no choices in response".into());
            return ChatResponse::failed(&model, latency, err);
        };

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        ChatResponse {
            content,
            model,
            usage,
            finish_reason: choice.finish_reason,
            latency,
            error: None,
        }
    }

    /// Convenience wrapper producing a two-message chat (optional system + user prompt).
    pub async fn generate(&self, prompt: &str, system: Option<&str>, model: &str) -> ChatResponse {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::system(sys));
        }
        messages.push(ChatMessage::user(prompt));
        self.chat(messages, model, 0.7, 2048).await
    }

    /// A lazy sequence of incremental text deltas, terminated by the server's `[DONE]`
    /// sentinel, by connection close, or by a final `Err` element.
    #[instrument(skip(self, prompt), fields(model = %model))]
    pub async fn stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        model: &str,
        temperature: f32,
    ) -> BoxStream<'static, StreamItem> {
        let model = self.resolve_model(model).to_string();
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::system(sys));
        }
        messages.push(ChatMessage::user(prompt));

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "stream": true,
        });

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                let text = r.text().await.unwrap_or_default();
                return stream::once(async move {
                    Err(InferenceError::Http(status.as_u16(), text))
                })
                .boxed();
            }
            Err(e) if e.is_timeout() => {
                return stream::once(async move { Err(InferenceError::Timeout(DEFAULT_TIMEOUT)) })
                    .boxed();
            }
            Err(e) => {
                let msg = e.to_string();
                return stream::once(async move { Err(InferenceError::Connect(msg)) }).boxed();
            }
        };

        let byte_stream = resp.bytes_stream();
        stream::unfold((byte_stream, String::new(), false), |(mut bs, mut buf, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    if line.is_empty() || !line.starts_with("data:") {
                        continue;
                    }
                    let payload = line.trim_start_matches("data:").trim();
                    if payload == "[DONE]" {
                        return Some((Ok(String::new()), (bs, buf, true)));
                    }
                    match serde_json::from_str::<OpenAiChatResponse>(payload) {
                        Ok(parsed) => {
                            let delta = parsed
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta)
                                .and_then(|d| d.content)
                                .unwrap_or_default();
                            if delta.is_empty() {
                                continue;
                            }
                            return Some((Ok(delta), (bs, buf, false)));
                        }
                        Err(e) => {
                            return Some((
                                Err(InferenceError::Malformed(e.to_string())),
                                (bs, buf, true),
                            ));
                        }
                    }
                }
                match bs.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        return Some((Err(InferenceError::Connect(e.to_string())), (bs, buf, true)));
                    }
                    None => return None,
                }
            }
        })
        .filter(|item| {
            let keep = !matches!(item, Ok(s) if s.is_empty());
            async move { keep }
        })
        .boxed()
    }

    /// Best-effort health probe against `/health`.
    pub async fn health(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// The model identities the server currently reports via `/v1/models`.
    pub async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        let resp = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await?
            .json::<ModelsResponse>()
            .await?;
        Ok(resp.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_passthrough_for_unknown_alias() {
        let config = Arc::new(Config::from_env());
        let client = InferenceClient::new(config);
        assert_eq!(client.resolve_model("totally-custom-model"), "totally-custom-model");
    }

    #[test]
    fn resolve_model_known_alias() {
        let config = Arc::new(Config::from_env());
        let client = InferenceClient::new(config);
        assert_eq!(client.resolve_model("tiny"), "llama3.2:1b");
    }

    #[tokio::test]
    async fn chat_against_unreachable_server_surfaces_connectivity_error() {
        let mut config = Config::from_env();
        config.vllm_base_url = "http://127.0.0.1:1".to_string();
        let client = InferenceClient::new(Arc::new(config));
        let resp = client.chat(vec![ChatMessage::user("hi")], "default", 0.5, 16).await;
        assert!(!resp.is_success());
        assert!(matches!(resp.error, Some(InferenceError::Connect(_))));
    }
}
