//! Language model gateway and the OpenAI-compatible chat implementation.
//!
//! Mirrors the embedding gateway: a narrow trait, a `"disabled"` stand-in,
//! and a provider speaking the OpenAI `POST /chat/completions` wire format
//! (which also covers DashScope compatible-mode and local servers via
//! `base_url`). Retry classification is shared with embeddings: 429 and 5xx
//! retry with exponential backoff, other 4xx fail permanently, timeouts are
//! reported as such.

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::error::GatewayError;

/// One message in a chat prompt, in provider wire order.
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// A fully composed prompt: system instructions plus alternating history.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<PromptMessage>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// External text-generation capability.
#[async_trait]
pub trait LanguageModelGateway: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a complete answer for the prompt.
    async fn generate(&self, prompt: &Prompt) -> Result<String, GatewayError>;

    /// Generate an answer as a stream of text fragments. Fragments
    /// concatenate to the same answer `generate` would return.
    async fn generate_stream(&self, prompt: &Prompt) -> Result<TokenStream, GatewayError>;
}

/// Build the configured gateway. `"disabled"` fails every call so chat
/// degrades into error-marked turns instead of panicking.
pub fn create_llm_gateway(
    config: &LlmConfig,
) -> anyhow::Result<std::sync::Arc<dyn LanguageModelGateway>> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledLlm)),
        "openai" => Ok(std::sync::Arc::new(OpenAiChat::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

pub struct DisabledLlm;

#[async_trait]
impl LanguageModelGateway for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<String, GatewayError> {
        Err(GatewayError::Permanent(
            "llm provider is disabled".to_string(),
        ))
    }

    async fn generate_stream(&self, _prompt: &Prompt) -> Result<TokenStream, GatewayError> {
        Err(GatewayError::Permanent(
            "llm provider is disabled".to_string(),
        ))
    }
}

/// Chat gateway speaking the OpenAI chat completions API.
pub struct OpenAiChat {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f64,
    max_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            client,
        })
    }

    fn request_body(&self, prompt: &Prompt, stream: bool) -> serde_json::Value {
        let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
        messages.push(serde_json::json!({
            "role": "system",
            "content": prompt.system,
        }));
        for m in &prompt.messages {
            messages.push(serde_json::json!({
                "role": m.role,
                "content": m.content,
            }));
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            let err = match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 {
                        GatewayError::RateLimited(text)
                    } else if status.is_server_error() {
                        GatewayError::Transient(format!("{}: {}", status, text))
                    } else {
                        return Err(GatewayError::Permanent(format!("{}: {}", status, text)));
                    }
                }
                Err(e) if e.is_timeout() => GatewayError::Timeout(e.to_string()),
                Err(e) => GatewayError::Transient(e.to_string()),
            };

            last_err = Some(err);
        }

        Err(last_err
            .unwrap_or_else(|| GatewayError::Transient("chat retries exhausted".to_string())))
    }
}

#[async_trait]
impl LanguageModelGateway for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, GatewayError> {
        let started = Instant::now();
        let body = self.request_body(prompt, false);
        let response = self.send(&body).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("invalid chat response: {}", e)))?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                GatewayError::Transient("missing choices[0].message.content".to_string())
            })?;

        tracing::debug!(
            target: "gateway",
            kind = "chat",
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = "ok",
        );
        Ok(content.to_string())
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<TokenStream, GatewayError> {
        let body = self.request_body(prompt, true);
        let response = self.send(&body).await?;

        // Server-sent events: each `data:` line carries one delta payload,
        // terminated by a literal `[DONE]`. A network error mid-stream is
        // surfaced as a stream item so the caller can mark the turn failed.
        let byte_stream = Box::pin(response.bytes_stream());
        let stream = futures::stream::unfold(
            (byte_stream, String::new(), false),
            |(mut bytes, mut buffer, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(fragment) = next_sse_fragment(&mut buffer) {
                        match fragment {
                            SseItem::Delta(text) => {
                                return Some((Ok(text), (bytes, buffer, false)))
                            }
                            SseItem::Done => return None,
                        }
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(e)) => {
                            let err = if e.is_timeout() {
                                GatewayError::Timeout(e.to_string())
                            } else {
                                GatewayError::Transient(e.to_string())
                            };
                            return Some((Err(err), (bytes, buffer, true)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

enum SseItem {
    Delta(String),
    Done,
}

/// Pop the next complete SSE event off the front of `buffer`, skipping
/// events that carry no text delta.
fn next_sse_fragment(buffer: &mut String) -> Option<SseItem> {
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Some(SseItem::Done);
        }
        let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        let delta = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());
        if let Some(text) = delta {
            if !text.is_empty() {
                return Some(SseItem::Delta(text.to_string()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_extracts_deltas_in_order() {
        let mut buf = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
             data: [DONE]\n",
        );
        let mut out = Vec::new();
        while let Some(item) = next_sse_fragment(&mut buf) {
            match item {
                SseItem::Delta(t) => out.push(t),
                SseItem::Done => break,
            }
        }
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    #[test]
    fn sse_parser_waits_for_complete_lines() {
        let mut buf = String::from("data: {\"choices\":[{\"delta\":{\"content\":\"par");
        assert!(next_sse_fragment(&mut buf).is_none());
        buf.push_str("tial\"}}]}\n");
        match next_sse_fragment(&mut buf) {
            Some(SseItem::Delta(t)) => assert_eq!(t, "partial"),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn sse_parser_skips_empty_deltas_and_noise() {
        let mut buf = String::from(
            ": keep-alive\n\
             data: {\"choices\":[{\"delta\":{}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
        );
        match next_sse_fragment(&mut buf) {
            Some(SseItem::Delta(t)) => assert_eq!(t, "x"),
            _ => panic!("expected delta"),
        }
    }

    #[tokio::test]
    async fn disabled_llm_always_fails() {
        let gw = DisabledLlm;
        let prompt = Prompt {
            system: "s".into(),
            messages: vec![],
        };
        assert!(matches!(
            gw.generate(&prompt).await,
            Err(GatewayError::Permanent(_))
        ));
    }
}
