//! Language-model client abstraction
//!
//! Provides:
//! - The `CompletionClient` seam every pipeline stage calls through
//! - An OpenAI-compatible chat-completion HTTP client
//! - A scripted mock for tests
//!
//! Quota exhaustion is detected here (HTTP 429 or provider error text) and
//! surfaced as `AppError::QuotaExceeded` with the upstream message intact;
//! nothing downstream is allowed to rephrase it.

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Markers that identify a quota/rate-limit failure in provider error text.
const QUOTA_MARKERS: &[&str] = &["quota", "429", "resourceexhausted", "resource_exhausted", "rate limit"];

/// True when upstream error text indicates quota exhaustion rather than a
/// generic failure.
pub fn is_quota_message(text: &str) -> bool {
    let lowered = text.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Trait for prompt-in, text-out completion
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete a prompt. Raises `QuotaExceeded` on provider quota
    /// exhaustion, `ModelTimeout`/`ModelError` otherwise.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Get the model name
    fn model(&self) -> &str;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// OpenAI-compatible chat-completion client
pub struct HttpCompletionClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpCompletionClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    async fn call_api(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.endpoint);

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            // Routing and SQL synthesis want determinism, not creativity.
            temperature: 0.0,
            max_tokens: self.config.max_output_tokens,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::ModelTimeout {
                        timeout_ms: self.config.timeout_secs * 1000,
                    }
                } else {
                    AppError::ModelError {
                        message: format!("Request failed: {}", e),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || is_quota_message(&body) {
                return Err(AppError::QuotaExceeded {
                    message: format!("{}: {}", status, body),
                });
            }
            return Err(AppError::ModelError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| AppError::ModelError {
            message: format!("Failed to parse response: {}", e),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::ModelError {
                message: "Empty completion response".to_string(),
            })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        // Local development without credentials gets a canned reply instead
        // of a network call.
        if self.config.api_key.is_empty() {
            tracing::warn!("No LLM API key configured, returning canned completion");
            return Ok(format!(
                "[offline completion for prompt of {} chars]",
                prompt.len()
            ));
        }

        let start = std::time::Instant::now();
        let text = self.call_api(prompt).await?;
        tracing::debug!(
            model = %self.config.model,
            latency_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "Completion finished"
        );
        Ok(text)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// A scripted reply for the mock client
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Quota,
    Error,
}

/// Mock completion client for tests.
///
/// Replies are consumed in script order; when the script runs out the fixed
/// fallback (if any) answers every further call. Prompts are recorded for
/// assertions.
pub struct MockCompletionClient {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockCompletionClient {
    pub fn fixed(reply: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Script followed by a fixed fallback once the script is exhausted.
    pub fn scripted_then_fixed(replies: Vec<MockReply>, fallback: &str) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: Some(fallback.to_string()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        let next = self.script.lock().pop_front();
        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Quota) => Err(AppError::QuotaExceeded {
                message: "429 Resource has been exhausted (e.g. check quota)".to_string(),
            }),
            Some(MockReply::Error) => Err(AppError::ModelError {
                message: "scripted failure".to_string(),
            }),
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(AppError::ModelError {
                    message: "mock script exhausted".to_string(),
                }),
            },
        }
    }

    fn model(&self) -> &str {
        "mock-completion"
    }
}

/// Create a completion client from configuration
pub fn create_completion_client(config: &LlmConfig) -> Result<Arc<dyn CompletionClient>> {
    Ok(Arc::new(HttpCompletionClient::new(config.clone())?))
}
