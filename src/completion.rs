//! Completion provider seam.
//!
//! The assistant reply comes from an external chat-completion API. The
//! trait keeps the orchestrator testable; the HTTP implementation sends
//! ordered role/content turns with a fixed system instruction in front.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::error::{GateError, Result};

/// Hard ceiling on one completion call.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// System instruction prepended to every conversation.
pub const SYSTEM_INSTRUCTION: &str = "You are the product's research assistant. \
Answer the user's question directly and concisely. If a question is outside \
your knowledge, say so instead of guessing.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

/// Produces an assistant reply for an ordered list of turns.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// # Errors
    ///
    /// Fails with [`GateError::Completion`] for provider errors and
    /// [`GateError::Timeout`] when the hard ceiling is hit. Callers
    /// must not consume quota on failure.
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String>;
}

#[async_trait]
impl<T: CompletionClient + ?Sized> CompletionClient for Arc<T> {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String> {
        (**self).complete(turns).await
    }
}

/// Completion client over an OpenAI-compatible chat endpoint.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

impl HttpCompletionClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .map_err(|e| GateError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = CompletionRequest {
            model: &self.model,
            messages: turns,
        };

        let call = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send();

        let response = tokio::time::timeout(COMPLETION_TIMEOUT, call)
            .await
            .map_err(|_| GateError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    GateError::Timeout
                } else {
                    GateError::Completion(format!("provider request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(status = status.as_u16(), "completion provider returned an error");
            return Err(GateError::Completion(format!(
                "provider returned {}",
                status
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GateError::Completion(format!("malformed provider response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GateError::Completion("provider returned no choices".to_string()))
    }
}
