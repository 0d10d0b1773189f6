//! Reasoning-backed analysis: a narrow backend capability plus a typed
//! agent wrapper shared by every reasoning activity.
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::runtime::ActivityContext;
use crate::TaskFailure;

pub mod cleaner;
pub mod openai;
pub mod prompts;

pub use cleaner::{clean_response, parse_or_default};
pub use openai::OpenAiChatBackend;

/// A fully rendered request for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    /// Agent name; backends use it to pick per-agent sampling settings.
    pub agent: String,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReasoningError {
    #[error("reasoning call canceled")]
    Canceled,
    #[error("reasoning backend error: {0}")]
    Backend(String),
    #[error("reasoning call timed out")]
    Timeout,
}

impl ReasoningError {
    fn is_retryable(&self) -> bool {
        matches!(self, ReasoningError::Backend(_) | ReasoningError::Timeout)
    }
}

impl From<ReasoningError> for TaskFailure {
    fn from(e: ReasoningError) -> Self {
        match e {
            ReasoningError::Canceled => TaskFailure::Canceled("reasoning call canceled".into()),
            other => TaskFailure::Failed(other.to_string()),
        }
    }
}

/// Anything that can answer a chat-style prompt.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ReasoningError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            backoff_ms: c.backoff_ms,
        }
    }
}

/// Typed wrapper: renders `In` into a prompt, calls the backend and decodes
/// the reply into `Out`, falling back to `Out::default()`.
pub struct ReasoningAgent<In, Out> {
    name: String,
    instructions: String,
    backend: Arc<dyn ReasoningBackend>,
    retry: RetryPolicy,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> ReasoningAgent<In, Out>
where
    In: Serialize,
    Out: DeserializeOwned + Default,
{
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        backend: Arc<dyn ReasoningBackend>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            backend,
            retry,
            _marker: PhantomData,
        }
    }

    /// Render the prompt: the input as JSON followed by labelled context blocks.
    pub fn render(&self, input: &In, context: &[(&str, String)]) -> Result<Prompt, TaskFailure> {
        let json = serde_json::to_string_pretty(input)
            .map_err(|e| TaskFailure::InvalidInput(format!("{} input did not serialize: {e}", self.name)))?;
        let mut user = format!("Input:\n{json}");
        for (label, text) in context {
            user.push_str(&format!("\n\n{label}:\n{text}"));
        }
        Ok(Prompt {
            agent: self.name.clone(),
            system: self.instructions.clone(),
            user,
        })
    }

    pub async fn run(&self, ctx: &ActivityContext, input: &In, context: &[(&str, String)]) -> Result<Out, TaskFailure> {
        let prompt = self.render(input, context)?;
        let completion = self.complete_with_retry(ctx, &prompt).await?;
        if let Some(u) = &completion.usage {
            info!(
                agent = %self.name,
                instance = %ctx.instance,
                input_tokens = u.input_tokens,
                output_tokens = u.output_tokens,
                "reasoning usage"
            );
        }
        debug!(agent = %self.name, raw = %completion.text, "reasoning reply");
        Ok(parse_or_default(&self.name, &completion.text))
    }

    async fn complete_with_retry(&self, ctx: &ActivityContext, prompt: &Prompt) -> Result<Completion, ReasoningError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(ReasoningError::Canceled),
                r = self.backend.complete(prompt) => r,
            };
            match result {
                Ok(c) => return Ok(c),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(agent = %self.name, attempt, error = %e, "reasoning call failed; retrying");
                    let backoff = Duration::from_millis(self.retry.backoff_ms.saturating_mul(attempt as u64));
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => return Err(ReasoningError::Canceled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
