use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Completion, Prompt, ReasoningBackend, ReasoningError, Usage};
use crate::config::{AgentModelConfig, ReasoningConfig};

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

/// Backend for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatBackend {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    config: ReasoningConfig,
}

impl OpenAiChatBackend {
    pub fn new(config: &ReasoningConfig) -> Result<Self, ReasoningError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ReasoningError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: resolve_chat_endpoint(&config.endpoint),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            config: config.clone(),
        })
    }

    fn model_for(&self, agent: &str) -> &AgentModelConfig {
        let a = &self.config.agents;
        match agent {
            "completeness" => &a.completeness,
            "canonicalize" => &a.canonicalize,
            "coverage" => &a.coverage,
            "fraud" => &a.fraud,
            _ => &a.comms,
        }
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiChatBackend {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ReasoningError> {
        let model = self.model_for(&prompt.agent);
        let payload = json!({
            "model": model.model,
            "temperature": model.temperature,
            "top_p": model.top_p,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });

        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ReasoningError::Timeout
            } else {
                ReasoningError::Backend(format!("request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Backend(format!("status {status}: {}", truncate(&body, 320))));
        }

        let body: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Backend(format!("invalid response: {e}")))?;
        let text = body
            .choices
            .first()
            .map(|c| extract_text(&c.message.content))
            .unwrap_or_default();
        let usage = body.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens.and_then(|v| v.try_into().ok()),
            output_tokens: u.completion_tokens.and_then(|v| v.try_into().ok()),
        });
        Ok(Completion { text, usage })
    }
}

fn resolve_chat_endpoint(endpoint: &str) -> String {
    if endpoint.contains("/chat/completions") {
        endpoint.to_string()
    } else {
        format!("{}/chat/completions", endpoint.trim_end_matches('/'))
    }
}

fn extract_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let mut out: String = value.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
