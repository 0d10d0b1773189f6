//! Runtime tuning and service configuration.
//!
//! Layering is defaults, then an optional YAML file, then environment
//! variables.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Most completions folded into history before the next turn.
    pub completion_batch_limit: usize,
    /// Sleep between polls of an empty queue.
    pub poller_idle_sleep_ms: u64,
    /// Back-off after abandoning an item for an instance that is rehydrating.
    pub poller_gate_delay_ms: u64,
    /// An instance with no traffic for this long is dropped from memory.
    pub idle_dehydrate_ms: u64,
    pub max_concurrent_activities: usize,
    /// Wait before reactivating an instance whose work could not be enqueued.
    pub dispatch_retry_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            completion_batch_limit: 128,
            poller_idle_sleep_ms: 10,
            poller_gate_delay_ms: 5,
            idle_dehydrate_ms: 1000,
            max_concurrent_activities: 16,
            dispatch_retry_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/history"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/blobs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub outbox_dir: PathBuf,
    pub sender: String,
    pub adjuster_queue: String,
    pub manual_review_queue: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            outbox_dir: PathBuf::from("./data/outbox"),
            sender: "claims@example.com".to_string(),
            adjuster_queue: "adjuster-notifications".to_string(),
            manual_review_queue: "manual-review".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub root: PathBuf,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./samples"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub fraud_threshold: f64,
    pub review_window_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            fraud_threshold: 0.6,
            review_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Sampling settings for one reasoning agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentModelConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for AgentModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            top_p: 1.0,
        }
    }
}

impl AgentModelConfig {
    fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub completeness: AgentModelConfig,
    pub canonicalize: AgentModelConfig,
    pub coverage: AgentModelConfig,
    pub fraud: AgentModelConfig,
    pub comms: AgentModelConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            completeness: AgentModelConfig::default(),
            canonicalize: AgentModelConfig::default(),
            coverage: AgentModelConfig::with_temperature(0.1),
            fraud: AgentModelConfig::with_temperature(0.1),
            comms: AgentModelConfig::with_temperature(0.4),
        }
    }
}

impl AgentsConfig {
    fn all_mut(&mut self) -> [&mut AgentModelConfig; 5] {
        [
            &mut self.completeness,
            &mut self.canonicalize,
            &mut self.coverage,
            &mut self.fraud,
            &mut self.comms,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub retry: RetryConfig,
    pub agents: AgentsConfig,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
            retry: RetryConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub storage: StorageConfig,
    pub messaging: MessagingConfig,
    pub lookups: LookupConfig,
    pub escalation: EscalationConfig,
    pub reasoning: ReasoningConfig,
    pub runtime: RuntimeOptions,
}

impl AppConfig {
    /// Load from an optional YAML file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from a key lookup; `load` passes the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("CLAIMS_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("CLAIMS_STORE_ROOT") {
            self.store.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLAIMS_REASONING_ENDPOINT") {
            self.reasoning.endpoint = v;
        }
        if let Some(v) = lookup("CLAIMS_MODEL") {
            for agent in self.reasoning.agents.all_mut() {
                agent.model = v.clone();
            }
        }
        if let Some(v) = lookup("SENDER_EMAIL_ADDRESS") {
            self.messaging.sender = v;
        }
        if let Some(v) = lookup("CLAIMS_FRAUD_THRESHOLD") {
            self.escalation.fraud_threshold = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CLAIMS_FRAUD_THRESHOLD",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("CLAIMS_REVIEW_WINDOW_SECS") {
            self.escalation.review_window_secs = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CLAIMS_REVIEW_WINDOW_SECS",
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.escalation.fraud_threshold) {
            return Err(ConfigError::Invalid(format!(
                "escalation.fraud_threshold must be within [0, 1], got {}",
                self.escalation.fraud_threshold
            )));
        }
        if self.runtime.max_concurrent_activities == 0 {
            return Err(ConfigError::Invalid("runtime.max_concurrent_activities must be positive".into()));
        }
        if self.reasoning.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("reasoning.retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}
