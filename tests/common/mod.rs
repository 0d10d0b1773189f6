#![allow(dead_code)]
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use claims_dtf::agents::{Completion, Prompt, ReasoningBackend, ReasoningError, RetryPolicy, Usage};
use claims_dtf::claims::{register_activities, register_orchestration, ClaimServices, EscalationPolicy};
use claims_dtf::collaborators::{InMemoryBlobStorage, InMemoryMessaging, StaticLookup};
use claims_dtf::providers::in_memory::InMemoryHistoryStore;
use claims_dtf::providers::HistoryStore;
use claims_dtf::runtime::{ActivityRegistry, Runtime};
use claims_dtf::{Event, OrchestrationRegistry};
use tokio::sync::{Barrier, Notify};

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if predicate(&hist) {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_subscription(store: Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| hist.iter().any(|e| matches!(e, Event::EventSubscribed { name: n, .. } if n == name)),
        timeout_ms,
    )
    .await
}

pub fn count(hist: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    hist.iter().filter(|e| pred(e)).count()
}

pub const CLAIM_ID: &str = "C-1001";

pub fn honda_claim() -> serde_json::Value {
    serde_json::json!({
        "claimId": CLAIM_ID,
        "policyId": "P-12345",
        "lossDate": "2024-05-01",
        "vehicle": "2019 Honda Civic LX",
        "location": "12 Main St, Springfield, IL 62701",
        "description": "Rear-ended while stopped at a red light.",
        "parties": [
            {"role": "Insured", "name": "Jane Doe", "contact": {"phone": "555-0100", "email": "jane@example.com"}},
            {"role": "Third Party", "name": "John Roe"}
        ],
        "attachments": [{"type": "photo", "format": "jpg", "uri": "blob://photos/1.jpg"}]
    })
}

const CANONICAL_REPLY: &str = r#"```json
{
  "claimId": "C-1001",
  "policyId": "P-12345",
  "lossDate": "2024-05-01",
  "description": "Rear-ended while stopped at a red light.",
  "vehicle": {"make": "Honda", "model": "Civic", "trim": "LX", "year": 2019},
  "location": {"line1": "12 Main St", "city": "Springfield", "state": "IL", "postalCode": "62701"},
  "parties": [
    {"role": "Insured", "name": "Jane Doe", "contact": {"phone": "555-0100", "email": "jane@example.com"}},
    {"role": "ThirdParty", "name": "John Roe"}
  ]
}
```"#;

/// Reasoning backend answering each agent with a fixed reply.
pub struct ScriptedBackend {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    gate: Option<(HashSet<String>, Arc<Barrier>)>,
    held: Option<(String, Arc<Notify>)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// Replies for a complete claim with the given fraud score.
    pub fn happy_path(fraud_score: f64) -> Self {
        let replies = [
            ("completeness", r#"{"missingFields": [], "clarifyingQuestions": []}"#.to_string()),
            ("canonicalize", CANONICAL_REPLY.to_string()),
            (
                "coverage",
                serde_json::json!({
                    "covered": true,
                    "confidence": 0.92,
                    "basis": [{"section": "Part D - Collision", "reason": "Collision with another vehicle"}],
                    "notes": "",
                    "deductible": 500
                })
                .to_string(),
            ),
            (
                "fraud",
                serde_json::json!({
                    "score": fraud_score,
                    "signals": [],
                    "rationale": "consistent account",
                    "safeToAutoPay": true
                })
                .to_string(),
            ),
            (
                "comms",
                serde_json::json!({
                    "email": {
                        "subject": "Your claim C-1001",
                        "body": "<p>Your claim is approved.</p>",
                        "recipientEmailAddress": "jane@example.com",
                        "recipientName": "Jane Doe"
                    },
                    "sms": "Claim C-1001 approved"
                })
                .to_string(),
            ),
        ];
        Self {
            replies: replies.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            failing: HashSet::new(),
            gate: None,
            held: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, agent: &str, text: &str) -> Self {
        self.replies.insert(agent.to_string(), text.to_string());
        self
    }

    pub fn fail(mut self, agent: &str) -> Self {
        self.failing.insert(agent.to_string());
        self
    }

    /// The listed agents only answer once all of them are in flight.
    pub fn gate_together(mut self, agents: &[&str]) -> Self {
        self.gate = Some((
            agents.iter().map(|a| a.to_string()).collect(),
            Arc::new(Barrier::new(agents.len())),
        ));
        self
    }

    /// Calls to `agent` wait until the returned handle is notified.
    pub fn hold(mut self, agent: &str) -> (Self, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        self.held = Some((agent.to_string(), release.clone()));
        (self, release)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion, ReasoningError> {
        self.calls.lock().unwrap().push(prompt.agent.clone());
        if let Some((agents, barrier)) = &self.gate {
            if agents.contains(&prompt.agent) {
                barrier.wait().await;
            }
        }
        if let Some((agent, release)) = &self.held {
            if agent == &prompt.agent {
                release.notified().await;
            }
        }
        if self.failing.contains(&prompt.agent) {
            return Err(ReasoningError::Backend(format!("{} backend unavailable", prompt.agent)));
        }
        Ok(Completion {
            text: self.replies.get(&prompt.agent).cloned().unwrap_or_default(),
            usage: Some(Usage {
                input_tokens: Some(120),
                output_tokens: Some(40),
            }),
        })
    }
}

pub struct Harness {
    pub runtime: Arc<Runtime>,
    pub store: Arc<dyn HistoryStore>,
    pub backend: Arc<ScriptedBackend>,
    pub storage: Arc<InMemoryBlobStorage>,
    pub messaging: Arc<InMemoryMessaging>,
}

pub fn services(
    backend: Arc<ScriptedBackend>,
    storage: Arc<InMemoryBlobStorage>,
    messaging: Arc<InMemoryMessaging>,
) -> ClaimServices {
    ClaimServices {
        backend,
        retry: RetryPolicy {
            max_attempts: 1,
            backoff_ms: 0,
        },
        storage,
        messaging,
        schemas: Arc::new(StaticLookup::new().with("fnol", r#"{"required": ["claimId", "policyId", "lossDate"]}"#)),
        policies: Arc::new(StaticLookup::new().with("P-12345", "Part D - Collision: covered, $500 deductible")),
        prior_claims: Arc::new(StaticLookup::new()),
        sender: "claims@example.com".into(),
        adjuster_queue: "adjuster-notifications".into(),
        manual_review_queue: "manual-review".into(),
    }
}

pub async fn start_claims(backend: ScriptedBackend, messaging: InMemoryMessaging, policy: EscalationPolicy) -> Harness {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    start_claims_with_store(store, backend, messaging, policy).await
}

pub async fn start_claims_with_store(
    store: Arc<dyn HistoryStore>,
    backend: ScriptedBackend,
    messaging: InMemoryMessaging,
    policy: EscalationPolicy,
) -> Harness {
    let backend = Arc::new(backend);
    let storage = Arc::new(InMemoryBlobStorage::default());
    let messaging = Arc::new(messaging);
    let activities = register_activities(
        ActivityRegistry::builder(),
        services(backend.clone(), storage.clone(), messaging.clone()),
    )
    .build();
    let orchestrations = register_orchestration(OrchestrationRegistry::builder(), policy).build();
    let runtime = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    Harness {
        runtime,
        store,
        backend,
        storage,
        messaging,
    }
}
