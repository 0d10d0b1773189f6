//! Claim activities: reasoning-backed analyses plus the storage and
//! messaging side effects. Each takes a versioned request record.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::models::{
    CanonicalClaim, ClaimAnalysisReport, CommsResult, CompletenessResult, CoverageResult, FnolClaim, FraudResult,
};
use crate::agents::{prompts, ReasoningAgent, ReasoningBackend, RetryPolicy};
use crate::collaborators::{policy_id_is_valid, BlobStorage, CollaboratorError, EmailMessage, LookupTool, Messaging};
use crate::config::AppConfig;
use crate::runtime::{ActivityContext, ActivityRegistryBuilder};
use crate::TaskFailure;

pub const CHECK_COMPLETENESS: &str = "CheckCompleteness";
pub const CANONICALIZE: &str = "Canonicalize";
pub const ANALYZE_COVERAGE: &str = "AnalyzeCoverage";
pub const ANALYZE_FRAUD: &str = "AnalyzeFraud";
pub const NOTIFY_ADJUSTER: &str = "NotifyAdjuster";
pub const ROUTE_TO_MANUAL_REVIEW: &str = "RouteToManualReview";
pub const GENERATE_COMMUNICATIONS: &str = "GenerateCommunications";
pub const SEND_COMMUNICATIONS: &str = "SendCommunications";
pub const FINALIZE_CLAIM: &str = "FinalizeClaim";

pub const SCHEMA_VERSION: u32 = 1;

const FNOL_SCHEMA_ID: &str = "fnol";
const DEFAULT_SUBJECT: &str = "No Subject";
const DEFAULT_BODY: &str = "<p>No content</p>";
const DEFAULT_RECIPIENT_NAME: &str = "Valued Customer";

/// Versioned envelope every claim activity receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRequest<T> {
    pub schema_version: u32,
    pub body: T,
}

impl<T> ActivityRequest<T> {
    pub fn new(body: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            body,
        }
    }

    fn validated(self, activity: &str) -> Result<T, TaskFailure> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(TaskFailure::InvalidInput(format!(
                "{activity} expects schema version {SCHEMA_VERSION}, got {}",
                self.schema_version
            )));
        }
        Ok(self.body)
    }
}

pub type CompletenessRequest = ActivityRequest<FnolClaim>;
pub type CanonicalizeRequest = ActivityRequest<FnolClaim>;
pub type AnalysisRequest = ActivityRequest<CanonicalClaim>;
pub type EscalationRequest = ActivityRequest<EscalationNotice>;
pub type ManualReviewRequest = ActivityRequest<ManualReview>;
pub type CommsRequest = ActivityRequest<ClaimAnalysisReport>;
pub type SendRequest = ActivityRequest<Delivery>;
pub type FinalizeRequest = ActivityRequest<ClaimAnalysisReport>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationNotice {
    pub claim_id: String,
    pub policy_id: String,
    pub fraud_score: f64,
    pub rationale: String,
    pub review_window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReview {
    pub claim_id: String,
    pub reason: String,
}

/// Customer communication to send, with the insured's contact details as a
/// fallback when the generated email has no recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub claim_id: String,
    pub comms: CommsResult,
    #[serde(default)]
    pub fallback_email: Option<String>,
    #[serde(default)]
    pub fallback_name: Option<String>,
}

/// Collaborators the claim activities run against.
#[derive(Clone)]
pub struct ClaimServices {
    pub backend: Arc<dyn ReasoningBackend>,
    pub retry: RetryPolicy,
    pub storage: Arc<dyn BlobStorage>,
    pub messaging: Arc<dyn Messaging>,
    pub schemas: Arc<dyn LookupTool>,
    pub policies: Arc<dyn LookupTool>,
    pub prior_claims: Arc<dyn LookupTool>,
    pub sender: String,
    pub adjuster_queue: String,
    pub manual_review_queue: String,
}

impl ClaimServices {
    /// Services with queue names, sender and retry taken from configuration.
    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn ReasoningBackend>,
        storage: Arc<dyn BlobStorage>,
        messaging: Arc<dyn Messaging>,
        schemas: Arc<dyn LookupTool>,
        policies: Arc<dyn LookupTool>,
        prior_claims: Arc<dyn LookupTool>,
    ) -> Self {
        Self {
            backend,
            retry: RetryPolicy::from(&config.reasoning.retry),
            storage,
            messaging,
            schemas,
            policies,
            prior_claims,
            sender: config.messaging.sender.clone(),
            adjuster_queue: config.messaging.adjuster_queue.clone(),
            manual_review_queue: config.messaging.manual_review_queue.clone(),
        }
    }
}

struct Handlers {
    services: ClaimServices,
    completeness: ReasoningAgent<FnolClaim, CompletenessResult>,
    canonicalize: ReasoningAgent<FnolClaim, CanonicalClaim>,
    coverage: ReasoningAgent<CanonicalClaim, CoverageResult>,
    fraud: ReasoningAgent<CanonicalClaim, FraudResult>,
    comms: ReasoningAgent<ClaimAnalysisReport, CommsResult>,
}

impl Handlers {
    fn new(services: ClaimServices) -> Self {
        let b = &services.backend;
        let r = services.retry;
        Self {
            completeness: ReasoningAgent::new("completeness", prompts::COMPLETENESS, b.clone(), r),
            canonicalize: ReasoningAgent::new("canonicalize", prompts::CANONICALIZE, b.clone(), r),
            coverage: ReasoningAgent::new("coverage", prompts::COVERAGE, b.clone(), r),
            fraud: ReasoningAgent::new("fraud", prompts::FRAUD, b.clone(), r),
            comms: ReasoningAgent::new("comms", prompts::COMMS, b.clone(), r),
            services,
        }
    }

    async fn check_completeness(
        self: Arc<Self>,
        ctx: ActivityContext,
        req: CompletenessRequest,
    ) -> Result<CompletenessResult, TaskFailure> {
        let claim = req.validated(CHECK_COMPLETENESS)?;
        let schema = self
            .services
            .schemas
            .fetch_by_id(FNOL_SCHEMA_ID)
            .await
            .unwrap_or_else(|e| format!("FNOL schema unavailable ({e}); judge completeness from the input alone."));
        self.completeness.run(&ctx, &claim, &[("FNOL schema", schema)]).await
    }

    async fn canonicalize(
        self: Arc<Self>,
        ctx: ActivityContext,
        req: CanonicalizeRequest,
    ) -> Result<CanonicalClaim, TaskFailure> {
        let raw = req.validated(CANONICALIZE)?;
        let canonical = self.canonicalize.run(&ctx, &raw, &[]).await?;
        if canonical.claim_id.is_empty() {
            warn!(claim_id = %raw.claim_id, "canonicalization produced no claim; using minimal form");
            return Ok(CanonicalClaim::minimal_from(&raw));
        }
        Ok(canonical)
    }

    async fn analyze_coverage(
        self: Arc<Self>,
        ctx: ActivityContext,
        req: AnalysisRequest,
    ) -> Result<CoverageResult, TaskFailure> {
        let claim = req.validated(ANALYZE_COVERAGE)?;
        let policy = if policy_id_is_valid(&claim.policy_id) {
            self.services
                .policies
                .fetch_by_id(&claim.policy_id)
                .await
                .unwrap_or_else(|e| format!("Policy text unavailable ({e})."))
        } else {
            format!("Policy id '{}' is not valid; no policy text available.", claim.policy_id)
        };
        self.coverage.run(&ctx, &claim, &[("Policy", policy)]).await
    }

    async fn analyze_fraud(
        self: Arc<Self>,
        ctx: ActivityContext,
        req: AnalysisRequest,
    ) -> Result<FraudResult, TaskFailure> {
        let claim = req.validated(ANALYZE_FRAUD)?;
        let prior = match self.services.prior_claims.fetch_by_id(&claim.policy_id).await {
            Ok(text) => text,
            Err(CollaboratorError::NotFound(_)) => "no prior claims".to_string(),
            Err(e) => format!("Prior claims unavailable ({e})."),
        };
        self.fraud.run(&ctx, &claim, &[("Prior claims", prior)]).await
    }

    async fn notify_adjuster(
        self: Arc<Self>,
        _ctx: ActivityContext,
        req: EscalationRequest,
    ) -> Result<String, TaskFailure> {
        let notice = req.validated(NOTIFY_ADJUSTER)?;
        let queue = self.services.adjuster_queue.clone();
        let message = serde_json::to_value(&notice).map_err(|e| TaskFailure::Failed(e.to_string()))?;
        self.services
            .messaging
            .enqueue(&queue, message)
            .await
            .map_err(|e| TaskFailure::Failed(format!("adjuster notification failed: {e}")))?;
        info!(claim_id = %notice.claim_id, score = notice.fraud_score, queue = %queue, "adjuster notified");
        Ok(queue)
    }

    async fn route_to_manual_review(
        self: Arc<Self>,
        _ctx: ActivityContext,
        req: ManualReviewRequest,
    ) -> Result<String, TaskFailure> {
        let review = req.validated(ROUTE_TO_MANUAL_REVIEW)?;
        let queue = self.services.manual_review_queue.clone();
        let message = serde_json::to_value(&review).map_err(|e| TaskFailure::Failed(e.to_string()))?;
        self.services
            .messaging
            .enqueue(&queue, message)
            .await
            .map_err(|e| TaskFailure::Failed(format!("manual review routing failed: {e}")))?;
        info!(claim_id = %review.claim_id, queue = %queue, "claim routed to manual review");
        Ok(queue)
    }

    async fn generate_communications(
        self: Arc<Self>,
        ctx: ActivityContext,
        req: CommsRequest,
    ) -> Result<CommsResult, TaskFailure> {
        let report = req.validated(GENERATE_COMMUNICATIONS)?;
        self.comms.run(&ctx, &report, &[]).await
    }

    async fn send_communications(
        self: Arc<Self>,
        _ctx: ActivityContext,
        req: SendRequest,
    ) -> Result<String, TaskFailure> {
        let delivery = req.validated(SEND_COMMUNICATIONS)?;
        let email = delivery.comms.email;
        let recipient = non_empty(email.recipient_email_address)
            .or(delivery.fallback_email.and_then(non_empty))
            .ok_or_else(|| TaskFailure::Failed(format!("no recipient address for claim {}", delivery.claim_id)))?;
        let message = EmailMessage {
            sender: self.services.sender.clone(),
            recipient: recipient.clone(),
            recipient_name: non_empty(email.recipient_name)
                .or(delivery.fallback_name.and_then(non_empty))
                .unwrap_or_else(|| DEFAULT_RECIPIENT_NAME.to_string()),
            subject: non_empty(email.subject).unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            html: non_empty(email.body).unwrap_or_else(|| DEFAULT_BODY.to_string()),
        };
        self.services
            .messaging
            .send_email(message)
            .await
            .map_err(|e| TaskFailure::Failed(format!("email delivery failed: {e}")))?;
        Ok(recipient)
    }

    async fn finalize(
        self: Arc<Self>,
        _ctx: ActivityContext,
        req: FinalizeRequest,
    ) -> Result<Vec<String>, TaskFailure> {
        let report = req.validated(FINALIZE_CLAIM)?;
        let storage = &self.services.storage;
        let report_path = format!("claims/{}/report.json", report.claim_id);
        let json = serde_json::to_value(&report).map_err(|e| TaskFailure::Failed(e.to_string()))?;
        storage
            .write_blob(&report_path, &json)
            .await
            .map_err(|e| TaskFailure::Failed(format!("report write failed: {e}")))?;
        let mut written = vec![report_path];
        if let Some(comms) = report.communications.as_ref().filter(|c| !c.is_empty()) {
            let path = format!("claims/{}/customer_communication.json", report.claim_id);
            let json = serde_json::to_value(comms).map_err(|e| TaskFailure::Failed(e.to_string()))?;
            storage
                .write_blob(&path, &json)
                .await
                .map_err(|e| TaskFailure::Failed(format!("communication write failed: {e}")))?;
            written.push(path);
        }
        info!(claim_id = %report.claim_id, decision = ?report.decision, "claim finalized");
        Ok(written)
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.trim().is_empty()).then_some(s)
}

fn bind<In, Fut, F>(handlers: &Arc<Handlers>, f: F) -> impl Fn(ActivityContext, In) -> Fut + Send + Sync + 'static
where
    In: 'static,
    Fut: 'static,
    F: Fn(Arc<Handlers>, ActivityContext, In) -> Fut + Send + Sync + 'static,
{
    let handlers = handlers.clone();
    move |ctx, input| f(handlers.clone(), ctx, input)
}

/// Register every claim activity on `builder`.
pub fn register_activities(builder: ActivityRegistryBuilder, services: ClaimServices) -> ActivityRegistryBuilder {
    let h = Arc::new(Handlers::new(services));
    builder
        .register_typed(CHECK_COMPLETENESS, bind(&h, Handlers::check_completeness))
        .register_typed(CANONICALIZE, bind(&h, Handlers::canonicalize))
        .register_typed(ANALYZE_COVERAGE, bind(&h, Handlers::analyze_coverage))
        .register_typed(ANALYZE_FRAUD, bind(&h, Handlers::analyze_fraud))
        .register_typed(NOTIFY_ADJUSTER, bind(&h, Handlers::notify_adjuster))
        .register_typed(ROUTE_TO_MANUAL_REVIEW, bind(&h, Handlers::route_to_manual_review))
        .register_typed(GENERATE_COMMUNICATIONS, bind(&h, Handlers::generate_communications))
        .register_typed(SEND_COMMUNICATIONS, bind(&h, Handlers::send_communications))
        .register_typed(FINALIZE_CLAIM, bind(&h, Handlers::finalize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Completion, Prompt, ReasoningError};
    use crate::collaborators::{InMemoryBlobStorage, InMemoryMessaging, StaticLookup};
    use crate::runtime::{ActivityHandler, ActivityRegistry};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Canned {
        reply: String,
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl ReasoningBackend for Canned {
        async fn complete(&self, prompt: &Prompt) -> Result<Completion, ReasoningError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            Ok(Completion {
                text: self.reply.clone(),
                usage: None,
            })
        }
    }

    fn services(
        reply: &str,
        messaging: Arc<InMemoryMessaging>,
        storage: Arc<InMemoryBlobStorage>,
    ) -> (ClaimServices, Arc<Canned>) {
        let backend = Arc::new(Canned {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let svc = ClaimServices {
            backend: backend.clone(),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_ms: 0,
            },
            storage,
            messaging,
            schemas: Arc::new(StaticLookup::new().with("fnol", "claimId, policyId, lossDate required")),
            policies: Arc::new(StaticLookup::new().with("P-12345", "Section 4: collision covered")),
            prior_claims: Arc::new(StaticLookup::new()),
            sender: "claims@example.com".into(),
            adjuster_queue: "adjuster-notifications".into(),
            manual_review_queue: "manual-review".into(),
        };
        (svc, backend)
    }

    fn registry(svc: ClaimServices) -> ActivityRegistry {
        register_activities(ActivityRegistry::builder(), svc).build()
    }

    fn raw_claim() -> FnolClaim {
        FnolClaim {
            claim_id: "C-9".into(),
            policy_id: "P-12345".into(),
            loss_date: "2024-05-01".into(),
            description: "rear-ended at a light".into(),
            ..FnolClaim::default()
        }
    }

    async fn invoke(reg: &ActivityRegistry, name: &str, input: String) -> Result<String, TaskFailure> {
        let handler = reg.get(name).unwrap();
        handler.invoke(ActivityContext::detached(name), input).await
    }

    #[tokio::test]
    async fn canonicalize_falls_back_to_minimal_claim() {
        let (svc, _) = services("not json at all", Arc::default(), Arc::default());
        let reg = registry(svc);
        let input = serde_json::to_string(&ActivityRequest::new(raw_claim())).unwrap();
        let out = invoke(&reg, CANONICALIZE, input).await.unwrap();
        let canonical: CanonicalClaim = serde_json::from_str(&out).unwrap();
        assert_eq!(canonical, CanonicalClaim::minimal_from(&raw_claim()));
    }

    #[tokio::test]
    async fn mismatched_schema_version_is_invalid_input() {
        let (svc, _) = services("{}", Arc::default(), Arc::default());
        let reg = registry(svc);
        let input = serde_json::json!({"schemaVersion": 2, "body": raw_claim()}).to_string();
        let err = invoke(&reg, CHECK_COMPLETENESS, input).await.unwrap_err();
        assert!(matches!(err, TaskFailure::InvalidInput(_)));
    }

    #[tokio::test]
    async fn coverage_prompt_includes_policy_text() {
        let (svc, backend) = services(r#"{"covered":true,"confidence":0.9}"#, Arc::default(), Arc::default());
        let reg = registry(svc);
        let input = serde_json::to_string(&ActivityRequest::new(CanonicalClaim::minimal_from(&raw_claim()))).unwrap();
        let out = invoke(&reg, ANALYZE_COVERAGE, input).await.unwrap();
        let coverage: CoverageResult = serde_json::from_str(&out).unwrap();
        assert!(coverage.covered);
        let prompts = backend.prompts.lock().unwrap();
        assert_eq!(prompts[0].agent, "coverage");
        assert!(prompts[0].user.contains("Section 4: collision covered"));
    }

    #[tokio::test]
    async fn fraud_prompt_notes_missing_prior_claims() {
        let (svc, backend) = services(r#"{"score":0.2}"#, Arc::default(), Arc::default());
        let reg = registry(svc);
        let input = serde_json::to_string(&ActivityRequest::new(CanonicalClaim::minimal_from(&raw_claim()))).unwrap();
        invoke(&reg, ANALYZE_FRAUD, input).await.unwrap();
        assert!(backend.prompts.lock().unwrap()[0].user.contains("no prior claims"));
    }

    #[tokio::test]
    async fn send_applies_defaults_and_fallback_recipient() {
        let messaging = Arc::new(InMemoryMessaging::default());
        let (svc, _) = services("{}", messaging.clone(), Arc::default());
        let reg = registry(svc);
        let delivery = Delivery {
            claim_id: "C-9".into(),
            comms: CommsResult::default(),
            fallback_email: Some("jane@example.com".into()),
            fallback_name: None,
        };
        let out = invoke(&reg, SEND_COMMUNICATIONS, serde_json::to_string(&ActivityRequest::new(delivery)).unwrap())
            .await
            .unwrap();
        assert_eq!(out, "jane@example.com");
        let sent = messaging.sent_emails().await;
        assert_eq!(sent[0].subject, DEFAULT_SUBJECT);
        assert_eq!(sent[0].html, DEFAULT_BODY);
        assert_eq!(sent[0].recipient_name, DEFAULT_RECIPIENT_NAME);
        assert_eq!(sent[0].sender, "claims@example.com");
    }

    #[tokio::test]
    async fn finalize_writes_report_and_communication() {
        let storage = Arc::new(InMemoryBlobStorage::default());
        let (svc, _) = services("{}", Arc::default(), storage.clone());
        let reg = registry(svc);
        let mut report = ClaimAnalysisReport::new(raw_claim(), CompletenessResult::default());
        report.communications = Some(CommsResult {
            sms: "Your claim is approved".into(),
            ..CommsResult::default()
        });
        invoke(&reg, FINALIZE_CLAIM, serde_json::to_string(&ActivityRequest::new(report)).unwrap())
            .await
            .unwrap();
        assert_eq!(
            storage.paths().await,
            vec!["claims/C-9/customer_communication.json", "claims/C-9/report.json"]
        );
    }
}
