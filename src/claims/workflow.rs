//! The claim processing orchestration.
//!
//! Stages run in order: intake, completeness, canonicalize, a coverage and
//! fraud fan-out, an escalation gate for suspicious claims, communications,
//! and finalize. Progress is published through the custom status after each
//! transition.
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::activities::{
    ActivityRequest, Delivery, EscalationNotice, ManualReview, ANALYZE_COVERAGE, ANALYZE_FRAUD, CANONICALIZE,
    CHECK_COMPLETENESS, FINALIZE_CLAIM, GENERATE_COMMUNICATIONS, NOTIFY_ADJUSTER, ROUTE_TO_MANUAL_REVIEW,
    SEND_COMMUNICATIONS,
};
use super::models::{
    CanonicalClaim, ClaimAnalysisReport, CommsResult, CompletenessResult, CoverageResult, Decision, DeliveryStatus,
    Escalation, FnolClaim, FraudResult, FraudReview, ProgressReport, Step,
};
use crate::_typed_codec::{Codec, Json};
use crate::config::EscalationConfig;
use crate::runtime::OrchestrationRegistryBuilder;
use crate::{DurableOutput, OrchestrationContext, TaskFailure};

pub const PROCESS_CLAIM: &str = "ProcessClaim";
pub const FRAUD_REVIEW_COMPLETED: &str = "FraudReviewCompleted";

/// Escalation settings bound when the orchestration is registered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationPolicy {
    /// Fraud scores strictly above this wait for a human review.
    pub fraud_threshold: f64,
    pub review_window: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::from(&EscalationConfig::default())
    }
}

impl From<&EscalationConfig> for EscalationPolicy {
    fn from(c: &EscalationConfig) -> Self {
        Self {
            fraud_threshold: c.fraud_threshold,
            review_window: Duration::from_secs(c.review_window_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClaimWorkflowError {
    #[error("missing input")]
    MissingInput,
    #[error("completeness check failed for claim {0}")]
    Completeness(String),
    #[error("canonicalization failed for claim {0}")]
    Canonicalization(String),
    #[error("{stage} analysis failed for claim {claim_id}")]
    Analysis { stage: &'static str, claim_id: String },
    #[error("manual review routing failed for claim {0}")]
    ManualReview(String),
    #[error("finalize failed for claim {0}")]
    Finalize(String),
}

pub fn register_orchestration(
    builder: OrchestrationRegistryBuilder,
    policy: EscalationPolicy,
) -> OrchestrationRegistryBuilder {
    builder.register(PROCESS_CLAIM, move |ctx: OrchestrationContext, input: String| async move {
        process_claim(ctx, input, policy).await.map_err(|e| e.to_string())
    })
}

fn report_progress(ctx: &OrchestrationContext, step: Step, message: impl Into<String>) {
    ctx.set_custom_status(&ProgressReport::new(step, message));
}

fn decode_output<T: DeserializeOwned>(out: DurableOutput) -> Result<T, TaskFailure> {
    match out {
        DurableOutput::Activity(r) => {
            let raw = r?;
            Json::decode(&raw).map_err(|e| TaskFailure::Failed(format!("activity result did not decode: {e}")))
        }
        other => Err(TaskFailure::Failed(format!("expected an activity completion, got {other:?}"))),
    }
}

async fn call<In: serde::Serialize, Out: DeserializeOwned>(
    ctx: &OrchestrationContext,
    name: &str,
    body: In,
) -> Result<Out, TaskFailure> {
    ctx.schedule_activity_typed(name, &ActivityRequest::new(body))
        .into_activity_typed()
        .await
}

/// Claim orchestration body. Returns the final report as JSON.
pub async fn process_claim(
    ctx: OrchestrationContext,
    input: String,
    policy: EscalationPolicy,
) -> Result<String, ClaimWorkflowError> {
    let claim = match serde_json::from_str::<FnolClaim>(&input) {
        Ok(c) if !c.claim_id.trim().is_empty() => c,
        _ => {
            ctx.log_error("claim input is missing or undecodable");
            return Err(ClaimWorkflowError::MissingInput);
        }
    };
    let claim_id = claim.claim_id.clone();
    report_progress(&ctx, Step::Intake, format!("Received claim {claim_id}"));
    ctx.log_info(format!("processing claim {claim_id}"));

    report_progress(&ctx, Step::Completeness, "Checking claim completeness");
    let completeness: CompletenessResult = call(&ctx, CHECK_COMPLETENESS, claim.clone()).await.map_err(|f| {
        ctx.log_error(format!("completeness failed: {f}"));
        ClaimWorkflowError::Completeness(claim_id.clone())
    })?;
    let mut report = ClaimAnalysisReport::new(claim, completeness);

    if !report.completeness.missing_fields.is_empty() {
        report.decision = Decision::Incomplete;
        let missing = report.completeness.missing_fields.join(", ");
        ctx.log_warn(format!("claim {claim_id} is incomplete: {missing}"));
        finalize(&ctx, &report).await?;
        report_progress(&ctx, Step::Incomplete, format!("Claim is missing: {missing}"));
        return Ok(report_json(&report));
    }

    report_progress(&ctx, Step::Canonicalize, "Normalizing claim details");
    let canonical: CanonicalClaim = call(&ctx, CANONICALIZE, report.raw.clone()).await.map_err(|f| {
        ctx.log_error(format!("canonicalization failed: {f}"));
        ClaimWorkflowError::Canonicalization(claim_id.clone())
    })?;
    report.canonical = Some(canonical.clone());

    report_progress(&ctx, Step::Analyze, "Analyzing coverage and fraud risk");
    // Both are scheduled before either is awaited
    let coverage_f = ctx.schedule_activity_typed(ANALYZE_COVERAGE, &ActivityRequest::new(canonical.clone()));
    let fraud_f = ctx.schedule_activity_typed(ANALYZE_FRAUD, &ActivityRequest::new(canonical.clone()));
    let mut outs = ctx.join(vec![coverage_f, fraud_f]).await.into_iter();
    let analysis_failed = |stage: &'static str| {
        let claim_id = claim_id.clone();
        let ctx = ctx.clone();
        move |f: TaskFailure| {
            ctx.log_error(format!("{stage} analysis failed: {f}"));
            ClaimWorkflowError::Analysis { stage, claim_id }
        }
    };
    let coverage: CoverageResult = outs
        .next()
        .ok_or_else(|| TaskFailure::failed("missing join output"))
        .and_then(decode_output)
        .map_err(analysis_failed("coverage"))?;
    let fraud: FraudResult = outs
        .next()
        .ok_or_else(|| TaskFailure::failed("missing join output"))
        .and_then(decode_output)
        .map_err(analysis_failed("fraud"))?;
    ctx.log_debug(format!(
        "analysis done for claim {claim_id}: covered={} fraud_score={:.2}",
        coverage.covered, fraud.score
    ));
    report.coverage = Some(coverage.clone());
    report.fraud = Some(fraud.clone());

    if fraud.score > policy.fraud_threshold {
        report_progress(
            &ctx,
            Step::EscalationGate,
            format!("Fraud score {:.2} requires review", fraud.score),
        );
        let escalation = escalate(&ctx, &report, &fraud, policy).await?;
        report.escalation = Some(escalation);
    }

    report.decision = match &report.escalation {
        Some(Escalation::TimedOut { .. } | Escalation::UnreadableReview { .. }) => Decision::PendingManualReview,
        Some(Escalation::Reviewed { approved: false, .. }) => Decision::Rejected,
        _ if coverage.covered => Decision::Approved,
        _ => Decision::NotCovered,
    };

    report_progress(&ctx, Step::Communications, "Preparing customer communication");
    let (communications, delivery) = communicate(&ctx, &report, &canonical).await;
    report.communications = communications;
    report.delivery = Some(delivery);

    finalize(&ctx, &report).await?;
    report_progress(&ctx, Step::Completed, format!("Claim {claim_id} processed: {:?}", report.decision));
    Ok(report_json(&report))
}

/// Notify an adjuster, then race the review event against the review window.
async fn escalate(
    ctx: &OrchestrationContext,
    report: &ClaimAnalysisReport,
    fraud: &FraudResult,
    policy: EscalationPolicy,
) -> Result<Escalation, ClaimWorkflowError> {
    let notice = EscalationNotice {
        claim_id: report.claim_id.clone(),
        policy_id: report.raw.policy_id.clone(),
        fraud_score: fraud.score,
        rationale: fraud.rationale.clone(),
        review_window_secs: policy.review_window.as_secs(),
    };
    if let Err(f) = call::<_, String>(ctx, NOTIFY_ADJUSTER, notice).await {
        ctx.log_warn(format!("adjuster notification failed: {f}"));
    }

    let review = ctx.schedule_wait(FRAUD_REVIEW_COMPLETED);
    let window = ctx.schedule_timer(policy.review_window.as_millis() as u64);
    let (_, out) = ctx.select2(review, window).await;
    let unreadable = match out {
        DurableOutput::External(data) => match serde_json::from_str::<FraudReview>(&data) {
            Ok(verdict) => {
                ctx.log_info(format!("fraud review received for claim {}", report.claim_id));
                return Ok(verdict.into());
            }
            Err(e) => {
                ctx.log_warn(format!("unreadable fraud review verdict: {e}"));
                Some(e.to_string())
            }
        },
        _ => {
            ctx.log_warn(format!("fraud review window elapsed for claim {}", report.claim_id));
            None
        }
    };

    let review = ManualReview {
        claim_id: report.claim_id.clone(),
        reason: match &unreadable {
            Some(_) => "fraud review verdict could not be read".to_string(),
            None => "fraud review window elapsed without a decision".to_string(),
        },
    };
    let routed_to: String = call(ctx, ROUTE_TO_MANUAL_REVIEW, review).await.map_err(|f| {
        ctx.log_error(format!("manual review routing failed: {f}"));
        ClaimWorkflowError::ManualReview(report.claim_id.clone())
    })?;
    Ok(match unreadable {
        Some(reason) => Escalation::UnreadableReview { routed_to, reason },
        None => Escalation::TimedOut { routed_to },
    })
}

/// Generate and send the customer communication. Failures here never change
/// the claim decision; they are recorded as the delivery status.
async fn communicate(
    ctx: &OrchestrationContext,
    report: &ClaimAnalysisReport,
    canonical: &CanonicalClaim,
) -> (Option<CommsResult>, DeliveryStatus) {
    let comms: CommsResult = match call(ctx, GENERATE_COMMUNICATIONS, report.clone()).await {
        Ok(c) => c,
        Err(f) => {
            ctx.log_warn(format!("communication generation failed: {f}"));
            return (None, DeliveryStatus::Skipped);
        }
    };
    if comms.is_empty() {
        ctx.log_warn("communication generation produced nothing to send");
        return (Some(comms), DeliveryStatus::Skipped);
    }

    let insured = canonical.insured();
    let delivery = Delivery {
        claim_id: report.claim_id.clone(),
        comms: comms.clone(),
        fallback_email: insured.and_then(|p| p.contact.as_ref()).map(|c| c.email.clone()),
        fallback_name: insured.map(|p| p.name.clone()),
    };
    let status = match call::<_, String>(ctx, SEND_COMMUNICATIONS, delivery).await {
        Ok(_) => DeliveryStatus::Sent,
        Err(f) => {
            ctx.log_warn(format!("communication delivery failed: {f}"));
            DeliveryStatus::Failed { reason: f.to_string() }
        }
    };
    (Some(comms), status)
}

async fn finalize(ctx: &OrchestrationContext, report: &ClaimAnalysisReport) -> Result<(), ClaimWorkflowError> {
    report_progress(ctx, Step::Finalize, "Saving claim report");
    call::<_, Vec<String>>(ctx, FINALIZE_CLAIM, report.clone())
        .await
        .map(|_| ())
        .map_err(|f| {
            ctx.log_error(format!("finalize failed: {f}"));
            ClaimWorkflowError::Finalize(report.claim_id.clone())
        })
}

fn report_json(report: &ClaimAnalysisReport) -> String {
    // Plain data with string keys
    serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
}
