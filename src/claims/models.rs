//! Claim records exchanged between the workflow, its activities and the
//! HTTP surface. All records use camelCase JSON and tolerate missing fields.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw first notice of loss as submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FnolClaim {
    pub claim_id: String,
    pub policy_id: String,
    pub loss_date: String,
    /// Free text, e.g. "2019 Honda Civic LX".
    pub vehicle: String,
    pub location: String,
    pub description: String,
    pub parties: Vec<Party>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Party {
    pub role: String,
    pub name: String,
    pub contact: Option<Contact>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Contact {
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleInfo {
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub year: Option<u16>,
    pub vin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressInfo {
    pub line1: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyRole {
    Insured,
    #[serde(alias = "Third Party", alias = "third_party", alias = "thirdParty")]
    ThirdParty,
    Witness,
    #[default]
    Claimant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanonicalParty {
    pub role: PartyRole,
    pub name: String,
    pub contact: Option<Contact>,
    pub address: Option<AddressInfo>,
}

/// Normalized claim produced by the canonicalize stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanonicalClaim {
    pub claim_id: String,
    pub policy_id: String,
    pub loss_date: String,
    pub vehicle: VehicleInfo,
    pub location: AddressInfo,
    pub description: String,
    pub parties: Vec<CanonicalParty>,
}

impl CanonicalClaim {
    /// Minimal canonical form carrying only what the raw claim states verbatim.
    pub fn minimal_from(raw: &FnolClaim) -> Self {
        Self {
            claim_id: raw.claim_id.clone(),
            policy_id: raw.policy_id.clone(),
            loss_date: raw.loss_date.clone(),
            description: raw.description.clone(),
            ..Self::default()
        }
    }

    pub fn insured(&self) -> Option<&CanonicalParty> {
        self.parties.iter().find(|p| p.role == PartyRole::Insured)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletenessResult {
    pub missing_fields: Vec<String>,
    pub clarifying_questions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoverageBasis {
    pub section: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoverageResult {
    pub covered: bool,
    pub confidence: f64,
    pub basis: Vec<CoverageBasis>,
    pub notes: String,
    pub deductible: Option<f64>,
    pub coverage_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FraudSignal {
    pub id: String,
    pub title: String,
    pub severity: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub suggested_action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FraudResult {
    pub score: f64,
    pub signals: Vec<FraudSignal>,
    pub rationale: String,
    pub safe_to_auto_pay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
    pub recipient_email_address: String,
    pub recipient_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommsResult {
    pub email: EmailContent,
    pub sms: String,
}

impl CommsResult {
    pub fn is_empty(&self) -> bool {
        self.email.subject.is_empty() && self.email.body.is_empty() && self.sms.is_empty()
    }
}

/// How the escalation gate was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum Escalation {
    #[serde(rename_all = "camelCase")]
    Reviewed {
        approved: bool,
        reviewer: Option<String>,
        notes: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TimedOut { routed_to: String },
    /// A review arrived but its verdict could not be read.
    #[serde(rename_all = "camelCase")]
    UnreadableReview { routed_to: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DeliveryStatus {
    Sent,
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Incomplete,
    Approved,
    NotCovered,
    Rejected,
    PendingManualReview,
}

/// Payload of the `FraudReviewCompleted` event: a bare flag or a detailed verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FraudReview {
    Flag(bool),
    Detailed {
        approved: bool,
        #[serde(default)]
        reviewer: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
}

impl From<FraudReview> for Escalation {
    fn from(r: FraudReview) -> Self {
        match r {
            FraudReview::Flag(approved) => Escalation::Reviewed {
                approved,
                reviewer: None,
                notes: None,
            },
            FraudReview::Detailed {
                approved,
                reviewer,
                notes,
            } => Escalation::Reviewed {
                approved,
                reviewer,
                notes,
            },
        }
    }
}

/// Aggregate built up stage by stage and persisted at finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAnalysisReport {
    pub claim_id: String,
    pub raw: FnolClaim,
    pub completeness: CompletenessResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<CanonicalClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud: Option<FraudResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communications: Option<CommsResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryStatus>,
    pub decision: Decision,
}

impl ClaimAnalysisReport {
    pub fn new(raw: FnolClaim, completeness: CompletenessResult) -> Self {
        Self {
            claim_id: raw.claim_id.clone(),
            raw,
            completeness,
            canonical: None,
            coverage: None,
            fraud: None,
            escalation: None,
            communications: None,
            delivery: None,
            // Nothing is approved until the pipeline says so
            decision: Decision::PendingManualReview,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Intake,
    Completeness,
    Canonicalize,
    Analyze,
    EscalationGate,
    Communications,
    Finalize,
    Completed,
    Incomplete,
}

impl Step {
    pub fn progress(self) -> u8 {
        match self {
            Step::Intake => 0,
            Step::Completeness => 10,
            Step::Canonicalize => 30,
            Step::Analyze => 50,
            Step::EscalationGate => 60,
            Step::Communications => 80,
            Step::Finalize => 90,
            Step::Completed | Step::Incomplete => 100,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Published through the instance custom status after every stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub step: Step,
    pub message: String,
    pub progress: u8,
}

impl ProgressReport {
    pub fn new(step: Step, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            progress: step.progress(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fnol_accepts_sparse_camel_case_json() {
        let claim: FnolClaim = serde_json::from_value(json!({
            "claimId": "C-1",
            "policyId": "P-12345",
            "vehicle": "2019 Honda Civic LX",
            "parties": [{"role": "Insured", "name": "Jane", "contact": {"email": "jane@example.com"}}],
            "attachments": [{"type": "photo", "format": "jpg", "uri": "blob://1"}]
        }))
        .unwrap();
        assert_eq!(claim.claim_id, "C-1");
        assert_eq!(claim.loss_date, "");
        assert_eq!(claim.attachments[0].kind, "photo");
        assert_eq!(claim.parties[0].contact.as_ref().unwrap().phone, "");
    }

    #[test]
    fn fraud_review_accepts_flag_or_object() {
        let e: Escalation = serde_json::from_str::<FraudReview>("true").unwrap().into();
        assert_eq!(
            e,
            Escalation::Reviewed {
                approved: true,
                reviewer: None,
                notes: None
            }
        );
        let e: Escalation = serde_json::from_str::<FraudReview>(r#"{"approved":false,"reviewer":"kim"}"#)
            .unwrap()
            .into();
        assert!(matches!(e, Escalation::Reviewed { approved: false, reviewer: Some(_), .. }));
    }

    #[test]
    fn report_omits_stages_not_reached() {
        let r = ClaimAnalysisReport::new(FnolClaim::default(), CompletenessResult::default());
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("canonical").is_none());
        assert!(v.get("communications").is_none());
        assert_eq!(v["decision"], "PendingManualReview");

        let timed_out = serde_json::to_value(Escalation::TimedOut {
            routed_to: "manual-review".into(),
        })
        .unwrap();
        assert_eq!(timed_out, json!({"outcome": "TimedOut", "routedTo": "manual-review"}));
        let unreadable = serde_json::to_value(Escalation::UnreadableReview {
            routed_to: "manual-review".into(),
            reason: "expected value".into(),
        })
        .unwrap();
        assert_eq!(unreadable["outcome"], "UnreadableReview");
        assert_eq!(unreadable["routedTo"], "manual-review");
    }

    #[test]
    fn progress_follows_step() {
        let p = ProgressReport::new(Step::EscalationGate, "awaiting review");
        assert_eq!(p.progress, 60);
        assert_eq!(serde_json::to_value(&p).unwrap()["step"], "EscalationGate");
    }
}
