//! Insurance claim processing on top of the durable runtime.
pub mod activities;
pub mod models;
pub mod workflow;

pub use activities::{register_activities, ClaimServices};
pub use models::*;
pub use workflow::{
    process_claim, register_orchestration, ClaimWorkflowError, EscalationPolicy, FRAUD_REVIEW_COMPLETED, PROCESS_CLAIM,
};
