//! Boundaries to the systems claim activities talk to: blob storage for the
//! final report, messaging for customer email and adjuster queues, and
//! read-only lookups consulted while building reasoning prompts.
use thiserror::Error;

pub mod lookup;
pub mod messaging;
pub mod storage;

pub use lookup::{policy_id_is_valid, DirectoryLookup, LookupTool, StaticLookup};
pub use messaging::{EmailMessage, InMemoryMessaging, Messaging, OutboxMessaging, QueuedMessage};
pub use storage::{BlobStorage, FsBlobStorage, InMemoryBlobStorage};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(e: serde_json::Error) -> Self {
        CollaboratorError::Rejected(format!("not serializable: {e}"))
    }
}
