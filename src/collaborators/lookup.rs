use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::CollaboratorError;

/// Read-only document lookup keyed by id.
#[async_trait]
pub trait LookupTool: Send + Sync {
    async fn fetch_by_id(&self, id: &str) -> Result<String, CollaboratorError>;
}

type IdValidator = fn(&str) -> bool;

/// One file per id under a root directory.
pub struct DirectoryLookup {
    root: PathBuf,
    extension: Option<String>,
    validator: Option<IdValidator>,
}

impl DirectoryLookup {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extension: None,
            validator: None,
        }
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    pub fn with_validator(mut self, validator: IdValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CollaboratorError> {
        let plain = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !plain || self.validator.is_some_and(|v| !v(id)) {
            return Err(CollaboratorError::InvalidId(id.to_string()));
        }
        Ok(match &self.extension {
            Some(ext) => self.root.join(format!("{id}.{ext}")),
            None => self.root.join(id),
        })
    }
}

#[async_trait]
impl LookupTool for DirectoryLookup {
    async fn fetch_by_id(&self, id: &str) -> Result<String, CollaboratorError> {
        let path = self.path_for(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CollaboratorError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed in-memory documents.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    docs: HashMap<String, String>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.docs.insert(id.into(), text.into());
        self
    }
}

#[async_trait]
impl LookupTool for StaticLookup {
    async fn fetch_by_id(&self, id: &str) -> Result<String, CollaboratorError> {
        self.docs
            .get(id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))
    }
}

/// Policy ids are `P-` followed by 5 to 10 digits.
pub fn policy_id_is_valid(id: &str) -> bool {
    id.strip_prefix("P-")
        .is_some_and(|digits| (5..=10).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()))
}
