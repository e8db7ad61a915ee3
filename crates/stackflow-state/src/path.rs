//! Scope identity and resource paths
//!
//! Every record lives under `app/stage/type/id`. None of the four segments
//! may be empty, contain `/`, or be `.`/`..`.

use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One deployment target: an application name plus a stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId {
    app: String,
    stage: String,
}

impl ScopeId {
    pub fn new(app: impl Into<String>, stage: impl Into<String>) -> Result<Self> {
        let app = app.into();
        let stage = stage.into();
        validate_segment("app", &app)?;
        validate_segment("stage", &stage)?;
        Ok(Self { app, stage })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Path of a resource in this scope (`app/stage/type/id`)
    pub fn resource_path(&self, resource_type: &str, id: &str) -> Result<String> {
        validate_segment("resource type", resource_type)?;
        validate_segment("resource id", id)?;
        Ok(format!("{}/{}/{}/{}", self.app, self.stage, resource_type, id))
    }

    /// Whether `path` belongs to this scope
    pub fn contains(&self, path: &str) -> bool {
        self.split(path).is_ok()
    }

    /// Split a path of this scope into `(type, id)`
    pub fn split<'a>(&self, path: &'a str) -> Result<(&'a str, &'a str)> {
        let invalid = || StateError::InvalidPath(format!("{} is not in scope {}", path, self));
        let rest = path
            .strip_prefix(self.app.as_str())
            .and_then(|p| p.strip_prefix('/'))
            .and_then(|p| p.strip_prefix(self.stage.as_str()))
            .and_then(|p| p.strip_prefix('/'))
            .ok_or_else(invalid)?;
        let (ty, id) = rest.split_once('/').ok_or_else(invalid)?;
        validate_segment("resource type", ty)?;
        validate_segment("resource id", id)?;
        Ok((ty, id))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.stage)
    }
}

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StateError::InvalidPath(format!("{} must not be empty", kind)));
    }
    if value == "." || value == ".." {
        return Err(StateError::InvalidPath(format!("{} must not be {}", kind, value)));
    }
    if value.contains('/') {
        return Err(StateError::InvalidPath(format!(
            "{} must not contain '/': {}",
            kind, value
        )));
    }
    Ok(())
}
