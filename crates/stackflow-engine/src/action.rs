//! Planned operations and sweep results

use serde::{Deserialize, Serialize};

/// Represents a planned operation on one resource path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Resource path (`app/stage/type/id`)
    pub path: String,

    /// Type of action to perform
    pub action_type: ActionType,

    /// Resource type tag
    pub resource_type: String,

    /// Logical resource id
    pub resource_id: String,

    /// Description of the action
    pub description: String,
}

impl Action {
    pub fn new(
        path: impl Into<String>,
        action_type: ActionType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let description = format!("{} {}", action_type, path);
        Self {
            path,
            action_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            description,
        }
    }
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Take over a pre-existing physical resource
    Adopt,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Adopt => write!(f, "adopt"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Plan containing all actions to be applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// List of actions to perform
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = actions.iter().any(|a| a.action_type != ActionType::NoOp);
        Self {
            actions,
            has_changes,
        }
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            adopt: self.actions_by_type(ActionType::Adopt).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            delete: self.actions_by_type(ActionType::Delete).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub adopt: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to adopt, {} to update, {} to delete, {} unchanged",
            self.create, self.adopt, self.update, self.delete, self.no_change
        )
    }
}

/// Result of the end-of-run orphan sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Orphans whose physical resource and record were removed
    pub deleted: Vec<String>,

    /// Orphans whose delete failed; their records are kept
    pub failed: Vec<SweepFailure>,

    /// Orphans kept because a resource derived from them could not be deleted
    pub blocked: Vec<String>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl SweepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }

    pub fn add_failure(&mut self, path: String, error: String) {
        self.failed.push(SweepFailure { path, error });
    }
}

/// A single failed orphan deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub path: String,
    pub error: String,
}
