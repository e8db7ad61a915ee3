//! Declared resources and their outputs

use serde_json::Value;
use stackflow_state::Secret;

/// A desired resource for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    resource_type: String,
    id: String,
    props: Value,
    adopt: bool,
    force: bool,
    depends_on: Vec<String>,
}

impl Declaration {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>, props: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            props,
            adopt: false,
            force: false,
            depends_on: Vec::new(),
        }
    }

    /// Manage a pre-existing physical resource instead of creating one
    pub fn adopt(mut self) -> Self {
        self.adopt = true;
        self
    }

    /// Dispatch an update even when props are unchanged
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Record that this resource is derived from `output`
    pub fn depends_on(self, output: &Output) -> Self {
        self.depends_on_path(output.path.clone())
    }

    pub fn depends_on_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !self.depends_on.contains(&path) {
            self.depends_on.push(path);
        }
        self
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn props(&self) -> &Value {
        &self.props
    }

    pub fn is_adopt(&self) -> bool {
        self.adopt
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

/// Committed output of a resource, visible to later declarations
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub path: String,
    pub resource_type: String,
    pub id: String,
    pub value: Value,
    pub seq: u64,
}

impl Output {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Read a secret output field
    pub fn secret(&self, key: &str) -> Option<Secret> {
        self.get(key).and_then(Secret::from_value)
    }
}
