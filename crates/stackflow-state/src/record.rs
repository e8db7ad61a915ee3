//! Persisted resource records

use crate::error::{Result, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECORD_VERSION: u32 = 1;

fn current_version() -> u32 {
    RECORD_VERSION
}

/// State of a single resource, one per path
///
/// `props` and `output` are stored sealed: secrets inside them are
/// envelopes, never plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    /// Record format version
    #[serde(default = "current_version")]
    pub version: u32,

    /// Resource type tag
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Logical id within the scope
    pub id: String,

    /// Hash of the props that produced `output`
    pub input_hash: String,

    /// Current status
    pub status: RecordStatus,

    /// Last applied input props
    #[serde(default)]
    pub props: Value,

    /// Provider-returned output
    #[serde(default)]
    pub output: Value,

    /// JSON pointers of sealed secrets inside `props` and `output`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_fields: Vec<String>,

    /// Paths this resource was derived from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Incremented on every successful commit
    pub seq: u64,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Error of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StateRecord {
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        input_hash: impl Into<String>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            resource_type: resource_type.into(),
            id: id.into(),
            input_hash: input_hash.into(),
            status: RecordStatus::Pending,
            props: Value::Null,
            output: Value::Null,
            secret_fields: Vec::new(),
            depends_on: Vec::new(),
            seq: 0,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_secret_fields(mut self, secret_fields: Vec<String>) -> Self {
        self.secret_fields = secret_fields;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn is_committed(&self) -> bool {
        self.status == RecordStatus::Committed
    }

    /// Keep the committed fields but flag the failed attempt
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RecordStatus::Error;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Parse a record and reject versions this build cannot read
    pub fn from_json(content: &str) -> Result<Self> {
        let record: StateRecord = serde_json::from_str(content)?;
        if record.version > RECORD_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: record.version,
                supported: RECORD_VERSION,
            });
        }
        Ok(record)
    }
}

/// Lifecycle status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// An operation was dispatched and has not finished
    Pending,
    /// The last operation succeeded
    Committed,
    /// The last operation failed; committed fields are from the previous success
    Error,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Committed => write!(f, "committed"),
            RecordStatus::Error => write!(f, "error"),
        }
    }
}
