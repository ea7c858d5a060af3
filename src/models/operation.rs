//! Async job tracking types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of an async job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// A retain (ingestion) job.
    Retain,
    /// A consolidation job.
    Consolidation,
}

impl OperationType {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retain => "retain",
            Self::Consolidation => "consolidation",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retain" => Some(Self::Retain),
            "consolidation" => Some(Self::Consolidation),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an async job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Queued, not yet picked up.
    Pending,
    /// A worker is executing the job.
    Running,
    /// Finished successfully; `result` is populated.
    Completed,
    /// Finished with an error; `error` is populated.
    Failed,
}

impl OperationStatus {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A row tracking the lifecycle of an async job, visible to external
/// callers through the operation-status lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier (UUID v4 in string form).
    pub id: String,
    /// Owning bank.
    pub bank_id: String,
    /// Job kind.
    pub op_type: OperationType,
    /// Current state.
    pub status: OperationStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the job up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// JSON result payload on success.
    pub result: Option<serde_json::Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Completed,
            OperationStatus::Failed,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
        }
    }
}
