//! Live task records for the currently-open task group.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{SourceId, StepCode};

/// Source known up front, seeded into the registry when the batch is accepted.
#[derive(Debug, Clone)]
pub struct SourceSeed {
    pub source_id: SourceId,
    pub source_name: String,
}

impl SourceSeed {
    pub fn new(source_id: SourceId, source_name: impl Into<String>) -> Self {
        Self {
            source_id,
            source_name: source_name.into(),
        }
    }
}

/// Live progress record for one source within the open task group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub source_id: SourceId,
    pub source_name: String,
    pub step: StepCode,
    /// 0–100; monotonically non-decreasing, forced to 100 at a terminal step.
    pub progress: u8,
    /// Items saved during this run, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_saved: Option<u32>,
    /// Set when the record was force-failed by a batch-level failure, to
    /// distinguish it from a source whose own step errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last applied mutation. `None` until the first event lands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a fresh record at the start of the pipeline.
    pub fn new(source_id: SourceId, source_name: impl Into<String>) -> Self {
        Self {
            source_id,
            source_name: source_name.into(),
            step: StepCode::Preparing,
            progress: 0,
            items_saved: None,
            message: None,
            updated_at: None,
        }
    }

    /// Check if this record has reached a sink step.
    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }
}

/// Fallback display name for a source that never announced one.
pub(crate) fn placeholder_name(source_id: SourceId) -> String {
    format!("source {source_id}")
}
