//! Wire protocol for the task-group push channel.
//!
//! Frames are JSON envelopes `{"event": <string>, ...fields}`. Unknown
//! `event` values and malformed payloads decode to an error the dispatcher
//! drops; the connection itself is never affected by a bad frame.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Integer identifier of a content source; unique within a task group.
pub type SourceId = i64;

/// Opaque identifier of one batch of source jobs, minted by the trigger call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskGroupId(String);

impl TaskGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskGroupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Processing stage of a single source, ordered by pipeline position.
///
/// Serialized as its integer code (1–8). `Complete`, `Error`, and `Skipped`
/// are sinks: once reached, a task record accepts no further mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StepCode {
    Preparing = 1,
    Crawling = 2,
    ExtractingLinks = 3,
    Analyzing = 4,
    Saving = 5,
    Complete = 6,
    Error = 7,
    Skipped = 8,
}

impl StepCode {
    /// Check if this is a terminal step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Skipped)
    }
}

impl std::fmt::Display for StepCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Preparing => "Preparing",
            Self::Crawling => "Crawling",
            Self::ExtractingLinks => "Extracting links",
            Self::Analyzing => "Analyzing",
            Self::Saving => "Saving",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::Skipped => "Skipped",
        };
        f.write_str(s)
    }
}

impl TryFrom<u8> for StepCode {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            1 => Ok(Self::Preparing),
            2 => Ok(Self::Crawling),
            3 => Ok(Self::ExtractingLinks),
            4 => Ok(Self::Analyzing),
            5 => Ok(Self::Saving),
            6 => Ok(Self::Complete),
            7 => Ok(Self::Error),
            8 => Ok(Self::Skipped),
            other => Err(format!("unknown step code {other}")),
        }
    }
}

impl From<StepCode> for u8 {
    fn from(step: StepCode) -> u8 {
        step as u8
    }
}

/// Outcome reported by `overall_batch_completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Partial,
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Events carried by the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// One source moved forward (or failed) in its pipeline.
    #[serde(rename_all = "camelCase")]
    SourceProgress {
        source_id: SourceId,
        step: StepCode,
        #[serde(default)]
        progress: Option<u8>,
        #[serde(default)]
        items_saved: Option<u32>,
        #[serde(default)]
        source_name: Option<String>,
    },

    /// The surrounding batch died; the listed sources never got to finish.
    #[serde(rename_all = "camelCase")]
    BatchTaskFailed { affected_source_ids: Vec<SourceId> },

    /// The whole batch finished.
    #[serde(rename_all = "camelCase")]
    OverallBatchCompleted { status: BatchStatus },
}

/// Decode a raw text frame into a typed event.
pub fn decode_frame(raw: &str) -> Result<ChannelEvent, DecodeError> {
    if raw.trim().is_empty() {
        return Err(DecodeError::EmptyFrame);
    }
    serde_json::from_str(raw).map_err(DecodeError::from)
}
