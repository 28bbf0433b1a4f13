//! Frame dispatch — decode raw frames and feed the task registry.
//!
//! Dispatch is best-effort: malformed or unknown frames are logged and
//! dropped, a terminal-record update is a warned no-op, and nothing here can
//! take the consumer loop down.

use tracing::{debug, info, warn};

use crate::protocol::{decode_frame, BatchStatus, ChannelEvent};
use crate::tasks::model::TaskRecord;
use crate::tasks::registry::TaskRegistry;

/// Outcome of dispatching one raw frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Task records were created or updated.
    Applied(Vec<TaskRecord>),
    /// The frame was malformed, unknown, or a no-op.
    Dropped,
    /// The whole batch finished; the caller owns the follow-up.
    GroupCompleted(BatchStatus),
}

/// Decodes raw frames and routes recognized events to the registry,
/// synchronously and in arrival order.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    applied: u64,
    dropped: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch one raw text frame.
    pub fn dispatch(&mut self, registry: &mut TaskRegistry, raw: &str) -> Dispatch {
        let event = match decode_frame(raw) {
            Ok(event) => event,
            Err(e) => {
                self.dropped += 1;
                debug!(error = %e, frame = raw, "Dropping undecodable frame");
                return Dispatch::Dropped;
            }
        };

        match event {
            ChannelEvent::SourceProgress {
                source_id,
                step,
                progress,
                items_saved,
                source_name,
            } => match registry.apply_progress(
                source_id,
                step,
                progress,
                items_saved,
                source_name.as_deref(),
            ) {
                Ok(record) => {
                    self.applied += 1;
                    Dispatch::Applied(vec![record])
                }
                Err(e) => {
                    self.dropped += 1;
                    warn!(error = %e, "Progress update ignored");
                    Dispatch::Dropped
                }
            },

            ChannelEvent::BatchTaskFailed {
                affected_source_ids,
            } => {
                let failed = registry.apply_batch_failed(&affected_source_ids);
                if failed.is_empty() {
                    self.dropped += 1;
                    Dispatch::Dropped
                } else {
                    self.applied += 1;
                    Dispatch::Applied(failed)
                }
            }

            ChannelEvent::OverallBatchCompleted { status } => {
                self.applied += 1;
                info!(group = %registry.group_id(), status = %status, "Batch completed");
                Dispatch::GroupCompleted(status)
            }
        }
    }

    /// Frames applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Frames dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
