//! Authoritative in-memory task state for one task group.
//!
//! The registry is a plain owned map; all mutation flows through the engine's
//! single consumer loop, so there is no interior locking. Snapshots are
//! cloned out and never hold a reference across an await point.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::TaskApplyError;
use crate::protocol::{SourceId, StepCode, TaskGroupId};
use crate::tasks::model::{placeholder_name, SourceSeed, TaskRecord};

/// Note attached to records killed by a batch-level failure.
const BATCH_FAILURE_MESSAGE: &str = "batch failed before this source finished";

/// In-memory map from source id to live task state.
#[derive(Debug)]
pub struct TaskRegistry {
    group_id: TaskGroupId,
    records: HashMap<SourceId, TaskRecord>,
    /// Arrival order, for deterministic snapshots.
    order: Vec<SourceId>,
}

impl TaskRegistry {
    /// Create an empty registry for one task group.
    pub fn new(group_id: TaskGroupId) -> Self {
        Self {
            group_id,
            records: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &TaskGroupId {
        &self.group_id
    }

    /// Pre-seed records at `Preparing/0` for sources known up front.
    /// Sources that already reported an event are left untouched.
    pub fn seed(&mut self, seeds: &[SourceSeed]) {
        for seed in seeds {
            if !self.records.contains_key(&seed.source_id) {
                self.insert(TaskRecord::new(seed.source_id, seed.source_name.clone()));
            }
        }
    }

    /// Apply one progress event.
    ///
    /// Creates the record on first contact. A terminal record rejects the
    /// update (`TaskApplyError::TerminalRecord`) and stays unchanged.
    /// Progress merges monotonically; a terminal step forces `progress = 100`
    /// and locks the record.
    pub fn apply_progress(
        &mut self,
        source_id: SourceId,
        step: StepCode,
        progress: Option<u8>,
        items_saved: Option<u32>,
        source_name: Option<&str>,
    ) -> Result<TaskRecord, TaskApplyError> {
        let records = &mut self.records;
        let order = &mut self.order;
        let record = records.entry(source_id).or_insert_with(|| {
            order.push(source_id);
            let name = source_name
                .map(str::to_string)
                .unwrap_or_else(|| placeholder_name(source_id));
            TaskRecord::new(source_id, name)
        });

        if record.is_terminal() {
            return Err(TaskApplyError::TerminalRecord {
                source_id,
                step: record.step,
            });
        }

        if let Some(name) = source_name {
            record.source_name = name.to_string();
        }

        record.step = step;

        if let Some(new) = progress.map(|p| p.min(100)) {
            if new < record.progress {
                debug!(
                    source_id,
                    old = record.progress,
                    new,
                    "Ignoring progress regression"
                );
            }
            record.progress = record.progress.max(new);
        }

        if items_saved.is_some() {
            record.items_saved = items_saved;
        }

        if step.is_terminal() {
            record.progress = 100;
        }

        record.updated_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Force every affected, present, non-terminal record to `Error/100`.
    ///
    /// Absent ids and already-terminal records are untouched. Returns the
    /// records that were actually failed.
    pub fn apply_batch_failed(&mut self, affected: &[SourceId]) -> Vec<TaskRecord> {
        let mut failed = Vec::new();
        for &source_id in affected {
            match self.records.get_mut(&source_id) {
                Some(record) if !record.is_terminal() => {
                    record.step = StepCode::Error;
                    record.progress = 100;
                    record.message = Some(BATCH_FAILURE_MESSAGE.to_string());
                    record.updated_at = Some(Utc::now());
                    failed.push(record.clone());
                }
                Some(record) => {
                    debug!(
                        source_id,
                        step = %record.step,
                        "Batch failure skipped already-terminal source"
                    );
                }
                None => {
                    debug!(source_id, "Batch failure names an unknown source");
                }
            }
        }
        if !failed.is_empty() {
            info!(
                group = %self.group_id,
                count = failed.len(),
                "Sources failed by batch-level failure"
            );
        }
        failed
    }

    /// Immutable copy of all records, in arrival order.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, source_id: SourceId) -> Option<&TaskRecord> {
        self.records.get(&source_id)
    }

    /// Drop all terminal records (user "clear completed" action).
    /// Returns the number removed.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_terminal());
        self.order.retain(|id| self.records.contains_key(id));
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, record: TaskRecord) {
        self.order.push(record.source_id);
        self.records.insert(record.source_id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(TaskGroupId::new("grp-1"))
    }

    #[test]
    fn seed_creates_preparing_records() {
        let mut reg = registry();
        reg.seed(&[SourceSeed::new(1, "Alpha"), SourceSeed::new(2, "Beta")]);

        assert_eq!(reg.len(), 2);
        let record = reg.get(1).unwrap();
        assert_eq!(record.step, StepCode::Preparing);
        assert_eq!(record.progress, 0);
        assert_eq!(record.source_name, "Alpha");
    }

    #[test]
    fn seed_does_not_clobber_existing_records() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Crawling, Some(30), None, Some("Alpha"))
            .unwrap();
        reg.seed(&[SourceSeed::new(1, "Alpha")]);

        assert_eq!(reg.get(1).unwrap().step, StepCode::Crawling);
        assert_eq!(reg.get(1).unwrap().progress, 30);
    }

    #[test]
    fn first_event_creates_record() {
        let mut reg = registry();
        let record = reg
            .apply_progress(5, StepCode::Crawling, Some(10), None, None)
            .unwrap();

        assert_eq!(record.source_id, 5);
        assert_eq!(record.step, StepCode::Crawling);
        assert_eq!(record.progress, 10);
        assert_eq!(record.source_name, "source 5");
        assert!(record.updated_at.is_some());
    }

    #[test]
    fn progress_is_monotonic() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Crawling, Some(40), None, None)
            .unwrap();
        let record = reg
            .apply_progress(1, StepCode::Crawling, Some(25), None, None)
            .unwrap();
        assert_eq!(record.progress, 40);

        let record = reg
            .apply_progress(1, StepCode::Analyzing, Some(70), None, None)
            .unwrap();
        assert_eq!(record.progress, 70);
    }

    #[test]
    fn missing_progress_keeps_previous_value() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Crawling, Some(55), None, None)
            .unwrap();
        let record = reg
            .apply_progress(1, StepCode::ExtractingLinks, None, None, None)
            .unwrap();
        assert_eq!(record.progress, 55);
        assert_eq!(record.step, StepCode::ExtractingLinks);
    }

    #[test]
    fn terminal_step_forces_full_progress() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Analyzing, Some(60), None, None)
            .unwrap();
        let record = reg
            .apply_progress(1, StepCode::Complete, None, Some(9), None)
            .unwrap();

        assert_eq!(record.progress, 100);
        assert_eq!(record.items_saved, Some(9));
        assert!(record.is_terminal());
    }

    #[test]
    fn terminal_record_rejects_further_mutation() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Complete, None, None, None)
            .unwrap();

        let err = reg
            .apply_progress(1, StepCode::Crawling, Some(10), None, None)
            .unwrap_err();
        match err {
            TaskApplyError::TerminalRecord { source_id, step } => {
                assert_eq!(source_id, 1);
                assert_eq!(step, StepCode::Complete);
            }
        }

        // Unchanged.
        let record = reg.get(1).unwrap();
        assert_eq!(record.step, StepCode::Complete);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn terminal_rejection_is_idempotent() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Error, None, None, None)
            .unwrap();
        let snapshot = reg.snapshot();

        for _ in 0..3 {
            assert!(
                reg.apply_progress(1, StepCode::Saving, Some(80), None, None)
                    .is_err()
            );
        }
        assert_eq!(reg.snapshot(), snapshot);
    }

    #[test]
    fn batch_failure_targets_non_terminal_only() {
        let mut reg = registry();
        reg.apply_progress(7, StepCode::Analyzing, Some(40), None, None)
            .unwrap();
        reg.apply_progress(9, StepCode::Complete, None, None, None)
            .unwrap();

        let failed = reg.apply_batch_failed(&[7, 9]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].source_id, 7);

        let seven = reg.get(7).unwrap();
        assert_eq!(seven.step, StepCode::Error);
        assert_eq!(seven.progress, 100);
        assert!(seven.is_terminal());
        assert!(seven.message.is_some());

        let nine = reg.get(9).unwrap();
        assert_eq!(nine.step, StepCode::Complete);
        assert!(nine.message.is_none());
    }

    #[test]
    fn batch_failure_ignores_unknown_sources() {
        let mut reg = registry();
        let failed = reg.apply_batch_failed(&[42]);
        assert!(failed.is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_preserves_arrival_order() {
        let mut reg = registry();
        reg.apply_progress(9, StepCode::Crawling, None, None, None)
            .unwrap();
        reg.apply_progress(3, StepCode::Crawling, None, None, None)
            .unwrap();
        reg.apply_progress(6, StepCode::Crawling, None, None, None)
            .unwrap();

        let ids: Vec<SourceId> = reg.snapshot().iter().map(|r| r.source_id).collect();
        assert_eq!(ids, vec![9, 3, 6]);
    }

    #[test]
    fn clear_completed_drops_terminal_records() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Crawling, Some(20), None, None)
            .unwrap();
        reg.apply_progress(2, StepCode::Complete, None, None, None)
            .unwrap();
        reg.apply_progress(3, StepCode::Skipped, None, None, None)
            .unwrap();

        assert_eq!(reg.clear_completed(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(1).is_some());

        let ids: Vec<SourceId> = reg.snapshot().iter().map(|r| r.source_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn event_name_refreshes_record() {
        let mut reg = registry();
        reg.apply_progress(1, StepCode::Crawling, None, None, None)
            .unwrap();
        assert_eq!(reg.get(1).unwrap().source_name, "source 1");

        reg.apply_progress(1, StepCode::Analyzing, None, None, Some("Tech Blog"))
            .unwrap();
        assert_eq!(reg.get(1).unwrap().source_name, "Tech Blog");
    }
}
