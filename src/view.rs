//! Merged presentation view — stable ordering and drill-down resolution.

use std::cmp::Reverse;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::history::client::HistoricalRecord;
use crate::protocol::SourceId;
use crate::tasks::model::TaskRecord;

/// One row of the merged task view. The tag lets the presentation layer
/// branch on origin while `source_id`/`saved_count` stay uniform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum MergedEntry {
    Live(TaskRecord),
    History(HistoricalRecord),
}

impl MergedEntry {
    pub fn source_id(&self) -> SourceId {
        match self {
            Self::Live(record) => record.source_id,
            Self::History(record) => record.source_id,
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            Self::Live(record) => &record.source_name,
            Self::History(record) => &record.source_name,
        }
    }

    /// Saved-item count regardless of origin.
    pub fn saved_count(&self) -> u32 {
        match self {
            Self::Live(record) => record.items_saved.unwrap_or(0),
            Self::History(record) => record.items_saved,
        }
    }

    /// True for a live record that has not reached a terminal step.
    pub fn is_live_active(&self) -> bool {
        matches!(self, Self::Live(record) if !record.is_terminal())
    }

    /// `(source id, date)` for filtering the content list behind this row.
    /// Live and just-completed entries resolve to today; persisted entries
    /// resolve to their record date.
    pub fn drill_down(&self, today: NaiveDate) -> (SourceId, NaiveDate) {
        match self {
            Self::Live(record) => (record.source_id, today),
            Self::History(record) => (record.source_id, record.record_date),
        }
    }

    fn effective_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Live(record) => record.updated_at.unwrap_or(now),
            Self::History(record) => record.last_updated_at,
        }
    }
}

/// Sort the merged view for display.
///
/// Active live tasks come first, keeping their arrival order. Terminal and
/// historical entries follow, most recently updated first; a live entry
/// without a timestamp counts as `now`, and on an exact tie a live entry
/// outranks a historical one.
pub fn order_for_display(entries: &mut [MergedEntry], now: DateTime<Utc>) {
    entries.sort_by_key(|entry| {
        if entry.is_live_active() {
            (0u8, Reverse(DateTime::<Utc>::MAX_UTC), 0u8)
        } else {
            let origin = match entry {
                MergedEntry::Live(_) => 0u8,
                MergedEntry::History(_) => 1u8,
            };
            (1u8, Reverse(entry.effective_timestamp(now)), origin)
        }
    });
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::protocol::StepCode;

    fn live(source_id: SourceId, step: StepCode, updated_at: Option<DateTime<Utc>>) -> MergedEntry {
        let mut record = TaskRecord::new(source_id, format!("source {source_id}"));
        record.step = step;
        if step.is_terminal() {
            record.progress = 100;
        }
        record.updated_at = updated_at;
        MergedEntry::Live(record)
    }

    fn history(source_id: SourceId, last_updated_at: DateTime<Utc>) -> MergedEntry {
        MergedEntry::History(HistoricalRecord {
            source_id,
            source_name: format!("source {source_id}"),
            record_date: last_updated_at.date_naive(),
            items_saved: 3,
            last_updated_at,
        })
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, h, m, 0).unwrap()
    }

    #[test]
    fn active_live_entries_come_first_in_arrival_order() {
        let now = at(12, 0);
        let mut entries = vec![
            history(10, at(11, 0)),
            live(1, StepCode::Crawling, Some(at(9, 0))),
            live(2, StepCode::Analyzing, Some(at(8, 0))),
            history(11, at(11, 30)),
        ];
        order_for_display(&mut entries, now);

        let ids: Vec<SourceId> = entries.iter().map(MergedEntry::source_id).collect();
        // 1 and 2 stay in arrival order regardless of timestamps; history
        // follows, most recent first.
        assert_eq!(ids, vec![1, 2, 11, 10]);
    }

    #[test]
    fn terminal_entries_order_by_timestamp_descending() {
        let now = at(12, 0);
        let mut entries = vec![
            history(10, at(9, 0)),
            live(1, StepCode::Complete, Some(at(10, 0))),
            history(11, at(11, 0)),
        ];
        order_for_display(&mut entries, now);

        let ids: Vec<SourceId> = entries.iter().map(MergedEntry::source_id).collect();
        assert_eq!(ids, vec![11, 1, 10]);
    }

    #[test]
    fn live_without_timestamp_counts_as_now_and_wins_ties() {
        let now = at(12, 0);
        let mut entries = vec![
            history(10, now),
            live(1, StepCode::Complete, None),
        ];
        order_for_display(&mut entries, now);

        let ids: Vec<SourceId> = entries.iter().map(MergedEntry::source_id).collect();
        assert_eq!(ids, vec![1, 10]);
    }

    #[test]
    fn drill_down_dates() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();

        let running = live(1, StepCode::Crawling, None);
        assert_eq!(running.drill_down(today), (1, today));

        let done = live(2, StepCode::Complete, Some(at(10, 0)));
        assert_eq!(done.drill_down(today), (2, today));

        let persisted = history(3, Utc.with_ymd_and_hms(2024, 1, 4, 20, 0, 0).unwrap());
        assert_eq!(persisted.drill_down(today), (3, yesterday));
    }

    #[test]
    fn saved_count_is_uniform_across_origins() {
        let mut record = TaskRecord::new(1, "a");
        record.items_saved = Some(7);
        assert_eq!(MergedEntry::Live(record).saved_count(), 7);

        assert_eq!(live(2, StepCode::Crawling, None).saved_count(), 0);
        assert_eq!(history(3, at(10, 0)).saved_count(), 3);
    }
}
