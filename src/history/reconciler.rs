//! Reconciliation of live registry state with persisted history.
//!
//! One external read per date: concurrent requests for the same date share a
//! single in-flight fetch, and completed fetches are cached until
//! invalidated. Live state participates in the merged view for today only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::HistoryFetchError;
use crate::history::client::{HistoricalRecord, HistoryStore};
use crate::protocol::SourceId;
use crate::tasks::model::TaskRecord;
use crate::view::MergedEntry;

type SharedFetch =
    Shared<BoxFuture<'static, Result<Arc<Vec<HistoricalRecord>>, HistoryFetchError>>>;

/// Coalescing, caching front for the history store.
pub struct HistoryReconciler {
    store: Arc<dyn HistoryStore>,
    cache: Mutex<HashMap<NaiveDate, Arc<Vec<HistoricalRecord>>>>,
    inflight: Mutex<HashMap<NaiveDate, SharedFetch>>,
    /// Bumped by `cancel_pending`; a fetch started under an older generation
    /// discards its result instead of applying it.
    generation: AtomicU64,
}

impl HistoryReconciler {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Records for `date`, from cache, a shared in-flight fetch, or a fresh
    /// store call. Two concurrent calls for the same date issue exactly one
    /// underlying read.
    pub async fn records_for(
        &self,
        date: NaiveDate,
    ) -> Result<Arc<Vec<HistoricalRecord>>, HistoryFetchError> {
        if let Some(hit) = self.cache.lock().await.get(&date) {
            return Ok(hit.clone());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let fetch = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&date) {
                Some(fetch) => fetch.clone(),
                None => {
                    let store = self.store.clone();
                    let fetch: SharedFetch = async move {
                        store.records_for_date(date).await.map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    inflight.insert(date, fetch.clone());
                    debug!(%date, "History fetch started");
                    fetch
                }
            }
        };

        let result = fetch.await;
        self.inflight.lock().await.remove(&date);

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(%date, "Discarding late history result from a superseded request");
            return Err(HistoryFetchError::Cancelled);
        }

        match result {
            Ok(records) => {
                self.cache.lock().await.insert(date, records.clone());
                Ok(records)
            }
            Err(e) => {
                warn!(%date, error = %e, "History fetch failed");
                Err(e)
            }
        }
    }

    /// Drop any cached records for `date` so the next read refetches.
    pub async fn invalidate(&self, date: NaiveDate) {
        if self.cache.lock().await.remove(&date).is_some() {
            debug!(%date, "History cache invalidated");
        }
    }

    /// Abandon in-flight fetches. Late responses are discarded, not applied.
    pub fn cancel_pending(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Merged view for `date`: for today, live and historical records are
    /// reconciled; for any other date, only history is shown.
    pub async fn view_for_date(
        &self,
        date: NaiveDate,
        today: NaiveDate,
        live: &[TaskRecord],
    ) -> Result<Vec<MergedEntry>, HistoryFetchError> {
        let history = self.records_for(date).await?;
        Ok(merge_view(date, today, live, &history))
    }
}

/// Pure merge for an arbitrary date. Past dates never show live state.
pub fn merge_view(
    date: NaiveDate,
    today: NaiveDate,
    live: &[TaskRecord],
    history: &[HistoricalRecord],
) -> Vec<MergedEntry> {
    if date == today {
        merge_for_today(live, history)
    } else {
        history.iter().cloned().map(MergedEntry::History).collect()
    }
}

/// Merge live records with today's history.
///
/// Live state wins while a source is still running: a historical entry for a
/// source with a live non-terminal record is suppressed. Once the source is
/// terminal the persisted record (when the store has caught up) becomes
/// authoritative and the live entry is dropped instead.
pub fn merge_for_today(live: &[TaskRecord], history: &[HistoricalRecord]) -> Vec<MergedEntry> {
    let recorded: HashSet<SourceId> = history.iter().map(|h| h.source_id).collect();
    let active: HashSet<SourceId> = live
        .iter()
        .filter(|r| !r.is_terminal())
        .map(|r| r.source_id)
        .collect();

    let mut merged: Vec<MergedEntry> = Vec::with_capacity(live.len() + history.len());

    for record in live {
        if record.is_terminal() && recorded.contains(&record.source_id) {
            continue;
        }
        merged.push(MergedEntry::Live(record.clone()));
    }
    for record in history {
        if !active.contains(&record.source_id) {
            merged.push(MergedEntry::History(record.clone()));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::protocol::StepCode;

    struct CountingStore {
        calls: AtomicUsize,
        delay: Duration,
        records: Vec<HistoricalRecord>,
    }

    impl CountingStore {
        fn new(records: Vec<HistoricalRecord>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
                records,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HistoryStore for CountingStore {
        async fn records_for_date(
            &self,
            date: NaiveDate,
        ) -> Result<Vec<HistoricalRecord>, HistoryFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self
                .records
                .iter()
                .filter(|r| r.record_date == date)
                .cloned()
                .collect())
        }
    }

    fn historical(source_id: SourceId, date: NaiveDate) -> HistoricalRecord {
        HistoricalRecord {
            source_id,
            source_name: format!("source {source_id}"),
            record_date: date,
            items_saved: 5,
            last_updated_at: Utc.with_ymd_and_hms(2024, 1, 5, 20, 0, 0).unwrap(),
        }
    }

    fn live(source_id: SourceId, step: StepCode) -> TaskRecord {
        let mut record = TaskRecord::new(source_id, format!("source {source_id}"));
        record.step = step;
        if step.is_terminal() {
            record.progress = 100;
        }
        record
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_fetch() {
        let day = date(2024, 1, 1);
        let store = CountingStore::new(vec![historical(1, day)]);
        let reconciler = HistoryReconciler::new(store.clone());

        let (a, b) = tokio::join!(reconciler.records_for(day), reconciler.records_for(day));
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn cache_serves_repeat_reads() {
        let day = date(2024, 1, 1);
        let store = CountingStore::new(vec![historical(1, day)]);
        let reconciler = HistoryReconciler::new(store.clone());

        reconciler.records_for(day).await.unwrap();
        reconciler.records_for(day).await.unwrap();
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let day = date(2024, 1, 1);
        let store = CountingStore::new(vec![historical(1, day)]);
        let reconciler = HistoryReconciler::new(store.clone());

        reconciler.records_for(day).await.unwrap();
        reconciler.invalidate(day).await;
        reconciler.records_for(day).await.unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_fetch_discards_late_result() {
        let day = date(2024, 1, 1);
        let store = CountingStore::new(vec![historical(1, day)]);
        let reconciler = Arc::new(HistoryReconciler::new(store.clone()));

        let pending = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.records_for(day).await })
        };
        // Let the fetch start, then supersede it.
        tokio::time::sleep(Duration::from_millis(5)).await;
        reconciler.cancel_pending();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HistoryFetchError::Cancelled)));

        // Nothing was cached; the next read hits the store again.
        reconciler.records_for(day).await.unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn live_non_terminal_suppresses_todays_history() {
        let today = date(2024, 1, 5);
        let merged = merge_for_today(
            &[live(3, StepCode::Crawling)],
            &[historical(3, today)],
        );
        assert_eq!(merged.len(), 1);
        assert!(matches!(&merged[0], MergedEntry::Live(r) if r.source_id == 3));
    }

    #[test]
    fn live_terminal_without_history_is_kept() {
        let merged = merge_for_today(&[live(3, StepCode::Complete)], &[]);
        assert_eq!(merged.len(), 1);
        assert!(matches!(&merged[0], MergedEntry::Live(r) if r.source_id == 3));
    }

    #[test]
    fn history_supersedes_live_terminal_once_persisted() {
        let today = date(2024, 1, 5);
        let merged = merge_for_today(
            &[live(3, StepCode::Complete)],
            &[historical(3, today)],
        );
        assert_eq!(merged.len(), 1);
        assert!(matches!(&merged[0], MergedEntry::History(r) if r.source_id == 3));
    }

    #[test]
    fn unrelated_history_and_live_both_appear() {
        let today = date(2024, 1, 5);
        let merged = merge_for_today(
            &[live(1, StepCode::Analyzing)],
            &[historical(2, today)],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn past_dates_never_show_live_state() {
        let today = date(2024, 1, 5);
        let yesterday = date(2024, 1, 4);
        let merged = merge_view(
            yesterday,
            today,
            &[live(1, StepCode::Crawling), live(2, StepCode::Complete)],
            &[historical(9, yesterday)],
        );
        assert_eq!(merged.len(), 1);
        assert!(matches!(&merged[0], MergedEntry::History(r) if r.source_id == 9));
    }
}
