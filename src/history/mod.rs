//! Persisted history: REST client and live/history reconciliation.

pub mod client;
pub mod reconciler;

pub use client::{HistoricalRecord, HistoryStore, HttpHistoryStore, TriggerResponse};
pub use reconciler::{merge_for_today, merge_view, HistoryReconciler};
