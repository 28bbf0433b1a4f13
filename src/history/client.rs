//! External REST calls: history read and the batch trigger response shape.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HistoryFetchError;
use crate::protocol::{SourceId, TaskGroupId};

/// Persisted completion record for one source on one calendar date.
/// Read-only from the engine's perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRecord {
    pub source_id: SourceId,
    pub source_name: String,
    pub record_date: NaiveDate,
    pub items_saved: u32,
    pub last_updated_at: DateTime<Utc>,
}

/// Read-only history store, keyed by calendar date.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn records_for_date(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<HistoricalRecord>, HistoryFetchError>;
}

/// Response shape of the external batch-trigger call. The group id is the
/// sole input the engine needs to open a channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub task_group_id: TaskGroupId,
}

/// Kick off a new batch and return its task group id.
pub async fn trigger_batch(
    client: &reqwest::Client,
    url: &str,
) -> Result<TaskGroupId, HistoryFetchError> {
    let response = client
        .post(url)
        .send()
        .await
        .map_err(|e| HistoryFetchError::Request {
            reason: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(HistoryFetchError::Status {
            status: response.status().as_u16(),
        });
    }

    let trigger: TriggerResponse =
        response
            .json()
            .await
            .map_err(|e| HistoryFetchError::Payload {
                reason: e.to_string(),
            })?;
    Ok(trigger.task_group_id)
}

/// HTTP-backed history store: `GET {base}/history?date=YYYY-MM-DD`.
pub struct HttpHistoryStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHistoryStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn history_url(&self, date: NaiveDate) -> String {
        format!("{}/history?date={}", self.base_url, date.format("%Y-%m-%d"))
    }
}

#[async_trait]
impl HistoryStore for HttpHistoryStore {
    async fn records_for_date(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<HistoricalRecord>, HistoryFetchError> {
        let response = self
            .client
            .get(self.history_url(date))
            .send()
            .await
            .map_err(|e| HistoryFetchError::Request {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(HistoryFetchError::Status {
                status: response.status().as_u16(),
            });
        }

        response
            .json::<Vec<HistoricalRecord>>()
            .await
            .map_err(|e| HistoryFetchError::Payload {
                reason: e.to_string(),
            })
    }
}
