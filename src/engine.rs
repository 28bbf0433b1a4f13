//! Per-task-group progress engine.
//!
//! One engine instance owns one task group: its channel connection, its task
//! registry, and its history reconciler. All registry mutation happens on a
//! single consumer loop, so the registry itself carries no locks. The engine
//! is discarded, never reused, when a new group supersedes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::connection::{ChannelCloser, ChannelConnection, ChannelNotice, ChannelState};
use crate::channel::dispatcher::{Dispatch, EventDispatcher};
use crate::config::EngineConfig;
use crate::error::{ConnError, HistoryFetchError};
use crate::history::client::HistoryStore;
use crate::history::reconciler::HistoryReconciler;
use crate::protocol::{BatchStatus, TaskGroupId};
use crate::tasks::model::{SourceSeed, TaskRecord};
use crate::tasks::registry::TaskRegistry;
use crate::view::{order_for_display, MergedEntry};

/// Capacity of the engine event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Capacity of the command channel into the consumer loop.
const COMMAND_CAPACITY: usize = 16;

/// Engine notifications for view consumers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A task record was created or updated.
    TaskUpdated { record: TaskRecord },
    /// The batch finished; a channel close and history refresh are scheduled.
    GroupCompleted { status: BatchStatus },
    /// The post-completion history refresh landed.
    HistoryRefreshed { date: NaiveDate },
    /// The frame stream ended for good.
    ChannelClosed,
}

enum Command {
    Snapshot(oneshot::Sender<Vec<TaskRecord>>),
    ClearCompleted(oneshot::Sender<usize>),
    Shutdown,
}

/// Progress engine for one task group.
pub struct ProgressEngine {
    group_id: TaskGroupId,
    connection: ChannelConnection,
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    reconciler: Arc<HistoryReconciler>,
    loop_task: JoinHandle<()>,
}

impl ProgressEngine {
    /// Open the channel for `group_id` and start the consumer loop.
    ///
    /// `seeds` pre-populate the registry at `Preparing/0`. A failure of the
    /// initial channel open is returned here; later connection trouble
    /// surfaces through the channel notice subscription.
    pub async fn start(
        config: EngineConfig,
        group_id: TaskGroupId,
        credential: Option<SecretString>,
        store: Arc<dyn HistoryStore>,
        seeds: Vec<SourceSeed>,
    ) -> Result<Self, ConnError> {
        let mut connection = ChannelConnection::new(config.channel.clone());
        let handle = connection.open(group_id.clone(), credential).await?;
        let frames = handle
            .take_frames()
            .expect("frames are taken once, at open");
        let closer = handle.closer();

        let mut registry = TaskRegistry::new(group_id.clone());
        registry.seed(&seeds);
        if !seeds.is_empty() {
            info!(group = %group_id, sources = seeds.len(), "Registry seeded");
        }

        let reconciler = Arc::new(HistoryReconciler::new(store));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let loop_task = tokio::spawn(run_loop(LoopCtx {
            group_id: group_id.clone(),
            registry,
            dispatcher: EventDispatcher::new(),
            frames,
            cmd_rx,
            events: events.clone(),
            closer,
            reconciler: reconciler.clone(),
            close_grace: config.close_grace,
        }));

        Ok(Self {
            group_id,
            connection,
            cmd_tx,
            events,
            reconciler,
            loop_task,
        })
    }

    pub fn group_id(&self) -> &TaskGroupId {
        &self.group_id
    }

    /// Subscribe to engine events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to channel lifecycle notices.
    pub fn subscribe_channel(&self) -> Option<broadcast::Receiver<ChannelNotice>> {
        self.connection.current().map(|handle| handle.subscribe())
    }

    pub fn channel_state(&self) -> ChannelState {
        self.connection
            .current()
            .map(|handle| handle.state())
            .unwrap_or(ChannelState::Closed)
    }

    /// Immutable copy of all live task records, in arrival order.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drop terminal records from the live set. Returns the number removed.
    pub async fn clear_completed(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ClearCompleted(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Ordered merged view for today.
    pub async fn merged_view_today(&self) -> Result<Vec<MergedEntry>, HistoryFetchError> {
        self.view_for_date(Utc::now().date_naive()).await
    }

    /// Ordered merged view for an arbitrary date. Past dates show history
    /// only, regardless of registry contents.
    pub async fn view_for_date(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<MergedEntry>, HistoryFetchError> {
        let today = Utc::now().date_naive();
        let live = if date == today {
            self.snapshot().await
        } else {
            Vec::new()
        };
        let mut entries = self.reconciler.view_for_date(date, today, &live).await?;
        order_for_display(&mut entries, Utc::now());
        Ok(entries)
    }

    /// Tear the engine down: cancel pending fetches and timers, close the
    /// channel, and stop the consumer loop.
    pub async fn shutdown(mut self) {
        info!(group = %self.group_id, "Engine shutting down");
        self.reconciler.cancel_pending();
        self.connection.close();
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.loop_task.await;
    }
}

/// State owned by the consumer loop.
struct LoopCtx {
    group_id: TaskGroupId,
    registry: TaskRegistry,
    dispatcher: EventDispatcher,
    frames: mpsc::UnboundedReceiver<String>,
    cmd_rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<EngineEvent>,
    closer: ChannelCloser,
    reconciler: Arc<HistoryReconciler>,
    close_grace: Duration,
}

/// Single consumer loop: the only place the registry is mutated.
async fn run_loop(mut ctx: LoopCtx) {
    let mut frames_open = true;
    let mut completion: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            frame = ctx.frames.recv(), if frames_open => match frame {
                Some(raw) => {
                    match ctx.dispatcher.dispatch(&mut ctx.registry, &raw) {
                        Dispatch::Applied(records) => {
                            for record in records {
                                let _ = ctx.events.send(EngineEvent::TaskUpdated { record });
                            }
                        }
                        Dispatch::Dropped => {}
                        Dispatch::GroupCompleted(status) => {
                            let _ = ctx.events.send(EngineEvent::GroupCompleted { status });
                            if completion.is_none() {
                                completion = Some(spawn_completion(
                                    ctx.closer.clone(),
                                    ctx.reconciler.clone(),
                                    ctx.events.clone(),
                                    ctx.close_grace,
                                ));
                            }
                        }
                    }
                }
                None => {
                    frames_open = false;
                    debug!(group = %ctx.group_id, "Frame stream ended");
                    let _ = ctx.events.send(EngineEvent::ChannelClosed);
                }
            },
            cmd = ctx.cmd_rx.recv() => match cmd {
                Some(Command::Snapshot(reply)) => {
                    let _ = reply.send(ctx.registry.snapshot());
                }
                Some(Command::ClearCompleted(reply)) => {
                    let cleared = ctx.registry.clear_completed();
                    if cleared > 0 {
                        debug!(group = %ctx.group_id, cleared, "Cleared completed records");
                    }
                    let _ = reply.send(cleared);
                }
                Some(Command::Shutdown) | None => break,
            },
        }
    }

    // Shutdown path: a still-pending completion timer must not fire late.
    if let Some(task) = completion {
        task.abort();
    }
    debug!(group = %ctx.group_id, "Consumer loop stopped");
}

/// Post-completion follow-up: let trailing frames land, close the channel,
/// then refresh today's history once.
fn spawn_completion(
    closer: ChannelCloser,
    reconciler: Arc<HistoryReconciler>,
    events: broadcast::Sender<EngineEvent>,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        closer.close();

        let today = Utc::now().date_naive();
        reconciler.invalidate(today).await;
        match reconciler.records_for(today).await {
            Ok(records) => {
                debug!(%today, count = records.len(), "Post-completion history refreshed");
                let _ = events.send(EngineEvent::HistoryRefreshed { date: today });
            }
            Err(e) => warn!(error = %e, "Post-completion history refresh failed"),
        }
    })
}
