//! Push-channel client — one WebSocket connection per open task group.
//!
//! A `ChannelConnection` owns at most one live connection. Opening a channel
//! for a new group closes the previous one first; the old handle is never
//! reused. Unexpected closures trigger a bounded exponential-backoff
//! reconnection loop; a caller-initiated close disables reconnection
//! immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::ConnError;
use crate::protocol::TaskGroupId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the notice broadcast channel.
const NOTICE_CAPACITY: usize = 64;

/// Upper bound of the random jitter added to each reconnect delay.
const JITTER_MAX_MS: u64 = 250;

/// Lifecycle notices emitted by an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// The socket is up. `resumed` is true after a reconnect.
    Connected { resumed: bool },
    /// The socket dropped unexpectedly; a reconnect is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// The socket dropped unexpectedly.
    Lost { reason: String },
    /// Reconnection gave up; the handle requires a fresh `open`.
    Errored { reason: String },
    /// Caller-initiated close.
    Closed,
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Reconnecting,
    Closed,
    Errored,
}

/// Clonable closer for a handle, usable from spawned tasks.
#[derive(Clone, Debug)]
pub struct ChannelCloser {
    closed: Arc<AtomicBool>,
    notices: broadcast::Sender<ChannelNotice>,
    state: Arc<watch::Sender<ChannelState>>,
    abort: tokio::task::AbortHandle,
}

impl ChannelCloser {
    /// Close the channel and disable reconnection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort.abort();
        self.state.send_replace(ChannelState::Closed);
        let _ = self.notices.send(ChannelNotice::Closed);
        info!("Push channel closed");
    }
}

/// Handle to one open push-channel connection.
#[derive(Debug)]
pub struct ChannelHandle {
    group_id: TaskGroupId,
    frames: Option<mpsc::UnboundedReceiver<String>>,
    notices: broadcast::Sender<ChannelNotice>,
    state: watch::Receiver<ChannelState>,
    closer: ChannelCloser,
}

impl ChannelHandle {
    pub fn group_id(&self) -> &TaskGroupId {
        &self.group_id
    }

    /// Subscribe to lifecycle notices. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Take the frame stream. Yields each text frame in delivery order,
    /// across reconnects, until the channel closes for good.
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.frames.take()
    }

    /// A clonable closer for scheduled closes from other tasks.
    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }

    /// Close the channel and disable reconnection.
    pub fn close(&self) {
        self.closer.close();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// Owns at most one push-channel connection at a time.
pub struct ChannelConnection {
    config: ChannelConfig,
    current: Option<ChannelHandle>,
}

impl ChannelConnection {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&ChannelHandle> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut ChannelHandle> {
        self.current.as_mut()
    }

    /// Open a channel for `group_id`, superseding any prior connection.
    ///
    /// A missing credential fails fast with `ConnError::Unauthenticated`.
    /// Failure of the initial connect is returned synchronously; failures
    /// during later automatic reconnects surface only through the notice
    /// subscription.
    pub async fn open(
        &mut self,
        group_id: TaskGroupId,
        credential: Option<SecretString>,
    ) -> Result<&mut ChannelHandle, ConnError> {
        if let Some(prev) = self.current.take() {
            info!(group = %prev.group_id, "Superseding open channel with new task group");
            prev.close();
        }

        let credential = credential.ok_or(ConnError::Unauthenticated)?;
        let url = channel_url(&self.config.ws_base_url, &group_id, &credential);

        let ws = connect_once(&url, self.config.connect_timeout).await?;
        info!(group = %group_id, "Push channel connected");

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connected);
        let state_tx = Arc::new(state_tx);
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            ws,
            ReaderCtx {
                url,
                config: self.config.clone(),
                frames: frames_tx,
                notices: notices.clone(),
                state: state_tx.clone(),
                closed: closed.clone(),
            },
        ));

        let closer = ChannelCloser {
            closed,
            notices: notices.clone(),
            state: state_tx,
            abort: reader.abort_handle(),
        };
        detach(reader);

        // Ok if no receivers are listening yet.
        let _ = notices.send(ChannelNotice::Connected { resumed: false });

        let handle = ChannelHandle {
            group_id,
            frames: Some(frames_rx),
            notices,
            state: state_rx,
            closer,
        };
        Ok(self.current.insert(handle))
    }

    /// Close the current channel, if any.
    pub fn close(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.close();
        }
    }
}

/// Shared context of the reader task.
struct ReaderCtx {
    url: String,
    config: ChannelConfig,
    frames: mpsc::UnboundedSender<String>,
    notices: broadcast::Sender<ChannelNotice>,
    state: Arc<watch::Sender<ChannelState>>,
    closed: Arc<AtomicBool>,
}

impl ReaderCtx {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Drive one socket after another until closed, errored, or given up.
async fn read_loop(mut ws: WsStream, ctx: ReaderCtx) {
    loop {
        let reason = drain_socket(&mut ws, &ctx).await;
        if ctx.is_closed() {
            return;
        }
        let _ = ctx.notices.send(ChannelNotice::Lost {
            reason: reason.clone(),
        });
        warn!(reason = %reason, "Push channel lost; reconnecting");

        match reconnect(&ctx).await {
            Some(new_ws) => {
                ws = new_ws;
                ctx.state.send_replace(ChannelState::Connected);
                let _ = ctx.notices.send(ChannelNotice::Connected { resumed: true });
            }
            None => {
                if !ctx.is_closed() {
                    ctx.state.send_replace(ChannelState::Errored);
                    let _ = ctx.notices.send(ChannelNotice::Errored {
                        reason: format!(
                            "gave up after {} reconnect attempts",
                            ctx.config.max_reconnect_attempts
                        ),
                    });
                    warn!(
                        attempts = ctx.config.max_reconnect_attempts,
                        "Push channel gave up reconnecting"
                    );
                }
                return;
            }
        }
    }
}

/// Read frames until the socket drops. Returns the loss reason.
async fn drain_socket(ws: &mut WsStream, ctx: &ReaderCtx) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if ctx.frames.send(text.to_string()).is_err() {
                    // Consumer is gone; treat as a caller-initiated close.
                    debug!("Frame consumer dropped; stopping reader");
                    ctx.closed.store(true, Ordering::SeqCst);
                    ctx.state.send_replace(ChannelState::Closed);
                    return "consumer dropped".to_string();
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return match frame {
                    Some(frame) => format!("server closed: {}", &*frame.reason),
                    None => "server closed".to_string(),
                };
            }
            // Pings are answered by the protocol layer during reads.
            Some(Ok(_)) => {}
            Some(Err(e)) => return e.to_string(),
            None => return "stream ended".to_string(),
        }
    }
}

/// Bounded backoff reconnect. Returns a fresh socket, or `None` when closed
/// or out of attempts.
async fn reconnect(ctx: &ReaderCtx) -> Option<WsStream> {
    for attempt in 1..=ctx.config.max_reconnect_attempts {
        if ctx.is_closed() {
            return None;
        }

        let delay = reconnect_delay(ctx.config.reconnect_base, attempt);
        ctx.state.send_replace(ChannelState::Reconnecting);
        let _ = ctx
            .notices
            .send(ChannelNotice::Reconnecting { attempt, delay });
        debug!(attempt, ?delay, "Scheduling push channel reconnect");

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS));
        tokio::time::sleep(delay + jitter).await;

        if ctx.is_closed() {
            return None;
        }
        match connect_once(&ctx.url, ctx.config.connect_timeout).await {
            Ok(ws) => {
                info!(attempt, "Push channel reconnected");
                return Some(ws);
            }
            Err(e) if e.is_retryable() => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
            }
            Err(e) => {
                warn!(error = %e, "Reconnect failed with non-retryable error");
                return None;
            }
        }
    }
    None
}

/// One connect attempt with a timeout.
async fn connect_once(url: &str, timeout: Duration) -> Result<WsStream, ConnError> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(map_ws_error(e)),
        Err(_) => Err(ConnError::Timeout { timeout }),
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> ConnError {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match e {
        WsError::Io(e) => ConnError::Unreachable {
            reason: e.to_string(),
        },
        WsError::Url(e) => ConnError::Protocol {
            reason: e.to_string(),
        },
        WsError::Http(response) => ConnError::Protocol {
            reason: format!("handshake rejected with HTTP {}", response.status()),
        },
        other => ConnError::Protocol {
            reason: other.to_string(),
        },
    }
}

/// Delay before reconnect `attempt` (1-based): `base * 2^(attempt-1)`.
fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Push-channel URL for one task group. The credential is forwarded opaquely
/// as a query parameter.
fn channel_url(base: &str, group_id: &TaskGroupId, credential: &SecretString) -> String {
    format!(
        "{}/channel/{}?token={}",
        base.trim_end_matches('/'),
        group_id,
        credential.expose_secret()
    )
}

/// Let the reader run without holding its JoinHandle; the abort handle in
/// `ChannelCloser` is the cancellation path.
fn detach(handle: JoinHandle<()>) {
    drop(handle);
}
