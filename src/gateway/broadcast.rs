//! Notification broadcaster and WebSocket session registry
//!
//! Backend notifications enter a bounded queue from the feed and are drained
//! by one long-lived task that fans each event out to every registered
//! session. Producer and consumers never wait on each other: the feed only
//! waits for queue capacity (bounded), sessions have their own outbound
//! channel.
//!
//! ```text
//! feed ──enqueue──▶ [ bounded mpsc ] ──drain task──▶ SessionRegistry ──▶ ws-1, ws-2, …
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// How long `enqueue` waits for queue capacity before dropping the event
pub const ENQUEUE_WAIT: Duration = Duration::from_millis(100);

/// Event name used for relayed notifications and client echoes
pub const MESSAGE_EVENT: &str = "message";

/// Unsent frames a session may accumulate before a warning is logged.
///
/// Connected sessions are never dropped for being slow, so this only reports.
pub const OUTBOUND_HIGH_WATER: usize = 1024;

/// Session identifier
pub type SessionId = String;

/// Encode a socket frame `{"event": ..., "data": ...}`
#[must_use]
pub fn frame(event: &str, data: &Value) -> Utf8Bytes {
    Utf8Bytes::from(json!({ "event": event, "data": data }).to_string())
}

/// A live, authorized WebSocket connection
#[derive(Debug)]
struct Session {
    /// Rune presented at connect time; broadcasts are not re-authorized
    #[allow(dead_code)]
    rune: String,
    /// Outbound frames
    tx: mpsc::UnboundedSender<Utf8Bytes>,
    /// Frames sent but not yet taken by the connection
    backlog: Arc<AtomicUsize>,
}

/// Receiving end of a session's outbound frames
#[derive(Debug)]
pub struct SessionFrames {
    frames: mpsc::UnboundedReceiver<Utf8Bytes>,
    backlog: Arc<AtomicUsize>,
}

impl SessionFrames {
    /// Next outbound frame; `None` once the session was removed
    pub async fn recv(&mut self) -> Option<Utf8Bytes> {
        let frame = self.frames.recv().await;
        if frame.is_some() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        frame
    }

    /// Frames queued for this session and not yet received
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

/// Currently connected sessions, keyed by session id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authorized connection and return its id and frame stream
    pub fn register(&self, rune: &str) -> (SessionId, SessionFrames) {
        let id = format!("ws-{}", Uuid::new_v4());
        let (tx, frames) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        self.sessions.insert(
            id.clone(),
            Session {
                rune: rune.to_string(),
                tx,
                backlog: Arc::clone(&backlog),
            },
        );
        debug!(session_id = %id, "Registered websocket session");
        (id, SessionFrames { frames, backlog })
    }

    /// Remove a session; later broadcasts skip it
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!(session_id = %id, "Removed websocket session");
        }
        removed
    }

    /// Check if a session exists
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Send `frame` to every session, dropping sessions whose receiver is gone.
    ///
    /// Returns the number of sessions that accepted the frame.
    pub fn broadcast(&self, frame: &Utf8Bytes) -> usize {
        let mut delivered = 0;
        self.sessions.retain(|id, session| {
            let queued = session.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if session.tx.send(frame.clone()).is_ok() {
                if queued == OUTBOUND_HIGH_WATER {
                    warn!(
                        session_id = %id,
                        queued,
                        "Websocket session is not reading its frames"
                    );
                }
                delivered += 1;
                true
            } else {
                debug!(session_id = %id, "Dropping closed websocket session");
                false
            }
        });
        delivered
    }

    /// Drop every session, ending their connections
    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Drop sessions whose receiver is gone; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.tx.is_closed());
        before - self.sessions.len()
    }
}

/// Item in the notification queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// Backend notification, relayed verbatim
    Event(Value),
    /// Stop draining for the rest of the process lifetime
    Close,
}

/// Drain task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    /// Waiting for the next item
    Idle,
    /// Emitting queued items
    Draining,
    /// Terminal: the close sentinel was received
    Stopped,
}

/// Producer handle onto the notification queue
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<QueueItem>,
}

impl NotificationSender {
    /// Queue a backend notification.
    ///
    /// Waits at most [`ENQUEUE_WAIT`] for capacity, then drops the event.
    pub async fn enqueue(&self, event: Value) -> Result<()> {
        self.push(QueueItem::Event(event)).await
    }

    /// Queue the close sentinel
    pub async fn close(&self) -> Result<()> {
        self.push(QueueItem::Close).await
    }

    async fn push(&self, item: QueueItem) -> Result<()> {
        self.tx
            .send_timeout(item, ENQUEUE_WAIT)
            .await
            .map_err(|e| {
                let reason = match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => "notification queue full",
                    mpsc::error::SendTimeoutError::Closed(_) => "broadcaster stopped",
                };
                warn!(reason, "Dropping notification");
                Error::Transport(reason.to_string())
            })
    }
}

/// Owns the drain task and the queue's producer side
pub struct NotificationBroadcaster {
    sessions: Arc<SessionRegistry>,
    sender: NotificationSender,
    state: watch::Receiver<BroadcasterState>,
    task: JoinHandle<()>,
}

impl NotificationBroadcaster {
    /// Start draining a queue of `capacity` items into `sessions`.
    ///
    /// When the queue is empty the task waits at most `drain_interval` before
    /// looking again, pruning closed sessions on each idle tick.
    pub fn spawn(sessions: Arc<SessionRegistry>, capacity: usize, drain_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state_tx, state) = watch::channel(BroadcasterState::Idle);
        let task = tokio::spawn(drain(rx, Arc::clone(&sessions), drain_interval, state_tx));

        Self {
            sessions,
            sender: NotificationSender { tx },
            state,
            task,
        }
    }

    /// Producer handle for the notification feed
    #[must_use]
    pub fn sender(&self) -> NotificationSender {
        self.sender.clone()
    }

    /// Session registry this broadcaster emits to
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Current drain state
    #[must_use]
    pub fn state(&self) -> BroadcasterState {
        *self.state.borrow()
    }

    /// Resolve once the close sentinel has been processed
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| *s == BroadcasterState::Stopped)
            .await;
    }
}

impl Drop for NotificationBroadcaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drain(
    mut rx: mpsc::Receiver<QueueItem>,
    sessions: Arc<SessionRegistry>,
    drain_interval: Duration,
    state: watch::Sender<BroadcasterState>,
) {
    loop {
        let first = match tokio::time::timeout(drain_interval, rx.recv()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                let pruned = sessions.prune();
                trace!(sessions = sessions.len(), pruned, "Notification queue idle");
                continue;
            }
        };

        state.send_replace(BroadcasterState::Draining);
        let mut next = Some(first);
        while let Some(item) = next {
            match item {
                QueueItem::Close => {
                    info!("Notification broadcaster stopped");
                    state.send_replace(BroadcasterState::Stopped);
                    return;
                }
                QueueItem::Event(event) => {
                    let delivered = sessions.broadcast(&frame(MESSAGE_EVENT, &event));
                    debug!(delivered, "Emitting message");
                }
            }
            next = rx.try_recv().ok();
        }
        state.send_replace(BroadcasterState::Idle);
    }

    state.send_replace(BroadcasterState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_frame(rx: &mut SessionFrames) -> Value {
        next_frame_within(rx, WAIT).await
    }

    async fn next_frame_within(rx: &mut SessionFrames, wait: Duration) -> Value {
        let frame = tokio::time::timeout(wait, rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        serde_json::from_str(frame.as_str()).unwrap()
    }

    fn nothing_queued(rx: &mut SessionFrames) -> bool {
        rx.frames.try_recv().is_err()
    }

    #[test]
    fn test_session_registration() {
        let registry = SessionRegistry::new();
        let (id, _rx) = registry.register("rune-a");
        assert!(id.starts_with("ws-"));
        assert!(registry.contains(&id));
        assert_eq!(registry.sessions.get(&id).unwrap().rune, "rune-a");
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_skips_and_drops_closed_sessions() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = registry.register("r");
        let (b, rx_b) = registry.register("r");
        drop(rx_b);

        let delivered = registry.broadcast(&frame(MESSAGE_EVENT, &json!({"n": 1})));
        assert_eq!(delivered, 1);
        assert!(!registry.contains(&b));
        assert!(rx_a.frames.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_session_keeps_every_frame() {
        let registry = SessionRegistry::new();
        let (id, mut rx) = registry.register("r");

        for n in 0..=OUTBOUND_HIGH_WATER {
            assert_eq!(registry.broadcast(&frame(MESSAGE_EVENT, &json!(n))), 1);
        }
        assert!(registry.contains(&id));
        assert_eq!(rx.backlog(), OUTBOUND_HIGH_WATER + 1);

        assert_eq!(next_frame(&mut rx).await["data"], 0);
        assert_eq!(rx.backlog(), OUTBOUND_HIGH_WATER);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_session_once() {
        let drain_interval = Duration::from_millis(50);
        let sessions = Arc::new(SessionRegistry::new());
        let mut receivers: Vec<_> = (0..5).map(|_| sessions.register("r").1).collect();
        let broadcaster =
            NotificationBroadcaster::spawn(Arc::clone(&sessions), 16, drain_interval);

        broadcaster
            .sender()
            .enqueue(json!({"invoice_payment": {"label": "a"}}))
            .await
            .unwrap();

        // Each session holds the frame within one drain interval of the enqueue
        for rx in &mut receivers {
            let got = next_frame_within(rx, drain_interval * 2).await;
            assert_eq!(got["event"], MESSAGE_EVENT);
            assert_eq!(got["data"]["invoice_payment"]["label"], "a");
            assert!(nothing_queued(rx), "exactly one copy");
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let sessions = Arc::new(SessionRegistry::new());
        let (_id, mut rx) = sessions.register("r");
        let broadcaster =
            NotificationBroadcaster::spawn(Arc::clone(&sessions), 16, Duration::from_millis(50));
        let sender = broadcaster.sender();

        for n in 0..10 {
            sender.enqueue(json!(n)).await.unwrap();
        }
        for n in 0..10 {
            assert_eq!(next_frame(&mut rx).await["data"], json!(n));
        }
    }

    #[tokio::test]
    async fn test_late_session_misses_drained_event() {
        let sessions = Arc::new(SessionRegistry::new());
        let (_early, mut early_rx) = sessions.register("r");
        let broadcaster =
            NotificationBroadcaster::spawn(Arc::clone(&sessions), 16, Duration::from_millis(50));

        broadcaster.sender().enqueue(json!("first")).await.unwrap();
        assert_eq!(next_frame(&mut early_rx).await["data"], "first");

        let (_late, mut late_rx) = sessions.register("r");
        broadcaster.sender().enqueue(json!("second")).await.unwrap();
        assert_eq!(next_frame(&mut late_rx).await["data"], "second");
    }

    #[tokio::test]
    async fn test_close_sentinel_stops_for_good() {
        let sessions = Arc::new(SessionRegistry::new());
        let (_id, mut rx) = sessions.register("r");
        let broadcaster =
            NotificationBroadcaster::spawn(Arc::clone(&sessions), 16, Duration::from_millis(50));
        let sender = broadcaster.sender();

        sender.enqueue(json!("before")).await.unwrap();
        sender.close().await.unwrap();
        tokio::time::timeout(WAIT, broadcaster.stopped()).await.unwrap();
        assert_eq!(broadcaster.state(), BroadcasterState::Stopped);

        assert_eq!(next_frame(&mut rx).await["data"], "before");
        assert!(matches!(sender.enqueue(json!("after")).await, Err(Error::Transport(_))));
        assert!(nothing_queued(&mut rx));
    }

    #[tokio::test]
    async fn test_full_queue_drops_after_bounded_wait() {
        // No consumer: the queue fills and stays full
        let (tx, _rx) = mpsc::channel(1);
        let sender = NotificationSender { tx };
        sender.enqueue(json!(1)).await.unwrap();

        let started = std::time::Instant::now();
        let err = sender.enqueue(json!(2)).await.unwrap_err();
        assert!(err.to_string().contains("queue full"));
        assert!(started.elapsed() >= ENQUEUE_WAIT);
    }

    #[tokio::test]
    async fn test_idle_tick_prunes_closed_sessions() {
        let sessions = Arc::new(SessionRegistry::new());
        let (id, rx) = sessions.register("r");
        let _broadcaster =
            NotificationBroadcaster::spawn(Arc::clone(&sessions), 16, Duration::from_millis(20));
        drop(rx);

        tokio::time::timeout(WAIT, async {
            while sessions.contains(&id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
