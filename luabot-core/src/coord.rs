// ABOUTME: Main and worker lanes, the global engine lock and notify/request/respond
// ABOUTME: Turns an asynchronous lane send into a blocking call with a one-shot reply

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

/// Buffer size of each lane. Senders wait once a lane holds this many messages.
pub const LANE_CAPACITY: usize = 8;

/// The two shared channels engines talk through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Drained by the serve loop of the live backend
    Main,
    /// Drained by worker tasks
    Worker,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Main => "main",
            Lane::Worker => "worker",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("{0} lane is closed")]
    LaneClosed(Lane),
    #[error("request on {0} lane was dropped without a reply")]
    ReplyDropped(Lane),
}

/// One-shot reply slot attached to a request. Cloning shares the slot, so the
/// value is delivered at most once no matter how many holders try.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    slot: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
}

impl ReplyHandle {
    fn new() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (handle, rx)
    }

    /// Deliver the reply. Returns false when the slot was already used or
    /// the requester stopped waiting.
    pub fn send(&self, value: Value) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// A value travelling on a lane, optionally carrying a reply slot.
#[derive(Debug, Clone)]
pub struct CoordMessage {
    pub payload: Value,
    reply: Option<ReplyHandle>,
}

impl CoordMessage {
    /// A fire-and-forget message
    pub fn notification(payload: Value) -> Self {
        Self {
            payload,
            reply: None,
        }
    }

    fn request(payload: Value) -> (Self, oneshot::Receiver<Value>) {
        let (reply, rx) = ReplyHandle::new();
        (
            Self {
                payload,
                reply: Some(reply),
            },
            rx,
        )
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reply_handle(&self) -> Option<ReplyHandle> {
        self.reply.clone()
    }

    /// Complete a pending request. A no-op returning false for notifications
    /// and for every call after the first.
    pub fn respond(&self, value: Value) -> bool {
        match &self.reply {
            Some(reply) => reply.send(value),
            None => false,
        }
    }
}

struct LaneChannel {
    tx: mpsc::Sender<CoordMessage>,
    rx: AsyncMutex<mpsc::Receiver<CoordMessage>>,
}

impl LaneChannel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }
}

/// Owner of the lanes and the engine lock for one run.
///
/// Every engine built for a run holds an `Arc<Coordinator>`; nothing here is
/// process-global, so independent runs (and tests) never share lanes.
pub struct Coordinator {
    main: LaneChannel,
    worker: LaneChannel,
    engine_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_capacity(LANE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            main: LaneChannel::new(capacity),
            worker: LaneChannel::new(capacity),
            engine_lock: Mutex::new(()),
        }
    }

    fn lane(&self, lane: Lane) -> &LaneChannel {
        match lane {
            Lane::Main => &self.main,
            Lane::Worker => &self.worker,
        }
    }

    /// Queue a message; waits only while the lane is full
    pub async fn send(&self, lane: Lane, message: CoordMessage) -> Result<(), CoordError> {
        self.lane(lane)
            .tx
            .send(message)
            .await
            .map_err(|_| CoordError::LaneClosed(lane))
    }

    pub async fn notify(&self, lane: Lane, payload: Value) -> Result<(), CoordError> {
        self.send(lane, CoordMessage::notification(payload)).await
    }

    /// Send with a fresh reply slot and wait for whoever receives it to respond.
    ///
    /// Never returns if the receiver keeps the message without responding.
    pub async fn request(&self, lane: Lane, payload: Value) -> Result<Value, CoordError> {
        let (message, reply_rx) = CoordMessage::request(payload);
        self.send(lane, message).await?;
        reply_rx.await.map_err(|_| CoordError::ReplyDropped(lane))
    }

    /// Take the next message from a lane. Concurrent receivers each get a
    /// distinct message.
    pub async fn recv(&self, lane: Lane) -> Option<CoordMessage> {
        self.lane(lane).rx.lock().await.recv().await
    }

    pub fn blocking_notify(&self, lane: Lane, payload: Value) -> Result<(), CoordError> {
        futures::executor::block_on(self.notify(lane, payload))
    }

    pub fn blocking_request(&self, lane: Lane, payload: Value) -> Result<Value, CoordError> {
        futures::executor::block_on(self.request(lane, payload))
    }

    pub fn blocking_recv(&self, lane: Lane) -> Option<CoordMessage> {
        futures::executor::block_on(self.recv(lane))
    }

    /// Hold the engine lock for the duration of `f`.
    ///
    /// Required around every call into the long-lived main engine that does
    /// not originate from that engine's own stack.
    pub fn with_engine<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.engine_guard();
        f()
    }

    pub fn engine_guard(&self) -> MutexGuard<'_, ()> {
        self.engine_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
