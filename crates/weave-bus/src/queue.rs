use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::message::{AgentMessage, Recipient};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("mailbox for `{recipient}` is full (capacity {capacity})")]
    QueueFull { recipient: String, capacity: usize },

    #[error("no message for `{recipient}` within {waited_ms}ms")]
    Timeout { recipient: String, waited_ms: u64 },

    #[error("mailbox for `{recipient}` is closed")]
    Closed { recipient: String },
}

pub type Result<T> = std::result::Result<T, BusError>;

// ---------------------------------------------------------------------------
// MessageQueue
// ---------------------------------------------------------------------------

struct Mailbox {
    tx: flume::Sender<AgentMessage>,
    rx: flume::Receiver<AgentMessage>,
}

struct Inner {
    mailboxes: DashMap<String, Mailbox>,
    capacity: Option<usize>,
}

/// Typed, ordered channel between agents and external callers.
///
/// Each recipient gets its own FIFO mailbox, created on demand, backed by a
/// flume channel. Delivery order per recipient equals publish order; the
/// queue supports concurrent publishers and one consumer per recipient
/// without losing or duplicating messages. Cheap to clone.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

impl MessageQueue {
    /// Queue with unbounded mailboxes.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Queue with bounded mailboxes; publishing to a full mailbox fails
    /// with [`BusError::QueueFull`].
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailboxes: DashMap::new(),
                capacity,
            }),
        }
    }

    fn make_channel(
        capacity: Option<usize>,
    ) -> (flume::Sender<AgentMessage>, flume::Receiver<AgentMessage>) {
        match capacity {
            Some(n) => flume::bounded(n),
            None => flume::unbounded(),
        }
    }

    fn sender_for(&self, recipient: &str) -> flume::Sender<AgentMessage> {
        let capacity = self.inner.capacity;
        self.inner
            .mailboxes
            .entry(recipient.to_string())
            .or_insert_with(|| {
                let (tx, rx) = Self::make_channel(capacity);
                Mailbox { tx, rx }
            })
            .tx
            .clone()
    }

    fn receiver_for(&self, recipient: &str) -> flume::Receiver<AgentMessage> {
        let capacity = self.inner.capacity;
        self.inner
            .mailboxes
            .entry(recipient.to_string())
            .or_insert_with(|| {
                let (tx, rx) = Self::make_channel(capacity);
                Mailbox { tx, rx }
            })
            .rx
            .clone()
    }

    /// Pre-create a mailbox so broadcasts reach this recipient even before
    /// its first `consume`.
    pub fn register(&self, recipient: &str) {
        let _ = self.sender_for(recipient);
    }

    /// Append a message to its recipient's mailbox (created on demand).
    ///
    /// Broadcast delivers a copy to every existing mailbox except the
    /// sender's own; a full mailbox is skipped with a warning rather than
    /// failing the whole broadcast.
    pub fn publish(&self, message: AgentMessage) -> Result<()> {
        match message.recipient.clone() {
            Recipient::Agent(name) => {
                let tx = self.sender_for(&name);
                tx.try_send(message).map_err(|e| match e {
                    flume::TrySendError::Full(_) => BusError::QueueFull {
                        recipient: name.clone(),
                        capacity: self.inner.capacity.unwrap_or(0),
                    },
                    flume::TrySendError::Disconnected(_) => {
                        BusError::Closed { recipient: name.clone() }
                    }
                })?;
                debug!(recipient = %name, "message published");
                Ok(())
            }
            Recipient::Broadcast => {
                for entry in self.inner.mailboxes.iter() {
                    if entry.key() == &message.sender {
                        continue;
                    }
                    if let Err(flume::TrySendError::Full(_)) =
                        entry.value().tx.try_send(message.clone())
                    {
                        warn!(recipient = %entry.key(), "broadcast skipped full mailbox");
                    }
                }
                Ok(())
            }
        }
    }

    /// Return the oldest pending message for `recipient`, suspending until
    /// one arrives or `timeout` elapses.
    pub async fn consume(&self, recipient: &str, timeout: Duration) -> Result<AgentMessage> {
        let rx = self.receiver_for(recipient);

        // Fast path: something already queued.
        if let Ok(msg) = rx.try_recv() {
            return Ok(msg);
        }

        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(BusError::Closed {
                recipient: recipient.to_string(),
            }),
            Err(_) => Err(BusError::Timeout {
                recipient: recipient.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Non-blocking variant of [`consume`](Self::consume).
    pub fn try_consume(&self, recipient: &str) -> Option<AgentMessage> {
        self.receiver_for(recipient).try_recv().ok()
    }

    /// Number of undelivered messages for `recipient`.
    pub fn pending(&self, recipient: &str) -> usize {
        self.inner
            .mailboxes
            .get(recipient)
            .map(|mb| mb.rx.len())
            .unwrap_or(0)
    }

    /// Empty a mailbox, returning the drained messages in order.
    pub fn drain(&self, recipient: &str) -> Vec<AgentMessage> {
        let mut drained = Vec::new();
        if let Some(mb) = self.inner.mailboxes.get(recipient) {
            while let Ok(msg) = mb.rx.try_recv() {
                drained.push(msg);
            }
        }
        drained
    }

    /// Drop a recipient's mailbox and anything still queued in it.
    pub fn close(&self, recipient: &str) -> bool {
        self.inner.mailboxes.remove(recipient).is_some()
    }

    /// Number of existing mailboxes.
    pub fn mailbox_count(&self) -> usize {
        self.inner.mailboxes.len()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
