use crate::types::{EntityId, ShardId};
use crate::worker::WorkerId;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// An opaque, immutable, cheaply clonable message.
pub type Message = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a dynamic [`Message`].
pub fn dyn_message<T: Any + Send + Sync>(value: T) -> Message {
    Arc::new(value)
}

/// A message paired with the handle of its sender.
#[derive(Clone)]
pub struct Envelope {
    pub message: Message,
    pub sender: Option<Recipient>,
}

/// Classifies an application message into its entity id and inner payload.
///
/// Partial by convention: the upstream router only forwards messages the
/// application recognizes. A message the extractor cannot place yields an
/// empty id and is dropped to dead letters by the shard.
pub trait MessageExtractor: Send + Sync + 'static {
    fn extract(&self, message: &Message) -> (EntityId, Message);
}

/// A clonable handle that accepts dynamic messages.
///
/// Replies and forwarded traffic travel through recipients; a send to a
/// dropped receiving side is logged and discarded.
#[derive(Debug, Clone)]
pub struct Recipient {
    tx: mpsc::UnboundedSender<Message>,
}

impl Recipient {
    /// Create a recipient together with its receiving side.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("recipient dropped, discarding message");
        }
    }
}

/// Sink for undeliverable messages.
///
/// The shard logs each drop at the level the failure calls for; the sink
/// itself only forwards to an optional tap so tests can observe drops.
#[derive(Clone, Default)]
pub struct DeadLetters {
    tap: Option<mpsc::UnboundedSender<Message>>,
}

impl DeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose drops can be observed, for tests.
    pub fn with_tap() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tap: Some(tx) }, rx)
    }

    pub(crate) fn publish(&self, message: Message) {
        if let Some(tap) = &self.tap {
            let _ = tap.send(message);
        }
    }
}

/// Everything a shard consumes from its mailbox.
pub enum ShardMessage {
    /// Application traffic, classified by the injected [`MessageExtractor`].
    Envelope(Envelope),
    /// A watched worker (entity or hand-off stopper) has terminated.
    Terminated(WorkerId),
    /// Coordinator request to migrate ownership of `shard_id` away.
    HandOff {
        shard_id: ShardId,
        reply_to: Recipient,
    },
    /// Request from a worker to shut itself down cooperatively.
    Passivate {
        worker: WorkerId,
        stop_message: Message,
    },
    /// Ensure a remembered entity has a live worker.
    RestartEntity(EntityId),
    /// Ensure a batch of remembered entities have live workers.
    RestartEntities(HashSet<EntityId>),
    /// Query: ids of entities with live workers.
    GetCurrentShardState {
        reply_to: oneshot::Sender<CurrentShardState>,
    },
    /// Query: count of remembered entities.
    GetShardStats {
        reply_to: oneshot::Sender<ShardStats>,
    },
}

/// Announcement to the parent region that the shard is ready for traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInitialized {
    pub shard_id: ShardId,
}

/// Reply to the hand-off initiator once no entities remain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStopped {
    pub shard_id: ShardId,
}

/// Reply to [`ShardMessage::GetCurrentShardState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentShardState {
    pub shard_id: ShardId,
    pub entity_ids: HashSet<EntityId>,
}

/// Reply to [`ShardMessage::GetShardStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub entity_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dyn_message_downcasts() {
        let message = dyn_message(42i32);
        assert_eq!(message.downcast_ref::<i32>(), Some(&42));
        assert!(message.downcast_ref::<String>().is_none());
    }

    #[tokio::test]
    async fn recipient_delivers_in_order() {
        let (recipient, mut rx) = Recipient::channel();
        recipient.send(dyn_message(1i32));
        recipient.send(dyn_message(2i32));

        assert_eq!(rx.recv().await.unwrap().downcast_ref::<i32>(), Some(&1));
        assert_eq!(rx.recv().await.unwrap().downcast_ref::<i32>(), Some(&2));
    }

    #[tokio::test]
    async fn recipient_send_after_receiver_dropped_is_silent() {
        let (recipient, rx) = Recipient::channel();
        drop(rx);
        recipient.send(dyn_message(1i32));
    }

    #[tokio::test]
    async fn dead_letter_tap_observes_drops() {
        let (dead_letters, mut tap) = DeadLetters::with_tap();
        dead_letters.publish(dyn_message("lost"));
        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.downcast_ref::<&str>(), Some(&"lost"));
    }
}
