use crate::message::{Message, Recipient, ShardMessage};
use crate::types::{EntityId, ShardId};
use crate::worker::WorkerId;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What a behavior wants its worker loop to do after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep processing the mailbox.
    Continue,
    /// Stop this worker; the shard observes the termination.
    Stop,
}

/// Context handed to an entity behavior for the lifetime of its worker.
#[derive(Clone)]
pub struct EntityContext {
    pub entity_id: EntityId,
    pub shard_id: ShardId,
    shard: mpsc::UnboundedSender<ShardMessage>,
    worker: WorkerId,
}

impl EntityContext {
    pub(crate) fn new(
        entity_id: EntityId,
        shard_id: ShardId,
        shard: mpsc::UnboundedSender<ShardMessage>,
        worker: WorkerId,
    ) -> Self {
        Self {
            entity_id,
            shard_id,
            shard,
            worker,
        }
    }

    /// Ask the shard to passivate this entity.
    ///
    /// The shard answers by opening a buffering window and delivering
    /// `stop_message` back to the worker; the behavior should return
    /// [`Flow::Stop`] when it sees it.
    pub fn passivate(&self, stop_message: Message) {
        let _ = self.shard.send(ShardMessage::Passivate {
            worker: self.worker,
            stop_message,
        });
    }
}

/// Factory for entity behaviors; the worker template injected into a shard.
pub trait Entity: Send + Sync + 'static {
    fn create(&self, id: &EntityId) -> Box<dyn EntityBehavior>;
}

/// Handles the messages routed to one entity instance.
#[async_trait]
pub trait EntityBehavior: Send + 'static {
    async fn handle(
        &mut self,
        ctx: &EntityContext,
        message: Message,
        sender: Option<Recipient>,
    ) -> Flow;
}
