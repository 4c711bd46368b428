use crate::message::{dyn_message, Envelope, Message, Recipient, ShardStopped};
use crate::types::ShardId;
use crate::worker::WorkerHandle;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::time::Duration;
use tracing::{debug, warn};

/// Template for the per-shard hand-off stopper task.
///
/// The stopper owns the drain: it must stop every entity it was given and
/// acknowledge with [`ShardStopped`] to `reply_to` once none remain. The
/// shard watches the stopper and stops itself when the stopper exits.
pub trait HandOffStopperProps: Send + Sync + 'static {
    fn stopper(
        &self,
        shard_id: ShardId,
        reply_to: Recipient,
        entities: Vec<WorkerHandle>,
        stop_message: Message,
    ) -> BoxFuture<'static, ()>;
}

/// Default stopper: deliver the stop message to every entity, wait for all
/// of them to terminate, force-cancel stragglers at the deadline, then
/// acknowledge the hand-off.
pub struct HandOffStopper {
    timeout: Duration,
}

impl HandOffStopper {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl HandOffStopperProps for HandOffStopper {
    fn stopper(
        &self,
        shard_id: ShardId,
        reply_to: Recipient,
        entities: Vec<WorkerHandle>,
        stop_message: Message,
    ) -> BoxFuture<'static, ()> {
        let timeout = self.timeout;
        async move {
            for entity in &entities {
                entity.deliver(Envelope {
                    message: stop_message.clone(),
                    sender: None,
                });
            }

            let drain = join_all(entities.iter().map(WorkerHandle::terminated));
            if tokio::time::timeout(timeout, drain).await.is_err() {
                warn!(
                    shard_id = %shard_id,
                    "hand-off deadline passed, force-stopping remaining entities"
                );
                for entity in entities.iter().filter(|e| !e.is_terminated()) {
                    entity.abort();
                }
                join_all(entities.iter().map(WorkerHandle::terminated)).await;
            }

            debug!(shard_id = %shard_id, "all entities stopped, acknowledging hand-off");
            reply_to.send(dyn_message(ShardStopped { shard_id }));
        }
        .boxed()
    }
}
