use crate::entity::{EntityBehavior, EntityContext, Flow};
use crate::message::{Envelope, ShardMessage};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identity of a watched worker task within one shard.
///
/// Unique for the shard's lifetime; a respawned entity gets a fresh id, so
/// a stale termination notice can never be confused with the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a spawned worker: its mailbox plus lifecycle tokens.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Percent-encoded entity id, used as the worker's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an envelope. Silently dropped if the worker already exited;
    /// its termination notice is then in flight and the shard will decide
    /// what to do with subsequent traffic.
    pub fn deliver(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            debug!(worker = %self.name, "worker mailbox closed, dropping envelope");
        }
    }

    /// Force-stop the worker without waiting for its mailbox to drain.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Completes when the worker task has fully exited.
    pub async fn terminated(&self) {
        self.done.cancelled().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// Run `task` in its own tokio task, watched by the shard: panics are
/// contained, `done` completes on exit, and a `Terminated` notice is
/// posted to the shard mailbox.
pub(crate) fn watch_task(
    id: WorkerId,
    name: String,
    done: CancellationToken,
    notify: mpsc::UnboundedSender<ShardMessage>,
    task: impl Future<Output = ()> + Send + 'static,
) {
    tokio::spawn(async move {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            warn!(worker = %name, "worker task panicked");
        }
        done.cancel();
        let _ = notify.send(ShardMessage::Terminated(id));
    });
}

/// Spawn the mailbox loop for an entity behavior and return its handle.
///
/// The loop dispatches envelopes to the behavior until it returns
/// [`Flow::Stop`], the mailbox closes, or the worker is force-cancelled.
pub(crate) fn spawn_entity_worker(
    id: WorkerId,
    ctx: EntityContext,
    mut behavior: Box<dyn EntityBehavior>,
    notify: mpsc::UnboundedSender<ShardMessage>,
) -> WorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let cancel = CancellationToken::new();
    let done = CancellationToken::new();
    let name = ctx.entity_id.encoded();
    let handle = WorkerHandle {
        id,
        name: name.clone(),
        tx,
        cancel: cancel.clone(),
        done: done.clone(),
    };

    let run = async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    match behavior.handle(&ctx, envelope.message, envelope.sender).await {
                        Flow::Continue => {}
                        Flow::Stop => break,
                    }
                }
            }
        }
    };
    watch_task(id, name, done, notify, run);

    handle
}
