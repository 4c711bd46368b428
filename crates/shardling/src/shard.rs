use crate::config::ShardSettings;
use crate::entity::{Entity, EntityContext, Flow};
use crate::error::ShardError;
use crate::handoff::{HandOffStopper, HandOffStopperProps};
use crate::message::{
    dyn_message, CurrentShardState, DeadLetters, Envelope, Message, MessageExtractor, Recipient,
    ShardInitialized, ShardMessage, ShardStats, ShardStopped,
};
use crate::message_buffer::MessageBufferMap;
use crate::persistence::{EventJournal, RememberEntities, ShardEvent, ShardState, SnapshotStore};
use crate::types::{EntityId, ShardId};
use crate::worker::{spawn_entity_worker, watch_task, WorkerHandle, WorkerId};
use futures::future::{join_all, BoxFuture};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Configures and starts a shard.
pub struct ShardBuilder {
    type_name: String,
    shard_id: ShardId,
    entity_props: Arc<dyn Entity>,
    extractor: Arc<dyn MessageExtractor>,
    hand_off_stop_message: Message,
    parent: Recipient,
    settings: ShardSettings,
    dead_letters: DeadLetters,
    stopper_props: Option<Arc<dyn HandOffStopperProps>>,
    remember: Option<(Arc<dyn EventJournal>, Arc<dyn SnapshotStore>)>,
}

impl ShardBuilder {
    pub fn new(
        type_name: impl Into<String>,
        shard_id: ShardId,
        entity_props: Arc<dyn Entity>,
        extractor: Arc<dyn MessageExtractor>,
        hand_off_stop_message: Message,
        parent: Recipient,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            shard_id,
            entity_props,
            extractor,
            hand_off_stop_message,
            parent,
            settings: ShardSettings::default(),
            dead_letters: DeadLetters::new(),
            stopper_props: None,
            remember: None,
        }
    }

    pub fn settings(mut self, settings: ShardSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn dead_letters(mut self, dead_letters: DeadLetters) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Override the hand-off stopper template. Defaults to
    /// [`HandOffStopper`] with the configured `hand_off_timeout`.
    pub fn hand_off_stopper(mut self, props: Arc<dyn HandOffStopperProps>) -> Self {
        self.stopper_props = Some(props);
        self
    }

    /// Enable remember-entities mode: entity membership is journaled and
    /// survives shard restarts.
    pub fn remember_entities(
        mut self,
        journal: Arc<dyn EventJournal>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        self.remember = Some((journal, snapshots));
        self
    }

    /// Validate the settings and start the shard's mailbox loop.
    pub fn spawn(self) -> Result<ShardHandle, ShardError> {
        self.settings.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let stopper_props = self
            .stopper_props
            .unwrap_or_else(|| Arc::new(HandOffStopper::new(self.settings.hand_off_timeout)));
        let remember = self.remember.map(|(journal, snapshots)| {
            RememberEntities::new(
                &self.type_name,
                &self.shard_id,
                journal,
                snapshots,
                self.settings.snapshot_after,
            )
        });

        let handle = ShardHandle {
            shard_id: self.shard_id.clone(),
            tx: tx.clone(),
            done: done.clone(),
        };
        let shard = Shard {
            type_name: self.type_name,
            shard_id: self.shard_id,
            settings: self.settings,
            entity_props: self.entity_props,
            extractor: self.extractor,
            hand_off_stop_message: self.hand_off_stop_message,
            parent: self.parent,
            dead_letters: self.dead_letters,
            stopper_props,
            remember,
            state: ShardState::default(),
            ref_by_id: HashMap::new(),
            id_by_ref: HashMap::new(),
            passivating: HashSet::new(),
            message_buffers: MessageBufferMap::new(),
            hand_off_stopper: None,
            next_worker_id: 0,
            self_tx: tx,
        };
        tokio::spawn(shard.run(rx, done));
        Ok(handle)
    }
}

/// Handle to a running shard's mailbox.
#[derive(Clone)]
pub struct ShardHandle {
    shard_id: ShardId,
    tx: mpsc::UnboundedSender<ShardMessage>,
    done: CancellationToken,
}

impl ShardHandle {
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Deliver an application message to the shard.
    pub fn deliver(&self, message: Message, sender: Option<Recipient>) {
        if self
            .tx
            .send(ShardMessage::Envelope(Envelope { message, sender }))
            .is_err()
        {
            debug!(shard_id = %self.shard_id, "shard stopped, dropping message");
        }
    }

    /// Coordinator-side request to migrate this shard's ownership away.
    pub fn hand_off(&self, shard_id: ShardId, reply_to: Recipient) {
        let _ = self.tx.send(ShardMessage::HandOff { shard_id, reply_to });
    }

    /// Ensure a worker is running for `id`, spawning one if needed.
    pub fn restart_entity(&self, id: EntityId) {
        let _ = self.tx.send(ShardMessage::RestartEntity(id));
    }

    /// Ensure workers are running for every id in the batch.
    pub fn restart_entities(&self, ids: HashSet<EntityId>) {
        let _ = self.tx.send(ShardMessage::RestartEntities(ids));
    }

    /// Ids of entities with live workers.
    pub async fn current_state(&self) -> Result<CurrentShardState, ShardError> {
        let (reply_to, rx) = oneshot::channel();
        self.tx
            .send(ShardMessage::GetCurrentShardState { reply_to })
            .map_err(|_| self.terminated_error())?;
        rx.await.map_err(|_| self.terminated_error())
    }

    /// Count of remembered entities.
    pub async fn stats(&self) -> Result<ShardStats, ShardError> {
        let (reply_to, rx) = oneshot::channel();
        self.tx
            .send(ShardMessage::GetShardStats { reply_to })
            .map_err(|_| self.terminated_error())?;
        rx.await.map_err(|_| self.terminated_error())
    }

    /// Completes when the shard has stopped.
    pub async fn terminated(&self) {
        self.done.cancelled().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.done.is_cancelled()
    }

    fn terminated_error(&self) -> ShardError {
        ShardError::ShardTerminated {
            shard_id: self.shard_id.clone(),
        }
    }
}

/// The per-partition supervisor: spawns entity workers on demand, buffers
/// traffic across passivation and restart windows, and cooperates with the
/// coordinator's hand-off protocol.
///
/// All state is owned by the single mailbox loop; messages are processed
/// strictly one at a time and journal commits are awaited in-line, so no
/// later mailbox message can observe a half-applied change.
struct Shard {
    type_name: String,
    shard_id: ShardId,
    settings: ShardSettings,
    entity_props: Arc<dyn Entity>,
    extractor: Arc<dyn MessageExtractor>,
    hand_off_stop_message: Message,
    parent: Recipient,
    dead_letters: DeadLetters,
    stopper_props: Arc<dyn HandOffStopperProps>,
    remember: Option<RememberEntities>,

    state: ShardState,
    ref_by_id: HashMap<EntityId, WorkerHandle>,
    id_by_ref: HashMap<WorkerId, EntityId>,
    passivating: HashSet<WorkerId>,
    message_buffers: MessageBufferMap,
    hand_off_stopper: Option<WorkerId>,
    next_worker_id: u64,
    self_tx: mpsc::UnboundedSender<ShardMessage>,
}

impl Shard {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ShardMessage>,
        done: CancellationToken,
    ) {
        match self.initialize().await {
            Ok(()) => {
                while let Some(message) = rx.recv().await {
                    match self.handle(message).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(err) => {
                            error!(shard_id = %self.shard_id, error = %err, "shard failed, stopping");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                error!(shard_id = %self.shard_id, error = %err, "shard recovery failed");
            }
        }
        self.stop_all_workers().await;
        done.cancel();
    }

    async fn initialize(&mut self) -> Result<(), ShardError> {
        debug!(shard_id = %self.shard_id, type_name = %self.type_name, "starting shard");
        if let Some(remember) = self.remember.as_mut() {
            debug!(
                shard_id = %self.shard_id,
                journal_plugin_id = %self.settings.journal_plugin_id,
                snapshot_plugin_id = %self.settings.snapshot_plugin_id,
                "recovering remembered entities"
            );
            self.state = remember.recover().await?;
        }
        if self.remember.is_some() {
            self.restart_remembered_entities();
        }
        self.parent.send(dyn_message(ShardInitialized {
            shard_id: self.shard_id.clone(),
        }));
        Ok(())
    }

    /// Feed the recovery strategy's deferred batches back into the mailbox
    /// as `RestartEntities` commands.
    fn restart_remembered_entities(&self) {
        let strategy = self.settings.recovery_strategy();
        for batch in strategy.recover_entities(&self.state.entities) {
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                let ids = batch.await;
                if !ids.is_empty() {
                    let _ = tx.send(ShardMessage::RestartEntities(ids));
                }
            });
        }
    }

    async fn handle(&mut self, message: ShardMessage) -> Result<Flow, ShardError> {
        if self.hand_off_stopper.is_some() {
            return Ok(self.handle_while_handing_off(message));
        }
        match message {
            ShardMessage::Terminated(worker) => self.receive_terminated(worker).await,
            ShardMessage::HandOff { shard_id, reply_to } => Ok(self.hand_off(shard_id, reply_to)),
            ShardMessage::Passivate {
                worker,
                stop_message,
            } => {
                self.passivate(worker, stop_message);
                Ok(Flow::Continue)
            }
            ShardMessage::RestartEntity(id) => {
                self.get_entity(&id);
                Ok(Flow::Continue)
            }
            ShardMessage::RestartEntities(ids) => {
                for id in ids {
                    self.get_entity(&id);
                }
                Ok(Flow::Continue)
            }
            ShardMessage::GetCurrentShardState { reply_to } => {
                let _ = reply_to.send(CurrentShardState {
                    shard_id: self.shard_id.clone(),
                    entity_ids: self.ref_by_id.keys().cloned().collect(),
                });
                Ok(Flow::Continue)
            }
            ShardMessage::GetShardStats { reply_to } => {
                let _ = reply_to.send(ShardStats {
                    shard_id: self.shard_id.clone(),
                    entity_count: self.state.entities.len(),
                });
                Ok(Flow::Continue)
            }
            ShardMessage::Envelope(envelope) => {
                self.deliver_message(envelope).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// While handing off, only termination notices are processed; the
    /// stopper owns the drain and everything else is dropped.
    fn handle_while_handing_off(&mut self, message: ShardMessage) -> Flow {
        match message {
            ShardMessage::Terminated(worker) => {
                if self.hand_off_stopper == Some(worker) {
                    debug!(shard_id = %self.shard_id, "hand-off stopper finished, stopping shard");
                    return Flow::Stop;
                }
                Flow::Continue
            }
            ShardMessage::HandOff { shard_id, .. } => {
                warn!(
                    shard_id = %self.shard_id,
                    requested = %shard_id,
                    "hand-off already in progress, ignoring request"
                );
                Flow::Continue
            }
            ShardMessage::Envelope(envelope) => {
                debug!(shard_id = %self.shard_id, "dropping application message during hand-off");
                self.dead_letters.publish(envelope.message);
                Flow::Continue
            }
            _ => {
                debug!(shard_id = %self.shard_id, "ignoring command during hand-off");
                Flow::Continue
            }
        }
    }

    async fn receive_terminated(&mut self, worker: WorkerId) -> Result<Flow, ShardError> {
        if let Some(id) = self.id_by_ref.get(&worker).cloned() {
            self.entity_terminated(worker, id).await?;
        }
        Ok(Flow::Continue)
    }

    /// Route an inbound application message to its entity.
    async fn deliver_message(&mut self, envelope: Envelope) -> Result<(), ShardError> {
        let Envelope { message, sender } = envelope;
        let (id, payload) = self.extractor.extract(&message);
        if id.is_empty() {
            warn!(shard_id = %self.shard_id, "message with empty entity id, dropping to dead letters");
            self.dead_letters.publish(message);
        } else if !self.message_buffers.contains(&id) {
            self.deliver_to(&id, message, payload, sender).await?;
        } else if self.message_buffers.total_size() >= self.settings.buffer_size {
            debug!(
                shard_id = %self.shard_id,
                entity_id = %id,
                "buffer is full, dropping message to dead letters"
            );
            self.dead_letters.publish(message);
        } else {
            debug!(entity_id = %id, "message for an unroutable entity, buffering");
            self.message_buffers.append(&id, message, sender);
        }
        Ok(())
    }

    /// Deliver directly, spawning on demand. In remember-entities mode an
    /// unknown id is gated on a committed `EntityStarted`: the message is
    /// buffered and flushed once the journal acknowledges.
    async fn deliver_to(
        &mut self,
        id: &EntityId,
        message: Message,
        payload: Message,
        sender: Option<Recipient>,
    ) -> Result<(), ShardError> {
        if let Some(worker) = self.ref_by_id.get(id) {
            worker.deliver(Envelope {
                message: payload,
                sender,
            });
            return Ok(());
        }
        if self.remember.is_some() {
            self.message_buffers.append(id, message, sender);
            self.persist(ShardEvent::EntityStarted(id.clone())).await?;
            self.send_msg_buffer(id).await
        } else {
            let worker = self.get_entity(id);
            worker.deliver(Envelope {
                message: payload,
                sender,
            });
            Ok(())
        }
    }

    /// Look up the worker for `id`, spawning, watching, and registering a
    /// new one if absent. Idempotent for live ids.
    fn get_entity(&mut self, id: &EntityId) -> WorkerHandle {
        if let Some(worker) = self.ref_by_id.get(id) {
            return worker.clone();
        }
        debug!(shard_id = %self.shard_id, entity_id = %id, "starting entity");
        let worker_id = self.next_worker_id();
        let ctx = EntityContext::new(
            id.clone(),
            self.shard_id.clone(),
            self.self_tx.clone(),
            worker_id,
        );
        let behavior = self.entity_props.create(id);
        let worker = spawn_entity_worker(worker_id, ctx, behavior, self.self_tx.clone());
        self.id_by_ref.insert(worker_id, id.clone());
        self.ref_by_id.insert(id.clone(), worker.clone());
        self.state.entities.insert(id.clone());
        worker
    }

    /// Open a buffering window for the requesting worker and deliver the
    /// stop message; the worker is expected to stop itself.
    fn passivate(&mut self, worker: WorkerId, stop_message: Message) {
        let Some(id) = self.id_by_ref.get(&worker).cloned() else {
            debug!(shard_id = %self.shard_id, "passivate request from an unknown worker, ignoring");
            return;
        };
        if self.message_buffers.contains(&id) {
            debug!(entity_id = %id, "passivation already in progress, ignoring");
            return;
        }
        debug!(entity_id = %id, "passivating entity");
        self.message_buffers.add(&id);
        self.passivating.insert(worker);
        if let Some(handle) = self.ref_by_id.get(&id) {
            handle.deliver(Envelope {
                message: stop_message,
                sender: None,
            });
        }
    }

    async fn entity_terminated(
        &mut self,
        worker: WorkerId,
        id: EntityId,
    ) -> Result<(), ShardError> {
        // Drop the dead worker's registry entries before any respawn so
        // the ref/id maps stay a bijection.
        self.id_by_ref.remove(&worker);
        if self.ref_by_id.get(&id).is_some_and(|w| w.id() == worker) {
            self.ref_by_id.remove(&id);
        }
        let was_passivating = self.passivating.remove(&worker);

        if self.message_buffers.get(&id).is_some_and(|b| !b.is_empty()) {
            // Traffic arrived while the worker was stopping. Bring it back
            // and flush; no stop/start pair is journaled for this round
            // trip.
            debug!(entity_id = %id, "entity stopped with buffered messages, restarting it");
            self.send_msg_buffer(&id).await
        } else if self.remember.is_some() && !was_passivating {
            debug!(
                entity_id = %id,
                backoff_ms = self.settings.entity_restart_backoff.as_millis() as u64,
                "entity stopped without passivating, restarting after back-off"
            );
            let tx = self.self_tx.clone();
            let backoff = self.settings.entity_restart_backoff;
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = tx.send(ShardMessage::RestartEntity(id));
            });
            Ok(())
        } else {
            self.passivate_completed(id).await
        }
    }

    /// Commit `EntityStopped` and forget the entity.
    async fn passivate_completed(&mut self, id: EntityId) -> Result<(), ShardError> {
        self.persist(ShardEvent::EntityStopped(id.clone())).await?;
        debug!(entity_id = %id, "entity stopped");
        self.state.entities.remove(&id);
        self.message_buffers.remove(&id);
        Ok(())
    }

    /// Close the buffering window for `id` and flush its buffer, oldest
    /// first, through the normal routing path. The window is removed
    /// before the flush so messages arriving afterwards route directly.
    async fn send_msg_buffer(&mut self, id: &EntityId) -> Result<(), ShardError> {
        let buffer = self.message_buffers.take(id);
        if buffer.is_empty() {
            return Ok(());
        }
        debug!(entity_id = %id, count = buffer.len(), "flushing message buffer");
        self.get_entity(id);
        for envelope in buffer {
            self.deliver_buffered(envelope).await?;
        }
        Ok(())
    }

    /// Boxed re-entry into [`Self::deliver_message`] for buffered flushes.
    fn deliver_buffered(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<(), ShardError>> {
        Box::pin(self.deliver_message(envelope))
    }

    fn hand_off(&mut self, requested: ShardId, reply_to: Recipient) -> Flow {
        if requested != self.shard_id {
            warn!(
                shard_id = %self.shard_id,
                requested = %requested,
                "hand-off requested for a different shard, ignoring"
            );
            return Flow::Continue;
        }
        debug!(shard_id = %self.shard_id, "hand-off requested");
        if self.state.entities.is_empty() {
            reply_to.send(dyn_message(ShardStopped {
                shard_id: self.shard_id.clone(),
            }));
            return Flow::Stop;
        }
        let entities: Vec<WorkerHandle> = self.ref_by_id.values().cloned().collect();
        let stopper_id = self.next_worker_id();
        let task = self.stopper_props.stopper(
            self.shard_id.clone(),
            reply_to,
            entities,
            self.hand_off_stop_message.clone(),
        );
        watch_task(
            stopper_id,
            format!("hand-off-stopper-{}", self.shard_id),
            CancellationToken::new(),
            self.self_tx.clone(),
            task,
        );
        self.hand_off_stopper = Some(stopper_id);
        Flow::Continue
    }

    async fn stop_all_workers(&mut self) {
        if self.ref_by_id.is_empty() {
            return;
        }
        for worker in self.ref_by_id.values() {
            worker.abort();
        }
        let drain = join_all(self.ref_by_id.values().map(WorkerHandle::terminated));
        if tokio::time::timeout(self.settings.hand_off_timeout, drain)
            .await
            .is_err()
        {
            warn!(shard_id = %self.shard_id, "timed out waiting for entity workers to stop");
        }
        self.ref_by_id.clear();
        self.id_by_ref.clear();
    }

    /// Commit a lifecycle event before the caller applies it. A no-op
    /// without remember-entities: the plain shard's state is volatile.
    async fn persist(&mut self, event: ShardEvent) -> Result<(), ShardError> {
        if let Some(remember) = self.remember.as_mut() {
            remember.persist(&self.state, &event).await?;
        }
        Ok(())
    }

    fn next_worker_id(&mut self) -> WorkerId {
        self.next_worker_id += 1;
        WorkerId(self.next_worker_id)
    }
}
