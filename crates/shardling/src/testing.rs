//! Test support: message probes, a recording entity behavior, and the
//! addressed-message extractor the test suites route with.

use crate::entity::{Entity, EntityBehavior, EntityContext, Flow};
use crate::message::{dyn_message, Message, MessageExtractor, Recipient};
use crate::types::EntityId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A recipient with an inspectable receiving side.
pub struct Probe {
    recipient: Recipient,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Probe {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (recipient, rx) = Recipient::channel();
        Self { recipient, rx }
    }

    pub fn recipient(&self) -> Recipient {
        self.recipient.clone()
    }

    /// Await the next message and downcast it, panicking on timeout or on
    /// a message of a different type.
    pub async fn expect<T: Any + Send + Sync>(&mut self) -> Arc<T> {
        let message = tokio::time::timeout(Duration::from_secs(3), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("probe channel closed");
        message
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("unexpected message type"))
    }

    /// Assert that nothing arrives within the window.
    pub async fn expect_no_message(&mut self, within: Duration) {
        if tokio::time::timeout(within, self.rx.recv()).await.is_ok() {
            panic!("unexpected message arrived");
        }
    }
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    loop {
        if check() {
            return;
        }
        if start.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Application message used by tests: a payload addressed to an entity.
#[derive(Clone)]
pub struct Addressed {
    pub entity_id: String,
    pub payload: Message,
}

/// Build an [`Addressed`] message.
pub fn addressed<T: Any + Send + Sync>(entity_id: &str, payload: T) -> Message {
    dyn_message(Addressed {
        entity_id: entity_id.to_string(),
        payload: dyn_message(payload),
    })
}

/// Extractor for [`Addressed`] messages. Anything else yields an empty id
/// and is dead-lettered by the shard.
pub struct AddressedExtractor;

impl MessageExtractor for AddressedExtractor {
    fn extract(&self, message: &Message) -> (EntityId, Message) {
        match message.downcast_ref::<Addressed>() {
            Some(addressed) => (
                EntityId::new(addressed.entity_id.clone()),
                addressed.payload.clone(),
            ),
            None => (EntityId::new(""), message.clone()),
        }
    }
}

/// Ask a [`RecordingEntity`] worker to request its own passivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassivateMe;

/// Stop message understood by [`RecordingEntity`]; also a reasonable
/// `hand_off_stop_message` for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEntity;

/// Make a [`RecordingEntity`] worker panic, simulating a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEntity;

/// Ask a [`RecordingEntity`] worker to echo this message to its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoToSender;

/// Shared record of everything the recording behaviors handled.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    entries: Arc<Mutex<Vec<(EntityId, Message)>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: EntityId, message: Message) {
        self.entries.lock().push((id, message));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Payloads of type `T` delivered to `id`, in delivery order.
    pub fn values<T: Any + Clone>(&self, id: &EntityId) -> Vec<T> {
        self.entries
            .lock()
            .iter()
            .filter(|(entry_id, _)| entry_id == id)
            .filter_map(|(_, message)| message.downcast_ref::<T>().cloned())
            .collect()
    }
}

/// Entity behavior for tests: records every payload it handles and obeys
/// the control messages above.
pub struct RecordingEntity {
    log: DeliveryLog,
    stop_delay: Option<Duration>,
    crash_on_stop: bool,
}

impl RecordingEntity {
    pub fn new(log: DeliveryLog) -> Self {
        Self {
            log,
            stop_delay: None,
            crash_on_stop: false,
        }
    }

    /// Sleep before honoring [`StopEntity`], holding the buffering window
    /// open so tests can enqueue traffic behind a stopping worker.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = Some(delay);
        self
    }

    /// Panic instead of stopping cleanly when [`StopEntity`] arrives.
    pub fn crash_on_stop(mut self) -> Self {
        self.crash_on_stop = true;
        self
    }
}

impl Entity for RecordingEntity {
    fn create(&self, _id: &EntityId) -> Box<dyn EntityBehavior> {
        Box::new(RecordingBehavior {
            log: self.log.clone(),
            stop_delay: self.stop_delay,
            crash_on_stop: self.crash_on_stop,
        })
    }
}

struct RecordingBehavior {
    log: DeliveryLog,
    stop_delay: Option<Duration>,
    crash_on_stop: bool,
}

#[async_trait]
impl EntityBehavior for RecordingBehavior {
    async fn handle(
        &mut self,
        ctx: &EntityContext,
        message: Message,
        sender: Option<Recipient>,
    ) -> Flow {
        if message.downcast_ref::<PassivateMe>().is_some() {
            ctx.passivate(dyn_message(StopEntity));
            return Flow::Continue;
        }
        if message.downcast_ref::<StopEntity>().is_some() {
            self.log.record(ctx.entity_id.clone(), message);
            if let Some(delay) = self.stop_delay {
                tokio::time::sleep(delay).await;
            }
            if self.crash_on_stop {
                panic!("crash on stop requested");
            }
            return Flow::Stop;
        }
        if message.downcast_ref::<CrashEntity>().is_some() {
            panic!("entity crash requested");
        }
        if message.downcast_ref::<EchoToSender>().is_some() {
            if let Some(sender) = &sender {
                sender.send(message.clone());
            }
            return Flow::Continue;
        }
        self.log.record(ctx.entity_id.clone(), message);
        Flow::Continue
    }
}
