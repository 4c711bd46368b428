use crate::error::ShardError;
use crate::types::{EntityId, ShardId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Journal identifier for a shard's event stream.
pub fn persistence_id(type_name: &str, shard_id: &ShardId) -> String {
    format!("/sharding/{type_name}Shard/{shard_id}")
}

/// The set of entities a shard remembers.
///
/// Pure data: the plain shard mutates it volatilely, the remember-entities
/// shard treats it as a cache rebuildable from the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub entities: HashSet<EntityId>,
}

impl ShardState {
    /// Fold one journal event into the state.
    pub fn apply(&mut self, event: &ShardEvent) {
        match event {
            ShardEvent::EntityStarted(id) => {
                self.entities.insert(id.clone());
            }
            ShardEvent::EntityStopped(id) => {
                self.entities.remove(id);
            }
        }
    }
}

/// Journaled lifecycle events; the ground truth for remembered entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardEvent {
    EntityStarted(EntityId),
    EntityStopped(EntityId),
}

/// Append-only event stream, keyed by persistence id.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Append an event and return its sequence number (1-based, contiguous
    /// per stream).
    async fn append(&self, persistence_id: &str, event: &ShardEvent) -> Result<u64, ShardError>;

    /// Events with sequence numbers strictly greater than `after`, in
    /// sequence order.
    async fn events_after(
        &self,
        persistence_id: &str,
        after: u64,
    ) -> Result<Vec<(u64, ShardEvent)>, ShardError>;
}

/// Point-in-time copies of [`ShardState`].
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(
        &self,
        persistence_id: &str,
        sequence_nr: u64,
        state: &ShardState,
    ) -> Result<(), ShardError>;

    /// Most recent snapshot, if any, with the sequence number it covers.
    async fn latest(&self, persistence_id: &str)
        -> Result<Option<(u64, ShardState)>, ShardError>;
}

/// Journaled remember-entities support for one shard.
///
/// Owns the sequence counter the snapshot cadence is computed from. An
/// event is durable before the caller applies it to in-memory state.
pub struct RememberEntities {
    persistence_id: String,
    journal: Arc<dyn EventJournal>,
    snapshots: Arc<dyn SnapshotStore>,
    snapshot_after: u64,
    last_sequence_nr: u64,
}

impl RememberEntities {
    pub fn new(
        type_name: &str,
        shard_id: &ShardId,
        journal: Arc<dyn EventJournal>,
        snapshots: Arc<dyn SnapshotStore>,
        snapshot_after: u64,
    ) -> Self {
        Self {
            persistence_id: persistence_id(type_name, shard_id),
            journal,
            snapshots,
            snapshot_after,
            last_sequence_nr: 0,
        }
    }

    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    pub fn last_sequence_nr(&self) -> u64 {
        self.last_sequence_nr
    }

    /// Rebuild state from the latest snapshot plus subsequent events.
    pub async fn recover(&mut self) -> Result<ShardState, ShardError> {
        let mut state = ShardState::default();
        let mut from = 0;
        if let Some((sequence_nr, snapshot)) = self.snapshots.latest(&self.persistence_id).await? {
            debug!(
                persistence_id = %self.persistence_id,
                sequence_nr,
                "recovering from snapshot"
            );
            state = snapshot;
            from = sequence_nr;
        }
        self.last_sequence_nr = from;
        let events = self.journal.events_after(&self.persistence_id, from).await?;
        for (sequence_nr, event) in events {
            state.apply(&event);
            self.last_sequence_nr = sequence_nr;
        }
        debug!(
            persistence_id = %self.persistence_id,
            entities = state.entities.len(),
            last_sequence_nr = self.last_sequence_nr,
            "recovery completed"
        );
        Ok(state)
    }

    /// Persist one lifecycle event, snapshotting `state` first when the
    /// cadence boundary has been reached. Returns once the journal has
    /// committed; only then may the caller apply the event.
    pub async fn persist(&mut self, state: &ShardState, event: &ShardEvent) -> Result<(), ShardError> {
        self.save_snapshot_when_needed(state).await;
        let sequence_nr = self.journal.append(&self.persistence_id, event).await?;
        self.last_sequence_nr = sequence_nr;
        Ok(())
    }

    /// Snapshot failures are survivable: the next boundary retries.
    async fn save_snapshot_when_needed(&self, state: &ShardState) {
        if self.last_sequence_nr > 0 && self.last_sequence_nr % self.snapshot_after == 0 {
            match self
                .snapshots
                .save(&self.persistence_id, self.last_sequence_nr, state)
                .await
            {
                Ok(()) => debug!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = self.last_sequence_nr,
                    "snapshot saved"
                ),
                Err(error) => warn!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = self.last_sequence_nr,
                    %error,
                    "snapshot save failed, will retry at the next boundary"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryJournal, MemorySnapshotStore};

    fn remember(
        journal: &Arc<MemoryJournal>,
        snapshots: &Arc<MemorySnapshotStore>,
        snapshot_after: u64,
    ) -> RememberEntities {
        RememberEntities::new(
            "Counter",
            &ShardId::new("s-1"),
            Arc::clone(journal) as Arc<dyn EventJournal>,
            Arc::clone(snapshots) as Arc<dyn SnapshotStore>,
            snapshot_after,
        )
    }

    #[test]
    fn persistence_id_format() {
        assert_eq!(
            persistence_id("Counter", &ShardId::new("s-1")),
            "/sharding/CounterShard/s-1"
        );
    }

    #[test]
    fn apply_start_stop_start_remembers_the_entity() {
        let x = EntityId::new("x");
        let mut state = ShardState::default();
        state.apply(&ShardEvent::EntityStarted(x.clone()));
        state.apply(&ShardEvent::EntityStopped(x.clone()));
        state.apply(&ShardEvent::EntityStarted(x.clone()));
        assert_eq!(state.entities, HashSet::from([x]));
    }

    #[tokio::test]
    async fn recover_replays_events_in_order() {
        let journal = Arc::new(MemoryJournal::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let mut remember = remember(&journal, &snapshots, 3600);
        let pid = remember.persistence_id().to_string();

        let a = EntityId::new("a");
        let b = EntityId::new("b");
        journal
            .append(&pid, &ShardEvent::EntityStarted(a.clone()))
            .await
            .unwrap();
        journal
            .append(&pid, &ShardEvent::EntityStarted(b.clone()))
            .await
            .unwrap();
        journal
            .append(&pid, &ShardEvent::EntityStopped(a))
            .await
            .unwrap();

        let state = remember.recover().await.unwrap();
        assert_eq!(state.entities, HashSet::from([b]));
        assert_eq!(remember.last_sequence_nr(), 3);
    }

    #[tokio::test]
    async fn snapshot_with_no_later_events_is_the_recovered_state() {
        let journal = Arc::new(MemoryJournal::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let mut remember = remember(&journal, &snapshots, 3600);
        let pid = remember.persistence_id().to_string();

        let baseline = ShardState {
            entities: HashSet::from([EntityId::new("a"), EntityId::new("b")]),
        };
        snapshots.save(&pid, 7, &baseline).await.unwrap();

        let state = remember.recover().await.unwrap();
        assert_eq!(state, baseline);
        assert_eq!(remember.last_sequence_nr(), 7);
    }

    #[tokio::test]
    async fn recovery_applies_events_after_the_snapshot_baseline() {
        let journal = Arc::new(MemoryJournal::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let pid = persistence_id("Counter", &ShardId::new("s-1"));

        let a = EntityId::new("a");
        let b = EntityId::new("b");
        for event in [
            ShardEvent::EntityStarted(a.clone()),
            ShardEvent::EntityStarted(b.clone()),
        ] {
            journal.append(&pid, &event).await.unwrap();
        }
        let baseline = ShardState {
            entities: HashSet::from([a.clone(), b.clone()]),
        };
        snapshots.save(&pid, 2, &baseline).await.unwrap();
        journal
            .append(&pid, &ShardEvent::EntityStopped(a))
            .await
            .unwrap();

        let mut remember = remember(&journal, &snapshots, 3600);
        let state = remember.recover().await.unwrap();
        assert_eq!(state.entities, HashSet::from([b]));
        assert_eq!(remember.last_sequence_nr(), 3);
    }

    #[tokio::test]
    async fn persist_snapshots_at_the_cadence_boundary() {
        let journal = Arc::new(MemoryJournal::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let mut remember = remember(&journal, &snapshots, 2);
        let pid = remember.persistence_id().to_string();

        let mut state = ShardState::default();
        for name in ["a", "b", "c"] {
            let event = ShardEvent::EntityStarted(EntityId::new(name));
            remember.persist(&state, &event).await.unwrap();
            state.apply(&event);
        }

        // The boundary check runs before the append: the third persist saw
        // last_sequence_nr == 2 and snapshotted the state at that point.
        let (sequence_nr, snapshot) = snapshots.latest(&pid).await.unwrap().unwrap();
        assert_eq!(sequence_nr, 2);
        assert_eq!(
            snapshot.entities,
            HashSet::from([EntityId::new("a"), EntityId::new("b")])
        );
        assert_eq!(remember.last_sequence_nr(), 3);
    }

    #[tokio::test]
    async fn snapshot_failure_does_not_fail_the_persist() {
        let journal = Arc::new(MemoryJournal::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        snapshots.fail_saves(true);
        let mut remember = remember(&journal, &snapshots, 1);

        let state = ShardState::default();
        remember
            .persist(&state, &ShardEvent::EntityStarted(EntityId::new("a")))
            .await
            .unwrap();
        remember
            .persist(&state, &ShardEvent::EntityStarted(EntityId::new("b")))
            .await
            .unwrap();
        assert_eq!(remember.last_sequence_nr(), 2);

        // Once the store recovers, the next boundary succeeds.
        snapshots.fail_saves(false);
        remember
            .persist(&state, &ShardEvent::EntityStarted(EntityId::new("c")))
            .await
            .unwrap();
        let pid = remember.persistence_id().to_string();
        let (sequence_nr, _) = snapshots.latest(&pid).await.unwrap().unwrap();
        assert_eq!(sequence_nr, 2);
    }
}
