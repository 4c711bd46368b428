use crate::error::ShardError;
use crate::persistence::{EventJournal, ShardEvent, ShardState, SnapshotStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory event journal for tests and examples.
///
/// Events are stored rmp-encoded so every append and replay exercises the
/// same serde round-trip a real backend would.
#[derive(Default)]
pub struct MemoryJournal {
    streams: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended under `persistence_id`.
    pub fn event_count(&self, persistence_id: &str) -> usize {
        self.streams
            .lock()
            .get(persistence_id)
            .map_or(0, Vec::len)
    }

    /// Decode the full stream for `persistence_id`, oldest first.
    pub fn events(&self, persistence_id: &str) -> Vec<ShardEvent> {
        let streams = self.streams.lock();
        streams
            .get(persistence_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter_map(|bytes| rmp_serde::from_slice(bytes).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn append(&self, persistence_id: &str, event: &ShardEvent) -> Result<u64, ShardError> {
        let bytes = rmp_serde::to_vec(event).map_err(|e| ShardError::JournalWrite {
            persistence_id: persistence_id.to_string(),
            reason: "event encoding failed".to_string(),
            source: Some(Box::new(e)),
        })?;
        let mut streams = self.streams.lock();
        let stream = streams.entry(persistence_id.to_string()).or_default();
        stream.push(bytes);
        Ok(stream.len() as u64)
    }

    async fn events_after(
        &self,
        persistence_id: &str,
        after: u64,
    ) -> Result<Vec<(u64, ShardEvent)>, ShardError> {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(persistence_id) else {
            return Ok(Vec::new());
        };
        stream
            .iter()
            .enumerate()
            .skip(after as usize)
            .map(|(index, bytes)| {
                let event =
                    rmp_serde::from_slice(bytes).map_err(|e| ShardError::JournalReplay {
                        persistence_id: persistence_id.to_string(),
                        reason: format!("event {} is corrupt", index + 1),
                        source: Some(Box::new(e)),
                    })?;
                Ok((index as u64 + 1, event))
            })
            .collect()
    }
}

/// In-memory snapshot store for tests and examples.
///
/// Keeps only the most recent snapshot per stream. Saves can be made to
/// fail on demand to exercise the shard's snapshot-failure path.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, (u64, Vec<u8>)>>,
    fail_saves: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail (or succeed again) for failure testing.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(
        &self,
        persistence_id: &str,
        sequence_nr: u64,
        state: &ShardState,
    ) -> Result<(), ShardError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(ShardError::Snapshot {
                persistence_id: persistence_id.to_string(),
                reason: "save rejected by test configuration".to_string(),
                source: None,
            });
        }
        let bytes = rmp_serde::to_vec(state).map_err(|e| ShardError::Snapshot {
            persistence_id: persistence_id.to_string(),
            reason: "state encoding failed".to_string(),
            source: Some(Box::new(e)),
        })?;
        self.snapshots
            .lock()
            .insert(persistence_id.to_string(), (sequence_nr, bytes));
        Ok(())
    }

    async fn latest(
        &self,
        persistence_id: &str,
    ) -> Result<Option<(u64, ShardState)>, ShardError> {
        let snapshots = self.snapshots.lock();
        let Some((sequence_nr, bytes)) = snapshots.get(persistence_id) else {
            return Ok(None);
        };
        let state = rmp_serde::from_slice(bytes).map_err(|e| ShardError::Snapshot {
            persistence_id: persistence_id.to_string(),
            reason: "snapshot is corrupt".to_string(),
            source: Some(Box::new(e)),
        })?;
        Ok(Some((*sequence_nr, state)))
    }
}
