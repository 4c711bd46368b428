use crate::types::EntityId;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::time::Duration;

/// Pacing policy for restarting remembered entities after recovery.
///
/// A strategy only produces deferred batches; the shard consumes them,
/// respawning a worker for each id and tolerating ids that are already
/// live.
#[derive(Debug, Clone)]
pub enum EntityRecoveryStrategy {
    /// Restart everything in one immediate batch.
    All,
    /// Restart `number_of_entities` ids at a time, one batch per
    /// `frequency` tick.
    ConstantRate {
        frequency: Duration,
        number_of_entities: usize,
    },
}

impl EntityRecoveryStrategy {
    /// Produce the deferred restart batches for the given remembered ids.
    ///
    /// The all-at-once strategy yields a single already-resolved batch (and
    /// nothing for an empty set). The constant-rate strategy partitions the
    /// ids into fixed-size groups, group `k` resolving after
    /// `(k + 1) * frequency`. Group order follows set iteration; no
    /// stronger ordering is promised.
    pub fn recover_entities(
        &self,
        entities: &HashSet<EntityId>,
    ) -> Vec<BoxFuture<'static, HashSet<EntityId>>> {
        match self {
            Self::All => {
                if entities.is_empty() {
                    Vec::new()
                } else {
                    let all = entities.clone();
                    vec![async move { all }.boxed()]
                }
            }
            Self::ConstantRate {
                frequency,
                number_of_entities,
            } => {
                let frequency = *frequency;
                let group_size = (*number_of_entities).max(1);
                let now = tokio::time::Instant::now();
                let ids: Vec<EntityId> = entities.iter().cloned().collect();
                ids.chunks(group_size)
                    .enumerate()
                    .map(|(index, group)| {
                        let group: HashSet<EntityId> = group.iter().cloned().collect();
                        // Deadlines are anchored here so that awaiting one
                        // batch does not push back the ones after it.
                        let deadline = now + frequency * (index as u32 + 1);
                        async move {
                            tokio::time::sleep_until(deadline).await;
                            group
                        }
                        .boxed()
                    })
                    .collect()
            }
        }
    }
}
