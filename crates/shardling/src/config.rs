use crate::error::ShardError;
use crate::recovery::EntityRecoveryStrategy;
use std::time::Duration;

/// Tuning parameters for a shard.
#[derive(Debug, Clone)]
pub struct ShardSettings {
    /// Hard cap on the total number of buffered messages per shard, summed
    /// across all entity buffers. Default: 100_000.
    pub buffer_size: usize,
    /// Journal event-count modulus that triggers a state snapshot in
    /// remember-entities mode. Default: 3600.
    pub snapshot_after: u64,
    /// Delay before an entity that stopped without passivating is restarted
    /// (remember-entities mode). Default: 10s.
    pub entity_restart_backoff: Duration,
    /// Pacing of remembered-entity restarts after recovery: `"all"` or
    /// `"constant"`. Default: "all".
    pub entity_recovery_strategy: String,
    /// Interval between restart batches for the constant-rate strategy.
    /// Default: 100ms.
    pub entity_recovery_constant_rate_frequency: Duration,
    /// Batch size for the constant-rate strategy. Default: 5.
    pub entity_recovery_constant_rate_number_of_entities: usize,
    /// Journal backend identifier, resolved by the embedding environment.
    pub journal_plugin_id: String,
    /// Snapshot backend identifier, resolved by the embedding environment.
    pub snapshot_plugin_id: String,
    /// Deadline the default hand-off stopper gives entities before
    /// force-cancelling them. Default: 10s.
    pub hand_off_timeout: Duration,
}

impl ShardSettings {
    /// Validate configuration values. Returns an error if any value is invalid.
    pub fn validate(&self) -> Result<(), ShardError> {
        if self.buffer_size == 0 {
            return Err(ShardError::InvalidConfig {
                reason: "buffer_size must be >= 1".to_string(),
            });
        }
        if self.snapshot_after == 0 {
            return Err(ShardError::InvalidConfig {
                reason: "snapshot_after must be >= 1".to_string(),
            });
        }
        if self.entity_recovery_strategy != "all" && self.entity_recovery_strategy != "constant" {
            return Err(ShardError::InvalidConfig {
                reason: format!(
                    "entity_recovery_strategy must be \"all\" or \"constant\", got {:?}",
                    self.entity_recovery_strategy
                ),
            });
        }
        if self.entity_recovery_constant_rate_frequency.is_zero() {
            return Err(ShardError::InvalidConfig {
                reason: "entity_recovery_constant_rate_frequency must be > 0".to_string(),
            });
        }
        if self.entity_recovery_constant_rate_number_of_entities == 0 {
            return Err(ShardError::InvalidConfig {
                reason: "entity_recovery_constant_rate_number_of_entities must be >= 1".to_string(),
            });
        }
        if self.hand_off_timeout.is_zero() {
            return Err(ShardError::InvalidConfig {
                reason: "hand_off_timeout must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// The recovery pacing strategy selected by these settings.
    pub fn recovery_strategy(&self) -> EntityRecoveryStrategy {
        if self.entity_recovery_strategy == "constant" {
            EntityRecoveryStrategy::ConstantRate {
                frequency: self.entity_recovery_constant_rate_frequency,
                number_of_entities: self.entity_recovery_constant_rate_number_of_entities,
            }
        } else {
            EntityRecoveryStrategy::All
        }
    }
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100_000,
            snapshot_after: 3600,
            entity_restart_backoff: Duration::from_secs(10),
            entity_recovery_strategy: "all".to_string(),
            entity_recovery_constant_rate_frequency: Duration::from_millis(100),
            entity_recovery_constant_rate_number_of_entities: 5,
            journal_plugin_id: String::new(),
            snapshot_plugin_id: String::new(),
            hand_off_timeout: Duration::from_secs(10),
        }
    }
}
