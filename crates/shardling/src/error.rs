use crate::types::ShardId;

/// Errors surfaced by a shard and its persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("journal write failed for {persistence_id}: {reason}")]
    JournalWrite {
        persistence_id: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("journal replay failed for {persistence_id}: {reason}")]
    JournalReplay {
        persistence_id: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("snapshot store failed for {persistence_id}: {reason}")]
    Snapshot {
        persistence_id: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("shard {shard_id} is no longer running")]
    ShardTerminated { shard_id: ShardId },
}
