//! Per-partition entity supervision for a cluster-sharding layer.
//!
//! A [`shard::ShardBuilder`] starts a shard: a single-threaded supervisor
//! that lazily spawns one worker per entity id, buffers traffic across
//! passivation and restart windows, and cooperates with an external
//! coordinator's hand-off protocol. With
//! [`remember_entities`](shard::ShardBuilder::remember_entities) the set of
//! live entity ids is journaled and survives shard restarts.

pub mod config;
pub mod entity;
pub mod error;
pub mod handoff;
pub mod message;
pub mod message_buffer;
pub mod persistence;
pub mod recovery;
pub mod shard;
pub mod storage;
pub mod testing;
pub mod types;
pub mod worker;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::config::ShardSettings;
    pub use crate::entity::{Entity, EntityBehavior, EntityContext, Flow};
    pub use crate::error::ShardError;
    pub use crate::message::{
        dyn_message, DeadLetters, Message, MessageExtractor, Recipient, ShardInitialized,
        ShardStopped,
    };
    pub use crate::shard::{ShardBuilder, ShardHandle};
    pub use crate::types::{EntityId, ShardId};
}
