pub mod memory;

pub use memory::{MemoryJournal, MemorySnapshotStore};
