use crate::message::{Envelope, Message, Recipient};
use crate::types::EntityId;
use std::collections::{HashMap, VecDeque};

/// FIFO of in-flight messages for one entity, held while the entity is
/// unroutable (passivating, restarting, or awaiting a journaled start).
///
/// Owned exclusively by its shard's mailbox loop; no synchronization.
#[derive(Default)]
pub struct MessageBuffer {
    entries: VecDeque<Envelope>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message with its sender, preserving arrival order.
    pub fn append(&mut self, message: Message, sender: Option<Recipient>) {
        self.entries.push_back(Envelope { message, sender });
    }

    /// Dequeue the oldest entry, if any.
    pub fn drop_head(&mut self) -> Option<Envelope> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit entries oldest first without consuming them.
    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter()
    }
}

impl IntoIterator for MessageBuffer {
    type Item = Envelope;
    type IntoIter = std::collections::vec_deque::IntoIter<Envelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Per-entity message buffers, keyed by entity id.
///
/// The presence of a key is itself meaningful: an entity with an entry
/// (even an empty one) is in a buffering window and must not receive
/// direct deliveries.
#[derive(Default)]
pub struct MessageBufferMap {
    buffers: HashMap<EntityId, MessageBuffer>,
}

impl MessageBufferMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as buffering without enqueuing anything.
    pub fn add(&mut self, id: &EntityId) {
        self.buffers.entry(id.clone()).or_default();
    }

    /// Append to the buffer for `id`, creating it if absent.
    pub fn append(&mut self, id: &EntityId, message: Message, sender: Option<Recipient>) {
        self.buffers
            .entry(id.clone())
            .or_default()
            .append(message, sender);
    }

    /// Drop the entry for `id`, discarding any unread messages.
    pub fn remove(&mut self, id: &EntityId) {
        self.buffers.remove(id);
    }

    /// Detach and return the buffer for `id`, closing its buffering window.
    /// Absent ids yield an empty buffer.
    pub fn take(&mut self, id: &EntityId) -> MessageBuffer {
        self.buffers.remove(id).unwrap_or_default()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.buffers.contains_key(id)
    }

    pub fn get(&self, id: &EntityId) -> Option<&MessageBuffer> {
        self.buffers.get(id)
    }

    /// Total buffered messages across all entities; the shard's admission
    /// cap is enforced against this sum.
    pub fn total_size(&self) -> usize {
        self.buffers.values().map(MessageBuffer::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::dyn_message;

    fn payload(n: i32) -> Message {
        dyn_message(n)
    }

    fn value(envelope: &Envelope) -> i32 {
        *envelope.message.downcast_ref::<i32>().unwrap()
    }

    #[test]
    fn buffer_preserves_insertion_order() {
        let mut buffer = MessageBuffer::new();
        buffer.append(payload(1), None);
        buffer.append(payload(2), None);
        buffer.append(payload(3), None);

        let seen: Vec<i32> = buffer.iter().map(value).collect();
        assert_eq!(seen, vec![1, 2, 3]);

        assert_eq!(value(&buffer.drop_head().unwrap()), 1);
        assert_eq!(value(&buffer.drop_head().unwrap()), 2);
        assert_eq!(value(&buffer.drop_head().unwrap()), 3);
        assert!(buffer.drop_head().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn draining_restores_the_empty_representation() {
        let mut buffer = MessageBuffer::new();
        buffer.append(payload(1), None);
        buffer.drop_head();
        assert_eq!(buffer.len(), 0);

        // Reusable after draining.
        buffer.append(payload(2), None);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn add_flags_without_enqueuing() {
        let mut map = MessageBufferMap::new();
        let id = EntityId::new("a");

        assert!(!map.contains(&id));
        map.add(&id);
        assert!(map.contains(&id));
        assert_eq!(map.get(&id).unwrap().len(), 0);
        assert_eq!(map.total_size(), 0);
    }

    #[test]
    fn add_does_not_clobber_an_existing_buffer() {
        let mut map = MessageBufferMap::new();
        let id = EntityId::new("a");
        map.append(&id, payload(1), None);
        map.add(&id);
        assert_eq!(map.get(&id).unwrap().len(), 1);
    }

    #[test]
    fn append_lazily_creates_the_buffer() {
        let mut map = MessageBufferMap::new();
        let id = EntityId::new("a");
        map.append(&id, payload(1), None);
        assert!(map.contains(&id));
        assert_eq!(map.get(&id).unwrap().len(), 1);
    }

    #[test]
    fn remove_discards_unread_messages() {
        let mut map = MessageBufferMap::new();
        let id = EntityId::new("a");
        map.append(&id, payload(1), None);
        map.remove(&id);
        assert!(!map.contains(&id));
        assert_eq!(map.total_size(), 0);
    }

    #[test]
    fn take_detaches_the_buffer_and_closes_the_window() {
        let mut map = MessageBufferMap::new();
        let id = EntityId::new("a");
        map.append(&id, payload(1), None);
        map.append(&id, payload(2), None);

        let buffer = map.take(&id);
        assert!(!map.contains(&id));
        let seen: Vec<i32> = buffer.into_iter().map(|e| value(&e)).collect();
        assert_eq!(seen, vec![1, 2]);

        // Absent ids yield an empty buffer with no side effect.
        assert!(map.take(&id).is_empty());
        assert!(!map.contains(&id));
    }

    #[test]
    fn total_size_sums_across_entities() {
        let mut map = MessageBufferMap::new();
        map.append(&EntityId::new("a"), payload(1), None);
        map.append(&EntityId::new("a"), payload(2), None);
        map.append(&EntityId::new("b"), payload(3), None);
        map.add(&EntityId::new("c"));
        assert_eq!(map.total_size(), 3);
    }
}
