use std::collections::{HashSet, VecDeque};
use voxlink_types::ChatMessage;

/// Bounded, deduplicating message history.
///
/// Holds both sent and received messages in arrival order. When the limit
/// is exceeded the oldest message is evicted, together with its id, so a
/// very old id may be accepted again.
#[derive(Debug)]
pub struct MessageHistory {
    limit: usize,
    order: VecDeque<ChatMessage>,
    ids: HashSet<String>,
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Appends `message` unless its id is already present.
    ///
    /// Returns `false` for a duplicate.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.order.push_back(message);
        while self.order.len() > self.limit {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted.id);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.order.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_id: "peer".to_string(),
            sender_name: None,
            text: format!("text {id}"),
            ts: 0,
        }
    }

    #[test]
    fn rejects_duplicates() {
        let mut history = MessageHistory::new(10);
        assert!(history.insert(msg("1")));
        assert!(!history.insert(msg("1")));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let mut history = MessageHistory::new(2);
        history.insert(msg("1"));
        history.insert(msg("2"));
        history.insert(msg("3"));

        let ids: Vec<String> = history.to_vec().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["2", "3"]);
        assert!(!history.contains("1"));
        // An evicted id is no longer remembered.
        assert!(history.insert(msg("1")));
    }
}
