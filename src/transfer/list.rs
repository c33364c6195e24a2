use super::record::{TransferId, TransferRecord};
use crate::network::protocol::Token;
use std::collections::{HashMap, VecDeque};

/// Owned arena of transfer records in enqueue order (oldest first).
///
/// Records are addressed by id; the order is kept separately so records can
/// be replaced in place without moving the others.
#[derive(Debug, Default)]
pub struct TransferList {
    records: HashMap<TransferId, TransferRecord>,
    order: VecDeque<TransferId>,
}

impl TransferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Append as the newest record.
    pub fn push(&mut self, record: TransferRecord) -> TransferId {
        let id = record.id();
        self.order.push_back(id);
        self.records.insert(id, record);
        id
    }

    /// Insert at `index` in enqueue order, clamped to the end of the list.
    pub fn insert(&mut self, index: usize, record: TransferRecord) -> TransferId {
        let id = record.id();
        let index = index.min(self.order.len());
        self.order.insert(index, id);
        self.records.insert(id, record);
        id
    }

    pub fn remove(&mut self, id: TransferId) -> Option<(usize, TransferRecord)> {
        let record = self.records.remove(&id)?;
        let index = self.position(id)?;
        self.order.remove(index);
        Some((index, record))
    }

    pub fn position(&self, id: TransferId) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == id)
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut TransferRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.records.contains_key(&id)
    }

    /// Records oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TransferRecord> + '_ {
        self.order.iter().filter_map(move |id| self.records.get(id))
    }

    /// Ids oldest first, detached from the list so callers may mutate while
    /// walking them.
    pub fn ids(&self) -> Vec<TransferId> {
        self.order.iter().copied().collect()
    }

    pub fn ids_where(&self, predicate: impl Fn(&TransferRecord) -> bool) -> Vec<TransferId> {
        self.iter()
            .filter(|record| predicate(*record))
            .map(TransferRecord::id)
            .collect()
    }

    pub fn find(&self, user: &str, virtual_path: &str) -> Option<TransferId> {
        self.iter()
            .find(|record| record.matches(user, virtual_path))
            .map(TransferRecord::id)
    }

    pub fn find_by_token(&self, user: &str, token: Token) -> Option<TransferId> {
        self.iter()
            .find(|record| record.has_token(user, token))
            .map(TransferRecord::id)
    }

    pub fn for_user<'a>(&'a self, user: &'a str) -> impl Iterator<Item = &'a TransferRecord> + 'a {
        self.iter().filter(move |record| record.user() == user)
    }

    pub fn drain(&mut self) -> Vec<TransferRecord> {
        let order = std::mem::take(&mut self.order);
        let mut records = std::mem::take(&mut self.records);
        order.into_iter().filter_map(|id| records.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferStatus;

    fn record(user: &str, path: &str) -> TransferRecord {
        TransferRecord::new(user, path, "", TransferStatus::Queued, 10)
    }

    #[test]
    fn test_order_and_lookup() {
        let mut list = TransferList::new();
        let first = list.push(record("alice", "a"));
        let second = list.push(record("bob", "b"));

        assert_eq!(list.ids(), vec![first, second]);
        assert_eq!(list.find("bob", "b"), Some(second));
        assert_eq!(list.find("bob", "a"), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut list = TransferList::new();
        list.push(record("alice", "a"));
        let middle = list.push(record("bob", "b"));
        list.push(record("carol", "c"));

        let (index, _) = list.remove(middle).unwrap();
        let replacement = list.insert(index, record("bob", "b"));

        assert_eq!(list.position(replacement), Some(1));
        assert!(!list.contains(middle));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_token_lookup_requires_user() {
        let mut list = TransferList::new();
        let id = list.push(record("alice", "a"));
        list.get_mut(id).unwrap().negotiate(5, std::time::Instant::now());

        assert_eq!(list.find_by_token("alice", 5), Some(id));
        assert_eq!(list.find_by_token("bob", 5), None);
    }
}
