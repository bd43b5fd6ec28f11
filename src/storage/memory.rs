use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::remote::BodyContent;
use crate::types::{EmailRecord, RecordKey};

pub const DEFAULT_MEMORY_CAPACITY: usize = 2048;

/// Hot copies of records read through the persistent tier, bounded to
/// `capacity` entries. The oldest warmed key is evicted first.
pub struct MemoryTier {
    records: DashMap<RecordKey, EmailRecord>,
    order: Mutex<VecDeque<RecordKey>>,
    capacity: usize,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &RecordKey) -> Option<EmailRecord> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, record: EmailRecord) {
        let key = record.key();
        if self.records.insert(key.clone(), record).is_some() {
            return;
        }

        let Ok(mut order) = self.order.lock() else {
            return;
        };
        order.push_back(key);
        while self.records.len() > self.capacity {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            self.records.remove(&oldest);
        }
        // Keys removed through other paths linger in the queue; drop them
        // before it outgrows the map.
        if order.len() > self.capacity * 2 {
            order.retain(|k| self.records.contains_key(k));
        }
    }

    pub fn remove(&self, key: &RecordKey) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn set_unread(&self, key: &RecordKey, unread: bool) {
        if let Some(mut entry) = self.records.get_mut(key) {
            entry.unread = unread;
        }
    }

    pub fn set_body(&self, key: &RecordKey, body: &BodyContent) {
        if let Some(mut entry) = self.records.get_mut(key) {
            entry.body_html = body.html.clone();
            entry.snippet = body.snippet.clone();
            entry.attachments = body.attachments.clone();
        }
    }

    pub fn remove_mailbox(&self, account: &str, mailbox: &str) {
        self.records
            .retain(|key, _| !(key.account == account && key.mailbox == mailbox));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
