use super::{MessageRecord, MessageStatistics, MessageStore};
use async_trait::async_trait;
use relay_error::RelayResult;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// In-process message store, insertion-ordered
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    records: Arc<Mutex<Vec<MessageRecord>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn all(&self) -> Vec<MessageRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MessageRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn newest<F>(&self, limit: usize, filter: F) -> Vec<MessageRecord>
    where
        F: Fn(&MessageRecord) -> bool,
    {
        let mut matching: Vec<MessageRecord> =
            self.lock().iter().filter(|r| filter(r)).cloned().collect();
        matching.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        matching.truncate(limit);
        matching
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(&self, record: MessageRecord) -> RelayResult<MessageRecord> {
        let mut records = self.lock();
        if let Some(existing) = records.iter().find(|r| r.id == record.id) {
            tracing::debug!(message_id = %record.id, "Message already stored");
            return Ok(existing.clone());
        }
        records.push(record.clone());
        Ok(record)
    }

    async fn by_session(&self, session_id: &str, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        Ok(self.newest(limit, |r| r.session_id == session_id))
    }

    async fn by_user(&self, user_id: &str, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        Ok(self.newest(limit, |r| r.user_id == user_id))
    }

    async fn by_type(&self, message_type: &str, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        Ok(self.newest(limit, |r| r.message_type == message_type))
    }

    async fn recent(&self, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        Ok(self.newest(limit, |_| true))
    }

    async fn statistics(&self) -> RelayResult<MessageStatistics> {
        let records = self.lock();
        let mut stats = MessageStatistics {
            total: records.len() as u64,
            ..Default::default()
        };
        let mut sessions = HashSet::new();
        let mut users = HashSet::new();
        for record in records.iter() {
            sessions.insert(record.session_id.as_str());
            users.insert(record.user_id.as_str());
            *stats.by_type.entry(record.message_type.clone()).or_default() += 1;
        }
        stats.sessions = sessions.len() as u64;
        stats.users = users.len() as u64;
        Ok(stats)
    }
}
