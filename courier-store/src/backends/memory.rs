use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
    time::SystemTime,
};

use async_trait::async_trait;
use courier_common::{DeliveryAttempt, MessageId, MessageRequest, MessageStatus, OtpCode};

use crate::{
    StoreError,
    r#trait::{DeliveryStateStore, OtpStore, TimeRange},
};

/// In-memory store
///
/// Messages, attempt logs and one-time codes each live in a `HashMap` behind
/// an `RwLock`. Nothing survives a restart, so this is meant for tests and
/// development.
///
/// # Capacity Management
/// An optional capacity bounds the number of message records. Inserting a
/// new message beyond it fails with [`StoreError::CapacityExceeded`];
/// overwriting an existing record always succeeds.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    pub(crate) messages: Arc<RwLock<HashMap<MessageId, MessageRequest>>>,
    pub(crate) attempts: Arc<RwLock<HashMap<MessageId, BTreeMap<u32, DeliveryAttempt>>>>,
    pub(crate) otps: Arc<RwLock<HashMap<String, OtpCode>>>,
    capacity: Option<usize>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Number of message records held
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl DeliveryStateStore for MemoryStateStore {
    async fn upsert(&self, message: &MessageRequest) -> crate::Result<()> {
        let mut messages = self.messages.write()?;

        if let Some(capacity) = self.capacity
            && !messages.contains_key(&message.id)
            && messages.len() >= capacity
        {
            return Err(StoreError::CapacityExceeded {
                used: messages.len(),
                capacity,
            });
        }

        messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> crate::Result<bool> {
        let mut attempts = self.attempts.write()?;
        let log = attempts.entry(attempt.message_id).or_default();

        if log.contains_key(&attempt.attempt) {
            return Ok(false);
        }

        log.insert(attempt.attempt, attempt.clone());
        Ok(true)
    }

    async fn get(&self, id: &MessageId) -> crate::Result<MessageRequest> {
        self.messages
            .read()?
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    async fn attempts(&self, id: &MessageId) -> crate::Result<Vec<DeliveryAttempt>> {
        Ok(self
            .attempts
            .read()?
            .get(id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn query(
        &self,
        status: Option<MessageStatus>,
        range: TimeRange,
    ) -> crate::Result<Vec<MessageRequest>> {
        let mut found: Vec<_> = self
            .messages
            .read()?
            .values()
            .filter(|message| status.is_none_or(|status| message.status == status))
            .filter(|message| range.contains(message.created_at))
            .cloned()
            .collect();

        found.sort_by_key(|message| message.id);
        Ok(found)
    }

    async fn attempts_between(&self, range: TimeRange) -> crate::Result<Vec<DeliveryAttempt>> {
        let mut found: Vec<_> = self
            .attempts
            .read()?
            .values()
            .flat_map(BTreeMap::values)
            .filter(|attempt| range.contains(attempt.timestamp))
            .cloned()
            .collect();

        found.sort_by_key(|attempt| attempt.timestamp);
        Ok(found)
    }

    async fn unfinished(&self) -> crate::Result<Vec<MessageRequest>> {
        let mut found: Vec<_> = self
            .messages
            .read()?
            .values()
            .filter(|message| !message.status.is_terminal())
            .cloned()
            .collect();

        found.sort_by_key(|message| message.id);
        Ok(found)
    }

    async fn purge_before(&self, cutoff: SystemTime) -> crate::Result<usize> {
        let mut messages = self.messages.write()?;
        let mut attempts = self.attempts.write()?;

        let doomed: Vec<MessageId> = messages
            .values()
            .filter(|message| message.status.is_terminal() && message.created_at < cutoff)
            .map(|message| message.id)
            .collect();

        for id in &doomed {
            messages.remove(id);
            attempts.remove(id);
        }

        Ok(doomed.len())
    }
}

#[async_trait]
impl OtpStore for MemoryStateStore {
    async fn replace_code(&self, code: &OtpCode) -> crate::Result<Option<OtpCode>> {
        Ok(self
            .otps
            .write()?
            .insert(code.recipient.clone(), code.clone()))
    }

    async fn code_for(&self, recipient: &str) -> crate::Result<Option<OtpCode>> {
        Ok(self.otps.read()?.get(recipient).cloned())
    }

    async fn save_code(&self, code: &OtpCode) -> crate::Result<()> {
        self.otps
            .write()?
            .insert(code.recipient.clone(), code.clone());
        Ok(())
    }

    async fn purge_codes_before(&self, cutoff: SystemTime) -> crate::Result<usize> {
        let mut otps = self.otps.write()?;
        let before = otps.len();
        otps.retain(|_, code| code.issued_at >= cutoff);
        Ok(before - otps.len())
    }
}
