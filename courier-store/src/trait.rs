use std::time::SystemTime;

use async_trait::async_trait;
use courier_common::{DeliveryAttempt, MessageId, MessageRequest, MessageStatus, OtpCode};

/// A half-open `[start, end)` window over timestamps
///
/// A missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<SystemTime>,
    pub end: Option<SystemTime>,
}

impl TimeRange {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    #[must_use]
    pub const fn between(start: SystemTime, end: SystemTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    #[must_use]
    pub const fn since(start: SystemTime) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    #[must_use]
    pub const fn before(end: SystemTime) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    #[must_use]
    pub fn contains(&self, at: SystemTime) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at < end)
    }
}

/// Durable record of each message's lifecycle plus its attempt log
///
/// Implementations must have made a write durable by the time the returned
/// future resolves; the dispatcher relies on that before advancing a message.
#[async_trait]
pub trait DeliveryStateStore: Send + Sync + std::fmt::Debug {
    /// Insert or overwrite the record for `message.id`
    async fn upsert(&self, message: &MessageRequest) -> crate::Result<()>;

    /// Append an attempt to the message's log
    ///
    /// Appending a (message, attempt number) pair that is already logged is
    /// a no-op and returns `false`.
    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> crate::Result<bool>;

    async fn get(&self, id: &MessageId) -> crate::Result<MessageRequest>;

    /// Attempts for one message, ordered by attempt number
    async fn attempts(&self, id: &MessageId) -> crate::Result<Vec<DeliveryAttempt>>;

    /// Messages created within `range`, optionally restricted to one status,
    /// ordered by id (submission order)
    async fn query(
        &self,
        status: Option<MessageStatus>,
        range: TimeRange,
    ) -> crate::Result<Vec<MessageRequest>>;

    /// Attempts logged within `range`, across all messages
    async fn attempts_between(&self, range: TimeRange) -> crate::Result<Vec<DeliveryAttempt>>;

    /// Messages not yet in a terminal status
    async fn unfinished(&self) -> crate::Result<Vec<MessageRequest>>;

    /// Remove terminal messages created before `cutoff`, together with their
    /// attempts, returning how many messages were removed
    async fn purge_before(&self, cutoff: SystemTime) -> crate::Result<usize>;
}

/// Storage for the single active one-time code per recipient
#[async_trait]
pub trait OtpStore: Send + Sync + std::fmt::Debug {
    /// Store `code` as the recipient's active code, returning the one it replaced
    async fn replace_code(&self, code: &OtpCode) -> crate::Result<Option<OtpCode>>;

    async fn code_for(&self, recipient: &str) -> crate::Result<Option<OtpCode>>;

    /// Overwrite the recipient's code in place, used to mark it consumed
    async fn save_code(&self, code: &OtpCode) -> crate::Result<()>;

    /// Drop codes issued before `cutoff`
    async fn purge_codes_before(&self, cutoff: SystemTime) -> crate::Result<usize>;
}
