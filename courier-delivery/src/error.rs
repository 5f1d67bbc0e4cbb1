//! Typed error handling for delivery operations.
//!
//! [`DeliveryError`] classifies what went wrong with a message after it was
//! accepted. The remaining types cover the engine's outer surface:
//! submission, lookups and configuration.

use courier_common::{ChannelKind, FailureKind, MessageId, ParseError, Priority};
use courier_store::StoreError;
use thiserror::Error;

use crate::channel::SendFailure;

/// Why a message did not (or not yet) reach its recipient.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The channel rejected the message outright; never retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// The channel failed in a way worth retrying.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),

    /// Every ranked channel used its attempt budget.
    #[error("Exhausted retries after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    /// The message was already stale when first claimed.
    #[error("Expired: scheduled {overdue_secs}s ago, beyond the staleness window")]
    Expired { overdue_secs: u64 },
}

#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Content rejected: {0}")]
    ContentRejected(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Send timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("Dispatcher not initialized: {0}")]
    NotInitialized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// The channel failure kind this error was built from, if any
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Permanent(PermanentError::InvalidRecipient(_)) => {
                Some(FailureKind::InvalidRecipient)
            }
            Self::Permanent(PermanentError::ContentRejected(_)) => {
                Some(FailureKind::ContentRejected)
            }
            Self::Temporary(TemporaryError::Timeout(_)) => Some(FailureKind::Timeout),
            Self::Temporary(TemporaryError::Network(_)) => Some(FailureKind::Network),
            Self::Temporary(TemporaryError::RateLimited(_)) => Some(FailureKind::RateLimited),
            Self::Temporary(TemporaryError::ProviderUnavailable(_)) => {
                Some(FailureKind::ProviderUnavailable)
            }
            _ => None,
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Storage(error))
    }
}

/// Sender failures map onto the permanent/temporary split by kind.
impl From<SendFailure> for DeliveryError {
    fn from(failure: SendFailure) -> Self {
        let SendFailure { kind, detail } = failure;
        match kind {
            FailureKind::InvalidRecipient => PermanentError::InvalidRecipient(detail).into(),
            FailureKind::ContentRejected => PermanentError::ContentRejected(detail).into(),
            FailureKind::Timeout => TemporaryError::Timeout(detail).into(),
            FailureKind::Network => TemporaryError::Network(detail).into(),
            FailureKind::RateLimited => TemporaryError::RateLimited(detail).into(),
            FailureKind::ProviderUnavailable => {
                TemporaryError::ProviderUnavailable(detail).into()
            }
        }
    }
}

/// A submission that was refused; nothing was queued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl From<ParseError> for SubmitError {
    fn from(error: ParseError) -> Self {
        Self::InvalidRequest(error.to_string())
    }
}

/// Failure to read or change state through the engine.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    #[error("Storage failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for QueryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

/// Rejected delivery configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("At least one channel must be configured")]
    NoChannels,

    #[error("Rate limit for {0} must be greater than zero")]
    InvalidRateLimit(ChannelKind),

    #[error("Cost for {0} must be a finite, non-negative number")]
    InvalidCost(ChannelKind),

    #[error("Routing for {priority} names {channel}, which is not configured")]
    UnroutableTier {
        priority: Priority,
        channel: ChannelKind,
    },

    #[error("No sender registered for configured channel {0}")]
    MissingSender(ChannelKind),

    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failure_classification() {
        let error = DeliveryError::from(SendFailure::new(FailureKind::Timeout, "30s"));
        assert!(error.is_temporary());
        assert_eq!(error.failure_kind(), Some(FailureKind::Timeout));

        let error = DeliveryError::from(SendFailure::new(
            FailureKind::InvalidRecipient,
            "no such number",
        ));
        assert!(error.is_permanent());
        assert_eq!(error.to_string(), "Permanent failure: Invalid recipient: no such number");
    }

    #[test]
    fn store_not_found_becomes_query_not_found() {
        let id = MessageId::generate();
        assert!(matches!(
            QueryError::from(StoreError::NotFound(id)),
            QueryError::NotFound(found) if found == id
        ));
        assert!(matches!(
            QueryError::from(StoreError::Internal("boom".to_string())),
            QueryError::Storage(_)
        ));
    }

    #[test]
    fn exhausted_display() {
        let error = DeliveryError::ExhaustedRetries {
            attempts: 6,
            last_error: "timeout".to_string(),
        };
        assert_eq!(error.to_string(), "Exhausted retries after 6 attempts: timeout");
        assert_eq!(error.failure_kind(), None);
    }
}
