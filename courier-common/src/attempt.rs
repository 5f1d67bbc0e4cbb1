use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

use crate::{channel::ChannelKind, message::MessageId};

/// Why a send failed, as reported by a channel sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    RateLimited,
    ProviderUnavailable,
    InvalidRecipient,
    ContentRejected,
}

impl FailureKind {
    /// Transient failures are worth retrying, permanent ones never are
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::RateLimited | Self::ProviderUnavailable
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::InvalidRecipient => "invalid_recipient",
            Self::ContentRejected => "content_rejected",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    Failed(FailureKind),
}

impl AttemptOutcome {
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }

    #[must_use]
    pub const fn failure(self) -> Option<FailureKind> {
        match self {
            Self::Delivered => None,
            Self::Failed(kind) => Some(kind),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Failed(kind) if kind.is_transient() => write!(f, "transient failure ({kind})"),
            Self::Failed(kind) => write!(f, "permanent failure ({kind})"),
        }
    }
}

/// One row of the append-only attempt log
///
/// `attempt` is 1-based and unique per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub attempt: u32,
    pub channel: ChannelKind,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub timestamp: SystemTime,
    pub latency: Duration,
    pub cost: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::RateLimited.is_transient());
        assert!(!FailureKind::InvalidRecipient.is_transient());
        assert!(!FailureKind::ContentRejected.is_transient());
    }

    #[test]
    fn outcome_display() {
        assert_eq!(AttemptOutcome::Delivered.to_string(), "delivered");
        assert_eq!(
            AttemptOutcome::Failed(FailureKind::Network).to_string(),
            "transient failure (network)"
        );
        assert_eq!(
            AttemptOutcome::Failed(FailureKind::ContentRejected).to_string(),
            "permanent failure (content_rejected)"
        );
    }
}
