//! Retry policy for delivery operations.
//!
//! Decides, after a failed attempt, whether to retry on the same channel,
//! fall back to another ranked channel, or give up, and how long to wait.

use std::time::Duration;

use courier_common::{ChannelKind, FailureKind, MessageRequest};
use serde::{Deserialize, Serialize};

use super::backoff::backoff_delay;

/// What to do with a message after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RetrySameChannel {
        after: Duration,
    },
    RetryOtherChannel {
        channel: ChannelKind,
        after: Duration,
    },
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The delay is `base * 2^(attempts - 1)`, counting every attempt made
    /// on the message so far.
    ///
    /// Default: 1000 (1 second)
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum retry delay (in milliseconds).
    ///
    /// Default: 300000 (5 minutes)
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the delay added at random.
    ///
    /// Default: 0.1 (up to +10%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,

    /// Attempts allowed per channel, unless the message carries its own.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Consecutive failures on one channel before falling back to the next.
    ///
    /// Default: 2
    #[serde(default = "defaults::fallback_after")]
    pub fallback_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
            max_retries: defaults::max_retries(),
            fallback_after: defaults::fallback_after(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before the next attempt, given how many attempts were made
    #[must_use]
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        backoff_delay(
            attempt_count,
            self.base_delay(),
            self.max_delay(),
            self.jitter_factor,
        )
    }

    /// Whether `message` may still be attempted on `channel`
    #[must_use]
    pub fn has_budget(&self, message: &MessageRequest, channel: ChannelKind) -> bool {
        message.has_budget_on(channel, self.max_retries)
    }

    /// The channel a message has to move away from, if it failed there
    /// `fallback_after` times in a row
    #[must_use]
    pub fn fallback_from(&self, message: &MessageRequest) -> Option<ChannelKind> {
        message
            .last_channel_tried
            .filter(|_| message.consecutive_failures >= self.fallback_after)
    }

    /// Decide what follows a failed attempt.
    ///
    /// `message` must already include the failed attempt in its counters;
    /// `ranked` is the message's channel order.
    ///
    /// A channel that has failed fewer than `fallback_after` times in a row
    /// and still has budget is retried. Otherwise the next channel after it
    /// in `ranked` (wrapping around) with budget is used, then the same
    /// channel again if it has budget left, and failing all that the
    /// message is given up.
    #[must_use]
    pub fn next_action(
        &self,
        message: &MessageRequest,
        failure: FailureKind,
        ranked: &[ChannelKind],
    ) -> RetryAction {
        if !failure.is_transient() {
            return RetryAction::GiveUp;
        }

        let Some(current) = message.last_channel_tried else {
            return RetryAction::GiveUp;
        };

        let after = self.delay_for(message.attempt_count);
        let current_has_budget = self.has_budget(message, current);

        if message.consecutive_failures < self.fallback_after && current_has_budget {
            return RetryAction::RetrySameChannel { after };
        }

        let start = ranked
            .iter()
            .position(|channel| *channel == current)
            .map_or(0, |index| index + 1);

        let fallback = ranked
            .iter()
            .cycle()
            .skip(start)
            .take(ranked.len())
            .copied()
            .find(|channel| *channel != current && self.has_budget(message, *channel));

        match fallback {
            Some(channel) => RetryAction::RetryOtherChannel { channel, after },
            None if current_has_budget => RetryAction::RetrySameChannel { after },
            None => RetryAction::GiveUp,
        }
    }
}

mod defaults {
    pub const fn base_delay_ms() -> u64 {
        1_000
    }

    pub const fn max_delay_ms() -> u64 {
        300_000 // 5 minutes
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn fallback_after() -> u32 {
        2
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::SystemTime;

    use courier_common::{AttemptOutcome, DeliveryAttempt, MessageType, NewMessage};
    use pretty_assertions::assert_eq;

    use super::*;

    const A: ChannelKind = ChannelKind::Sms;
    const B: ChannelKind = ChannelKind::Email;

    fn message() -> MessageRequest {
        MessageRequest::new(
            NewMessage::new("+447700900123", MessageType::Alert).content("Disk full"),
            SystemTime::now(),
        )
    }

    fn fail(message: &mut MessageRequest, channel: ChannelKind) {
        let attempt = DeliveryAttempt {
            message_id: message.id,
            attempt: message.attempt_count + 1,
            channel,
            outcome: AttemptOutcome::Failed(FailureKind::Network),
            error: Some("network".to_string()),
            timestamp: SystemTime::now(),
            latency: Duration::from_millis(10),
            cost: None,
        };
        message.record_attempt(&attempt);
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms, 1_000);
        assert_eq!(policy.max_delay_ms, 300_000);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.fallback_after, 2);
        assert!((policy.jitter_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_two_channel_sequence() {
        let policy = policy();
        let ranked = [A, B];
        let mut message = message();
        let mut tried = vec![A];
        let mut channel = A;

        loop {
            fail(&mut message, channel);
            match policy.next_action(&message, FailureKind::Network, &ranked) {
                RetryAction::RetrySameChannel { .. } => {}
                RetryAction::RetryOtherChannel { channel: next, .. } => channel = next,
                RetryAction::GiveUp => break,
            }
            tried.push(channel);
        }

        assert_eq!(tried, vec![A, A, B, B, A, B]);
        assert_eq!(message.attempts_on(A), 3);
        assert_eq!(message.attempts_on(B), 3);
    }

    #[test]
    fn test_single_channel_exhausts_budget() {
        let policy = policy();
        let mut message = message();

        fail(&mut message, A);
        assert!(matches!(
            policy.next_action(&message, FailureKind::Timeout, &[A]),
            RetryAction::RetrySameChannel { .. }
        ));

        // Fallback threshold reached, but there is nowhere else to go
        fail(&mut message, A);
        assert!(matches!(
            policy.next_action(&message, FailureKind::Timeout, &[A]),
            RetryAction::RetrySameChannel { .. }
        ));

        fail(&mut message, A);
        assert_eq!(
            policy.next_action(&message, FailureKind::Timeout, &[A]),
            RetryAction::GiveUp
        );
    }

    #[test]
    fn test_permanent_failure_gives_up_immediately() {
        let policy = policy();
        let mut message = message();
        fail(&mut message, A);

        for kind in [FailureKind::InvalidRecipient, FailureKind::ContentRejected] {
            assert_eq!(policy.next_action(&message, kind, &[A, B]), RetryAction::GiveUp);
        }
    }

    #[test]
    fn test_message_budget_override() {
        let policy = policy();
        let mut message = message();
        message.max_retries = Some(1);

        fail(&mut message, A);
        assert_eq!(
            policy.next_action(&message, FailureKind::Network, &[A, B]),
            RetryAction::RetryOtherChannel {
                channel: B,
                after: Duration::from_secs(1)
            }
        );

        fail(&mut message, B);
        assert_eq!(
            policy.next_action(&message, FailureKind::Network, &[A, B]),
            RetryAction::GiveUp
        );
    }

    #[test]
    fn test_fallback_from() {
        let policy = policy();
        let mut message = message();
        assert_eq!(policy.fallback_from(&message), None);

        fail(&mut message, A);
        assert_eq!(policy.fallback_from(&message), None);

        fail(&mut message, A);
        assert_eq!(policy.fallback_from(&message), Some(A));

        fail(&mut message, B);
        assert_eq!(policy.fallback_from(&message), None);
    }

    #[test]
    fn test_delays_grow_with_attempts() {
        let policy = policy();
        let mut message = message();
        let mut delays = Vec::new();

        for _ in 0..3 {
            fail(&mut message, A);
            if let RetryAction::RetrySameChannel { after }
            | RetryAction::RetryOtherChannel { after, .. } =
                policy.next_action(&message, FailureKind::Network, &[A, B])
            {
                delays.push(after);
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }
}
