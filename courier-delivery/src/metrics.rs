//! Read-only delivery statistics derived from the store

use std::{collections::BTreeMap, time::Duration};

use courier_common::{ChannelKind, DeliveryAttempt, MessageRequest, MessageStatus};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelMetrics {
    pub successes: u64,
    pub failures: u64,
    pub total_cost: f64,
    pub average_latency: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub queue_depth: usize,
    pub channels: BTreeMap<ChannelKind, ChannelMetrics>,
    /// Mean latency over every logged attempt
    pub average_latency: Duration,
    pub status_counts: BTreeMap<MessageStatus, usize>,
    /// Delivered messages over all messages; zero when there are none
    pub success_rate: f64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn from_records(
        queue_depth: usize,
        messages: &[MessageRequest],
        attempts: &[DeliveryAttempt],
    ) -> Self {
        let mut channels: BTreeMap<ChannelKind, ChannelMetrics> = BTreeMap::new();
        let mut latency_totals: BTreeMap<ChannelKind, Duration> = BTreeMap::new();
        let mut total_latency = Duration::ZERO;

        for attempt in attempts {
            let metrics = channels.entry(attempt.channel).or_default();
            if attempt.outcome.is_delivered() {
                metrics.successes += 1;
            } else {
                metrics.failures += 1;
            }
            metrics.total_cost += attempt.cost.unwrap_or_default();

            *latency_totals.entry(attempt.channel).or_default() += attempt.latency;
            total_latency += attempt.latency;
        }

        for (channel, metrics) in &mut channels {
            let count = metrics.successes + metrics.failures;
            metrics.average_latency = mean(latency_totals[channel], count);
        }

        let mut status_counts: BTreeMap<MessageStatus, usize> =
            MessageStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for message in messages {
            *status_counts.entry(message.status).or_default() += 1;
        }

        let delivered = status_counts
            .get(&MessageStatus::Delivered)
            .copied()
            .unwrap_or_default();

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if messages.is_empty() {
            0.0
        } else {
            delivered as f64 / messages.len() as f64
        };

        Self {
            queue_depth,
            channels,
            average_latency: mean(total_latency, attempts.len() as u64),
            status_counts,
            success_rate,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }

    u32::try_from(count).map_or_else(
        |_| Duration::from_secs_f64(total.as_secs_f64() / count as f64),
        |count| total / count,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::SystemTime;

    use courier_common::{AttemptOutcome, FailureKind, MessageType, NewMessage};
    use pretty_assertions::assert_eq;

    use super::*;

    fn attempt(
        message: &MessageRequest,
        channel: ChannelKind,
        outcome: AttemptOutcome,
        latency_ms: u64,
        cost: Option<f64>,
    ) -> DeliveryAttempt {
        DeliveryAttempt {
            message_id: message.id,
            attempt: 1,
            channel,
            outcome,
            error: None,
            timestamp: SystemTime::now(),
            latency: Duration::from_millis(latency_ms),
            cost,
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricsSnapshot::from_records(0, &[], &[]);
        assert!(snapshot.success_rate.abs() < f64::EPSILON);
        assert_eq!(snapshot.average_latency, Duration::ZERO);
        assert!(snapshot.channels.is_empty());
        assert_eq!(snapshot.status_counts.len(), MessageStatus::ALL.len());
    }

    #[test]
    fn test_snapshot_aggregates() {
        let now = SystemTime::now();
        let mut delivered =
            MessageRequest::new(NewMessage::new("a", MessageType::Alert).content("x"), now);
        delivered.status = MessageStatus::Delivered;
        let mut failed =
            MessageRequest::new(NewMessage::new("b", MessageType::Alert).content("x"), now);
        failed.status = MessageStatus::Failed;

        let attempts = vec![
            attempt(
                &delivered,
                ChannelKind::Sms,
                AttemptOutcome::Failed(FailureKind::Network),
                100,
                None,
            ),
            attempt(&delivered, ChannelKind::Sms, AttemptOutcome::Delivered, 300, Some(0.05)),
            attempt(
                &failed,
                ChannelKind::Email,
                AttemptOutcome::Failed(FailureKind::InvalidRecipient),
                200,
                None,
            ),
        ];

        let snapshot = MetricsSnapshot::from_records(3, &[delivered, failed], &attempts);

        assert_eq!(snapshot.queue_depth, 3);
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.average_latency, Duration::from_millis(200));

        let sms = &snapshot.channels[&ChannelKind::Sms];
        assert_eq!((sms.successes, sms.failures), (1, 1));
        assert_eq!(sms.average_latency, Duration::from_millis(200));
        assert!((sms.total_cost - 0.05).abs() < f64::EPSILON);

        let email = &snapshot.channels[&ChannelKind::Email];
        assert_eq!((email.successes, email.failures), (0, 1));

        assert_eq!(snapshot.status_counts[&MessageStatus::Delivered], 1);
        assert_eq!(snapshot.status_counts[&MessageStatus::Failed], 1);
        assert_eq!(snapshot.status_counts[&MessageStatus::Pending], 0);
    }
}
