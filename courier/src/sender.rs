//! Simulated channel providers
//!
//! No real SMS, WhatsApp, voice or e-mail gateway is wired in. Each channel
//! is stood in for by a [`SimulatedSender`] that takes a random amount of
//! time and succeeds with a fixed probability.

use std::{collections::HashMap, ops::RangeInclusive, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{ChannelKind, FailureKind, outgoing};
use courier_delivery::{ChannelSender, ChannelsConfig, SendFailure, SendReceipt};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct SimulatedSender {
    channel: ChannelKind,
    success_rate: f64,
    latency_ms: RangeInclusive<u64>,
}

impl SimulatedSender {
    /// `success_rate` is clamped to `[0, 1]`
    #[must_use]
    pub fn new(channel: ChannelKind, success_rate: f64, latency_ms: RangeInclusive<u64>) -> Self {
        Self {
            channel,
            success_rate: success_rate.clamp(0.0, 1.0),
            latency_ms,
        }
    }

    /// The provider profile used when nothing else is configured
    #[must_use]
    pub fn for_channel(channel: ChannelKind) -> Self {
        let success_rate = match channel {
            ChannelKind::Voice => 0.98,
            ChannelKind::Sms => 0.95,
            ChannelKind::WhatsApp => 0.90,
            ChannelKind::Email => 0.85,
        };

        Self::new(channel, success_rate, 100..=500)
    }

    #[must_use]
    pub const fn success_rate(&self) -> f64 {
        self.success_rate
    }
}

#[async_trait]
impl ChannelSender for SimulatedSender {
    async fn send(&self, recipient: &str, _content: &str) -> Result<SendReceipt, SendFailure> {
        let (latency, delivered) = {
            let mut rng = rand::rng();
            let latency = if self.latency_ms.is_empty() {
                0
            } else {
                rng.random_range(self.latency_ms.clone())
            };
            (
                Duration::from_millis(latency),
                rng.random_bool(self.success_rate),
            )
        };

        tokio::time::sleep(latency).await;

        outgoing!(
            level = DEBUG,
            "[SIMULATION] {} to {recipient}: {}",
            self.channel,
            if delivered { "delivered" } else { "failed" }
        );

        if delivered {
            Ok(SendReceipt {
                cost: None,
                latency: Some(latency),
            })
        } else {
            Err(SendFailure::new(
                FailureKind::ProviderUnavailable,
                format!("simulated {} provider failure", self.channel),
            ))
        }
    }
}

/// A simulated sender for every configured channel
#[must_use]
pub fn simulated_senders(
    channels: &ChannelsConfig,
) -> HashMap<ChannelKind, Arc<dyn ChannelSender>> {
    channels
        .configured()
        .map(|(kind, _)| {
            (
                kind,
                Arc::new(SimulatedSender::for_channel(kind)) as Arc<dyn ChannelSender>,
            )
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn certain_outcomes() {
        let always = SimulatedSender::new(ChannelKind::Sms, 1.0, 0..=0);
        let receipt = always.send("+447700900123", "hello").await.unwrap();
        assert_eq!(receipt.latency, Some(Duration::ZERO));

        let never = SimulatedSender::new(ChannelKind::Email, 0.0, 0..=0);
        let failure = never.send("a@example.com", "hello").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ProviderUnavailable);
        assert!(failure.kind.is_transient());
    }

    #[test]
    fn rate_is_clamped() {
        let high = SimulatedSender::new(ChannelKind::Voice, 1.5, 0..=0);
        assert!((high.success_rate() - 1.0).abs() < f64::EPSILON);

        let low = SimulatedSender::new(ChannelKind::Voice, -0.5, 0..=0);
        assert!(low.success_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn one_sender_per_configured_channel() {
        let mut channels = ChannelsConfig::default();
        channels.voice = None;

        let senders = simulated_senders(&channels);
        assert!(!senders.contains_key(&ChannelKind::Voice));
        assert_eq!(senders.len(), channels.configured().count());
    }
}
