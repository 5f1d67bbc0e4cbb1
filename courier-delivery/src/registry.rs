//! Configured channels and the order in which a message tries them

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use courier_common::{ChannelKind, MessageRequest, tracing};

use crate::{
    channel::{Channel, ChannelSender, ChannelsConfig, RoutingTable},
    error::ConfigError,
    rate_limiter::RateLimiter,
};

#[derive(Debug)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelKind, Channel>,
    routing: RoutingTable,
    limiter: Arc<RateLimiter>,
}

impl ChannelRegistry {
    /// Bind every configured channel to its sender
    ///
    /// Senders for channels that are not configured are ignored.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingSender`] if a configured channel has no sender
    pub fn new(
        config: &ChannelsConfig,
        routing: RoutingTable,
        mut senders: HashMap<ChannelKind, Arc<dyn ChannelSender>>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ConfigError> {
        let mut channels = BTreeMap::new();

        for (kind, channel_config) in config.configured() {
            let sender = senders
                .remove(&kind)
                .ok_or(ConfigError::MissingSender(kind))?;

            channels.insert(
                kind,
                Channel {
                    kind,
                    config: *channel_config,
                    sender,
                },
            );
        }

        if channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        for kind in senders.keys() {
            tracing::debug!(channel = %kind, "Ignoring sender for unconfigured channel");
        }

        Ok(Self {
            channels,
            routing,
            limiter,
        })
    }

    #[must_use]
    pub fn is_configured(&self, kind: ChannelKind) -> bool {
        self.channels.contains_key(&kind)
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Configured channels by (reliability rank, cost)
    fn by_rank(&self) -> Vec<&Channel> {
        let mut channels: Vec<_> = self.channels.values().collect();
        channels.sort_by(|a, b| {
            a.config
                .reliability_rank
                .cmp(&b.config.reliability_rank)
                .then(a.config.cost_per_message.total_cmp(&b.config.cost_per_message))
        });
        channels
    }

    /// The message's full channel order, ignoring rate limits
    ///
    /// The preferred channel leads when configured, otherwise the priority
    /// tier's default; the rest follow by rank then cost. This is the order
    /// the retry policy falls back through.
    #[must_use]
    pub fn ranked_channels(&self, request: &MessageRequest) -> Vec<ChannelKind> {
        let leader = request
            .preferred_channel
            .filter(|kind| self.is_configured(*kind))
            .or_else(|| {
                Some(self.routing.for_priority(request.priority))
                    .filter(|kind| self.is_configured(*kind))
            });

        leader
            .into_iter()
            .chain(
                self.by_rank()
                    .into_iter()
                    .map(|channel| channel.kind)
                    .filter(|kind| Some(*kind) != leader),
            )
            .collect()
    }

    /// Channels that may be tried right now, in order
    ///
    /// A channel chosen by the retry policy, or else the preferred channel,
    /// leads when it is configured and not saturated. Failing that the
    /// tier's default leads. Saturated channels are left out entirely.
    #[must_use]
    pub fn eligible_channels(&self, request: &MessageRequest) -> Vec<Channel> {
        let usable = |kind: ChannelKind| {
            self.is_configured(kind) && !self.limiter.is_saturated(kind)
        };

        let leader = request
            .next_channel
            .or(request.preferred_channel)
            .filter(|kind| usable(*kind))
            .or_else(|| {
                Some(self.routing.for_priority(request.priority)).filter(|kind| usable(*kind))
            });

        let leading = leader.and_then(|kind| self.channels.get(&kind));

        leading
            .into_iter()
            .chain(
                self.by_rank()
                    .into_iter()
                    .filter(|channel| Some(channel.kind) != leader && usable(channel.kind)),
            )
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::SystemTime;

    use async_trait::async_trait;
    use courier_common::{MessageType, NewMessage, Priority};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        channel::{SendFailure, SendReceipt},
        rate_limiter::RateLimitConfig,
    };

    #[derive(Debug)]
    struct NullSender;

    #[async_trait]
    impl ChannelSender for NullSender {
        async fn send(&self, _: &str, _: &str) -> Result<SendReceipt, SendFailure> {
            Ok(SendReceipt::default())
        }
    }

    fn senders() -> HashMap<ChannelKind, Arc<dyn ChannelSender>> {
        ChannelKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(NullSender) as Arc<dyn ChannelSender>))
            .collect()
    }

    fn registry(config: &ChannelsConfig) -> ChannelRegistry {
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig::default(),
            config
                .configured()
                .map(|(kind, c)| (kind, c.rate_limit_per_minute)),
        ));
        ChannelRegistry::new(config, RoutingTable::default(), senders(), limiter).unwrap()
    }

    fn request(priority: Priority) -> MessageRequest {
        MessageRequest::new(
            NewMessage::new("+447700900123", MessageType::Alert)
                .content("x")
                .priority(priority),
            SystemTime::now(),
        )
    }

    fn kinds(channels: &[Channel]) -> Vec<ChannelKind> {
        channels.iter().map(|c| c.kind).collect()
    }

    #[test]
    fn test_tier_default_leads() {
        let registry = registry(&ChannelsConfig::default());

        assert_eq!(
            kinds(&registry.eligible_channels(&request(Priority::Medium))),
            vec![
                ChannelKind::WhatsApp,
                ChannelKind::Voice,
                ChannelKind::Sms,
                ChannelKind::Email
            ]
        );
        assert_eq!(
            registry.ranked_channels(&request(Priority::Low)),
            vec![
                ChannelKind::Email,
                ChannelKind::Voice,
                ChannelKind::Sms,
                ChannelKind::WhatsApp
            ]
        );
    }

    #[test]
    fn test_preferred_channel_leads() {
        let registry = registry(&ChannelsConfig::default());
        let mut r = request(Priority::Critical);
        r.preferred_channel = Some(ChannelKind::Email);

        assert_eq!(
            kinds(&registry.eligible_channels(&r)),
            vec![
                ChannelKind::Email,
                ChannelKind::Voice,
                ChannelKind::Sms,
                ChannelKind::WhatsApp
            ]
        );
    }

    #[test]
    fn test_saturated_channels_are_excluded() {
        let mut config = ChannelsConfig::default();
        config.email.as_mut().unwrap().rate_limit_per_minute = 1;
        let registry = registry(&config);

        let mut r = request(Priority::Low);
        r.preferred_channel = Some(ChannelKind::Email);
        assert!(registry.limiter().try_admit(ChannelKind::Email));

        let eligible = kinds(&registry.eligible_channels(&r));
        assert!(!eligible.contains(&ChannelKind::Email));
        assert_eq!(eligible[0], ChannelKind::Voice);

        // Ranking ignores rate limits
        assert_eq!(registry.ranked_channels(&r)[0], ChannelKind::Email);
    }

    #[test]
    fn test_cost_breaks_rank_ties() {
        let mut config = ChannelsConfig::default();
        config.voice = None;
        config.whatsapp.as_mut().unwrap().reliability_rank = 1;
        let registry = registry(&config);

        let mut r = request(Priority::Low);
        r.preferred_channel = Some(ChannelKind::Email);

        assert_eq!(
            registry.ranked_channels(&r),
            vec![ChannelKind::Email, ChannelKind::WhatsApp, ChannelKind::Sms]
        );
    }

    #[test]
    fn test_unconfigured_tier_default_falls_back_to_rank() {
        let mut config = ChannelsConfig::default();
        config.voice = None;
        let registry = registry(&config);

        assert_eq!(
            registry.ranked_channels(&request(Priority::Critical)),
            vec![ChannelKind::Sms, ChannelKind::WhatsApp, ChannelKind::Email]
        );
    }

    #[test]
    fn test_missing_sender() {
        let config = ChannelsConfig::default();
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default(), []));
        let mut senders = senders();
        senders.remove(&ChannelKind::Sms);

        let err = ChannelRegistry::new(&config, RoutingTable::default(), senders, limiter)
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingSender(ChannelKind::Sms));
    }
}
