//! Delivery engine configuration
//!
//! ```ron
//! delivery: (
//!     channels: (voice: None),
//!     routing: (critical: sms),
//!     retry: (max_retries: 5),
//!     dispatcher: (workers: 8),
//! )
//! ```

use courier_common::Priority;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelsConfig, RoutingTable},
    error::ConfigError,
    otp::OtpConfig,
    policy::RetryPolicy,
    processor::DispatcherConfig,
    rate_limiter::RateLimitConfig,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub routing: RoutingTable,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub otp: OtpConfig,
}

impl DeliveryConfig {
    /// Check the configuration is usable
    ///
    /// # Errors
    /// Returns the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut configured = self.channels.configured().peekable();
        if configured.peek().is_none() {
            return Err(ConfigError::NoChannels);
        }

        for (kind, channel) in configured {
            if channel.rate_limit_per_minute == 0 {
                return Err(ConfigError::InvalidRateLimit(kind));
            }

            if !channel.cost_per_message.is_finite() || channel.cost_per_message < 0.0 {
                return Err(ConfigError::InvalidCost(kind));
            }
        }

        for priority in Priority::ALL {
            let channel = self.routing.for_priority(priority);
            if self.channels.get(channel).is_none() {
                return Err(ConfigError::UnroutableTier { priority, channel });
            }
        }

        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must be at least 1"));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(invalid("retry.jitter_factor", "must be between 0.0 and 1.0"));
        }

        if self.dispatcher.workers == 0 {
            return Err(invalid("dispatcher.workers", "must be at least 1"));
        }

        if self.dispatcher.send_timeout_ms == 0 {
            return Err(invalid("dispatcher.send_timeout_ms", "must be at least 1"));
        }

        if self.rate_limit.window_secs == 0 {
            return Err(invalid("rate_limit.window_secs", "must be at least 1"));
        }

        if self.otp.ttl_secs == 0 {
            return Err(invalid("otp.ttl_secs", "must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use courier_common::ChannelKind;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(DeliveryConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_no_channels() {
        let config: DeliveryConfig =
            ron::from_str("(channels: (voice: None, sms: None, whatsapp: None, email: None))")
                .unwrap();
        assert_eq!(config.validate(), Err(ConfigError::NoChannels));
    }

    #[test]
    fn test_routing_must_name_configured_channel() {
        let config: DeliveryConfig = ron::from_str("(channels: (voice: None))").unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnroutableTier {
                priority: Priority::Critical,
                channel: ChannelKind::Voice
            })
        );

        let rerouted: DeliveryConfig =
            ron::from_str("(channels: (voice: None), routing: (critical: sms))").unwrap();
        assert_eq!(rerouted.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_zero_rate_limit_and_negative_cost() {
        let mut config = DeliveryConfig::default();
        config.channels.sms.as_mut().unwrap().rate_limit_per_minute = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRateLimit(ChannelKind::Sms))
        );

        let mut config = DeliveryConfig::default();
        config.channels.email.as_mut().unwrap().cost_per_message = -0.01;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCost(ChannelKind::Email))
        );
    }

    #[test]
    fn test_rejects_bad_retry_policy() {
        let config: DeliveryConfig =
            ron::from_str("(retry: (base_delay_ms: 10000, max_delay_ms: 1000))").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "retry.base_delay_ms",
                ..
            })
        ));

        let config: DeliveryConfig = ron::from_str("(retry: (jitter_factor: 1.5))").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: DeliveryConfig =
            ron::from_str("(dispatcher: (workers: 8), otp: (ttl_secs: 120))").unwrap();
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.dispatcher.send_timeout_ms, 30_000);
        assert_eq!(config.otp.ttl_secs, 120);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
