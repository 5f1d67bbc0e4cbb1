//! Channel senders and their configuration
//!
//! A channel is a transport (voice, SMS, WhatsApp, e-mail) reached through a
//! [`ChannelSender`]. Providers live outside the engine; it only sees the
//! outcome of each send.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{ChannelKind, FailureKind, Priority};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a successful send reports back
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SendReceipt {
    /// Provider-reported cost; the channel's configured cost is used when absent
    pub cost: Option<f64>,
    /// Provider-reported latency; the measured wall time is used when absent
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct SendFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl SendFailure {
    #[must_use]
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }
}

/// Capability to push one message to one recipient over a transport
#[async_trait]
pub trait ChannelSender: Send + Sync + fmt::Debug {
    async fn send(&self, recipient: &str, content: &str) -> Result<SendReceipt, SendFailure>;
}

/// Static properties of a configured channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Lower is more reliable
    pub reliability_rank: u32,
    pub cost_per_message: f64,
    pub rate_limit_per_minute: u32,
}

/// A configured channel, ready to send
#[derive(Debug, Clone)]
pub struct Channel {
    pub kind: ChannelKind,
    pub config: ChannelConfig,
    pub sender: Arc<dyn ChannelSender>,
}

/// Per-channel configuration
///
/// A channel set to `None` is not offered at all.
///
/// ```ron
/// channels: (
///     voice: None,
///     sms: Some((reliability_rank: 1, cost_per_message: 0.05, rate_limit_per_minute: 100)),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "defaults::voice")]
    pub voice: Option<ChannelConfig>,

    #[serde(default = "defaults::sms")]
    pub sms: Option<ChannelConfig>,

    #[serde(default = "defaults::whatsapp")]
    pub whatsapp: Option<ChannelConfig>,

    #[serde(default = "defaults::email")]
    pub email: Option<ChannelConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            voice: defaults::voice(),
            sms: defaults::sms(),
            whatsapp: defaults::whatsapp(),
            email: defaults::email(),
        }
    }
}

impl ChannelsConfig {
    #[must_use]
    pub const fn get(&self, kind: ChannelKind) -> Option<&ChannelConfig> {
        match kind {
            ChannelKind::Voice => self.voice.as_ref(),
            ChannelKind::Sms => self.sms.as_ref(),
            ChannelKind::WhatsApp => self.whatsapp.as_ref(),
            ChannelKind::Email => self.email.as_ref(),
        }
    }

    /// Configured channels, in declaration order
    pub fn configured(&self) -> impl Iterator<Item = (ChannelKind, &ChannelConfig)> {
        ChannelKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|config| (kind, config)))
    }
}

/// Default channel for each priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default = "defaults::critical")]
    pub critical: ChannelKind,

    #[serde(default = "defaults::high")]
    pub high: ChannelKind,

    #[serde(default = "defaults::medium")]
    pub medium: ChannelKind,

    #[serde(default = "defaults::low")]
    pub low: ChannelKind,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            critical: defaults::critical(),
            high: defaults::high(),
            medium: defaults::medium(),
            low: defaults::low(),
        }
    }
}

impl RoutingTable {
    #[must_use]
    pub const fn for_priority(&self, priority: Priority) -> ChannelKind {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

mod defaults {
    use courier_common::ChannelKind;

    use super::ChannelConfig;

    #[allow(clippy::unnecessary_wraps)]
    pub const fn voice() -> Option<ChannelConfig> {
        Some(ChannelConfig {
            reliability_rank: 0,
            cost_per_message: 0.15,
            rate_limit_per_minute: 50,
        })
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn sms() -> Option<ChannelConfig> {
        Some(ChannelConfig {
            reliability_rank: 1,
            cost_per_message: 0.05,
            rate_limit_per_minute: 100,
        })
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn whatsapp() -> Option<ChannelConfig> {
        Some(ChannelConfig {
            reliability_rank: 2,
            cost_per_message: 0.03,
            rate_limit_per_minute: 80,
        })
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn email() -> Option<ChannelConfig> {
        Some(ChannelConfig {
            reliability_rank: 3,
            cost_per_message: 0.01,
            rate_limit_per_minute: 200,
        })
    }

    pub const fn critical() -> ChannelKind {
        ChannelKind::Voice
    }

    pub const fn high() -> ChannelKind {
        ChannelKind::Sms
    }

    pub const fn medium() -> ChannelKind {
        ChannelKind::WhatsApp
    }

    pub const fn low() -> ChannelKind {
        ChannelKind::Email
    }
}
