//! Priority-aware, multi-channel message delivery
//!
//! This crate provides:
//! - A priority queue of pending messages with lazy scheduling
//! - Channel selection with per-channel sliding-window rate limits
//! - Retries with exponential backoff and fallback across channels
//! - A pool of dispatcher workers and startup recovery
//! - One-time code issuance and verification

mod channel;
mod config;
mod error;
mod metrics;
mod otp;
pub mod policy;
mod processor;
pub mod queue;
mod rate_limiter;
mod registry;
mod service;

pub use channel::{
    Channel, ChannelConfig, ChannelSender, ChannelsConfig, RoutingTable, SendFailure, SendReceipt,
};
pub use config::DeliveryConfig;
pub use error::{
    ConfigError, DeliveryError, PermanentError, QueryError, SubmitError, SystemError,
    TemporaryError,
};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use otp::{IssuedCode, OtpConfig, OtpFailure, OtpVerifier, render_otp_content};
pub use policy::{RetryAction, RetryPolicy};
pub use processor::{DeliveryEvent, Dispatcher, DispatcherConfig, RecoveryReport};
pub use queue::PriorityQueue;
pub use rate_limiter::{RateLimitConfig, RateLimitStats, RateLimiter};
pub use registry::ChannelRegistry;
pub use service::{CANCELLED, DeliveryEngine, PurgeReport};
