//! Audit logging for message lifecycle events
//!
//! Every event is emitted through `tracing` with an `event` field naming it,
//! so it can be routed to a dedicated sink by the subscriber.
//!
//! ## Audit Events
//!
//! - `SubmissionAccepted`: a message passed validation and was queued
//! - `DeliveryAttempt`: a send was handed to a channel
//! - `DeliverySuccess`: the message was delivered
//! - `DeliveryFailure`: the message failed terminally
//! - `MessageExpired`: the message went stale before its first attempt
//!
//! Recipients are phone numbers or e-mail addresses; both can be redacted
//! through [`AuditConfig`].

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging for message lifecycle events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact recipients from audit logs
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: OnceLock<Arc<AuditConfig>> = OnceLock::new();

/// Initialize audit logging with configuration
///
/// Only the first call has any effect.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact a recipient if redaction is enabled
///
/// E-mail addresses keep their domain, phone numbers keep their last four
/// digits.
#[must_use]
pub fn redact_recipient(recipient: &str, redact: bool) -> String {
    if !redact {
        return recipient.to_string();
    }

    if let Some((_, domain)) = recipient.split_once('@') {
        return format!("[REDACTED]@{domain}");
    }

    let digits: Vec<char> = recipient.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > 4 {
        let tail: String = digits[digits.len() - 4..].iter().collect();
        format!("[REDACTED]{tail}")
    } else {
        "[REDACTED]".to_string()
    }
}

pub fn log_submission_accepted(
    message_id: &str,
    recipient: &str,
    message_type: &str,
    priority: &str,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_recipient(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::INFO,
        event = "SubmissionAccepted",
        message_id = %message_id,
        recipient = %recipient,
        message_type = %message_type,
        priority = %priority,
        "Audit: Message accepted and queued"
    );
}

/// Log a send handed to a channel
///
/// `attempt` is the 1-based attempt number for the message.
pub fn log_delivery_attempt(message_id: &str, recipient: &str, channel: &str, attempt: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_recipient(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliveryAttempt",
        message_id = %message_id,
        recipient = %recipient,
        channel = %channel,
        delivery_attempt = attempt,
        "Audit: Delivery attempt"
    );
}

pub fn log_delivery_success(
    message_id: &str,
    recipient: &str,
    channel: &str,
    attempt: u32,
    latency_ms: u128,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_recipient(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliverySuccess",
        message_id = %message_id,
        recipient = %recipient,
        channel = %channel,
        delivery_attempt = attempt,
        latency_ms = latency_ms,
        "Audit: Delivery successful"
    );
}

/// Log a terminal failure, after a permanent error or an exhausted budget
pub fn log_delivery_failure(message_id: &str, recipient: &str, error: &str, attempt: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_recipient(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::WARN,
        event = "DeliveryFailure",
        message_id = %message_id,
        recipient = %recipient,
        error = %error,
        delivery_attempt = attempt,
        "Audit: Delivery failed"
    );
}

pub fn log_message_expired(message_id: &str, recipient: &str, overdue_secs: u64) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_recipient(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::WARN,
        event = "MessageExpired",
        message_id = %message_id,
        recipient = %recipient,
        overdue_secs = overdue_secs,
        "Audit: Message expired before delivery"
    );
}
