//! Batch submission from a JSON file
//!
//! A batch file is a JSON array of message objects:
//!
//! ```json
//! [
//!     {
//!         "phone_number": "+447700900123",
//!         "message_type": "alert",
//!         "content": "Your parcel has shipped",
//!         "priority": "high",
//!         "preferred_channel": "whatsapp"
//!     }
//! ]
//! ```
//!
//! Fields other than the recipient fall back to their defaults, and
//! unknown fields are ignored.

use std::path::Path;

use anyhow::Context;
use courier_common::{RawMessage, tracing::warn};
use courier_delivery::DeliveryEngine;

/// How many messages of a batch were accepted and rejected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: usize,
}

/// Read a batch file
///
/// # Errors
/// Returns an error if the file cannot be read or is not an array of
/// message objects
pub async fn load(path: &Path) -> anyhow::Result<Vec<RawMessage>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read batch from {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse batch in {}", path.display()))
}

/// Submit every message in `messages`; rejected messages are logged and
/// skipped
pub async fn submit(engine: &DeliveryEngine, messages: Vec<RawMessage>) -> BatchReport {
    let mut report = BatchReport::default();

    for (index, message) in messages.into_iter().enumerate() {
        match engine.submit_raw(message).await {
            Ok(_) => report.accepted += 1,
            Err(e) => {
                warn!(index, error = %e, "Rejected batch message");
                report.rejected += 1;
            }
        }
    }

    report
}
