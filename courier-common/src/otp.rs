use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// The single active one-time code for a recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpCode {
    pub recipient: String,
    pub code: String,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
    pub consumed: bool,
    pub message_id: Option<MessageId>,
}

impl OtpCode {
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }
}
