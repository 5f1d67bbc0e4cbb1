use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{attempt::DeliveryAttempt, channel::ChannelKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Invalid message id: {0}")]
    InvalidId(String),
}

/// Identifier for a submitted message
///
/// A ULID, so ids sort by submission time and double as file names in the
/// file-backed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Parse an id from a file name such as `01ARZ3NDEKTSV4RRFFQ69G5FAV.bin`
    ///
    /// Anything containing a path separator or `..` is rejected.
    #[must_use]
    pub fn from_filename(filename: &str, extension: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(extension)?.strip_suffix('.')?;
        stem.parse().ok()
    }

    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for MessageId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s)
            .map(Self::new)
            .map_err(|_| ParseError::InvalidId(s.to_string()))
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Otp,
    Alert,
    Notification,
    Reminder,
}

impl MessageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Otp => "otp",
            Self::Alert => "alert",
            Self::Notification => "notification",
            Self::Reminder => "reminder",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otp" => Ok(Self::Otp),
            "alert" => Ok(Self::Alert),
            "notification" => Ok(Self::Notification),
            "reminder" => Ok(Self::Reminder),
            other => Err(ParseError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Delivery priority
///
/// Ordering follows [`Priority::rank`], so `Critical` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(ParseError::UnknownPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Delivered,
        Self::Failed,
        Self::Expired,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Expired)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery request as handed to the engine, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub recipient: String,
    pub message_type: MessageType,
    pub content: String,
    pub priority: Priority,
    pub preferred_channel: Option<ChannelKind>,
    pub scheduled_for: Option<SystemTime>,
    pub max_retries: Option<u32>,
    pub user_id: Option<String>,
}

impl NewMessage {
    #[must_use]
    pub fn new(recipient: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            recipient: recipient.into(),
            message_type,
            content: String::new(),
            priority: Priority::default(),
            preferred_channel: None,
            scheduled_for: None,
            max_retries: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn preferred_channel(mut self, channel: ChannelKind) -> Self {
        self.preferred_channel = Some(channel);
        self
    }

    #[must_use]
    pub const fn scheduled_for(mut self, at: SystemTime) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A delivery request in its loosely typed external form, as found in batch
/// files. Enumerated fields are plain strings and only checked on conversion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawMessage {
    #[serde(alias = "phone_number")]
    pub recipient: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub preferred_channel: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_message_type() -> String {
    MessageType::Notification.as_str().to_string()
}

fn default_priority() -> String {
    Priority::Medium.as_str().to_string()
}

impl TryFrom<RawMessage> for NewMessage {
    type Error = ParseError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            recipient: raw.recipient,
            message_type: raw.message_type.parse()?,
            content: raw.content,
            priority: raw.priority.parse()?,
            preferred_channel: raw
                .preferred_channel
                .filter(|channel| !channel.trim().is_empty())
                .map(|channel| channel.parse())
                .transpose()?,
            scheduled_for: raw.scheduled_for.map(SystemTime::from),
            max_retries: raw.max_retries,
            user_id: raw.user_id.filter(|user| !user.is_empty()),
        })
    }
}

/// A message and its delivery lifecycle.
///
/// Everything but the lifecycle fields is fixed once the message is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub id: MessageId,
    pub recipient: String,
    pub message_type: MessageType,
    pub content: String,
    pub priority: Priority,
    pub preferred_channel: Option<ChannelKind>,
    pub scheduled_for: SystemTime,
    pub max_retries: Option<u32>,
    pub user_id: Option<String>,
    pub created_at: SystemTime,

    pub status: MessageStatus,
    pub attempt_count: u32,
    pub last_channel_tried: Option<ChannelKind>,
    pub updated_at: SystemTime,
    pub last_error: Option<String>,
    pub channel_attempts: BTreeMap<ChannelKind, u32>,
    pub consecutive_failures: u32,
    pub next_channel: Option<ChannelKind>,
    pub delivered_at: Option<SystemTime>,
}

impl MessageRequest {
    /// Build a fresh pending request with a newly generated id
    #[must_use]
    pub fn new(message: NewMessage, now: SystemTime) -> Self {
        Self {
            id: MessageId::generate(),
            recipient: message.recipient,
            message_type: message.message_type,
            content: message.content,
            priority: message.priority,
            preferred_channel: message.preferred_channel,
            scheduled_for: message.scheduled_for.unwrap_or(now),
            max_retries: message.max_retries,
            user_id: message.user_id,
            created_at: now,
            status: MessageStatus::Pending,
            attempt_count: 0,
            last_channel_tried: None,
            updated_at: now,
            last_error: None,
            channel_attempts: BTreeMap::new(),
            consecutive_failures: 0,
            next_channel: None,
            delivered_at: None,
        }
    }

    /// Attempts already made on `channel`
    #[must_use]
    pub fn attempts_on(&self, channel: ChannelKind) -> u32 {
        self.channel_attempts.get(&channel).copied().unwrap_or(0)
    }

    /// Per-channel attempt budget, using `default` unless the message carries its own
    #[must_use]
    pub fn retry_budget(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    #[must_use]
    pub fn has_budget_on(&self, channel: ChannelKind, default: u32) -> bool {
        self.attempts_on(channel) < self.retry_budget(default)
    }

    /// Age of the scheduled time relative to `now`, zero if it lies ahead
    #[must_use]
    pub fn overdue_by(&self, now: SystemTime) -> Duration {
        now.duration_since(self.scheduled_for).unwrap_or_default()
    }

    /// Fold a logged attempt into the per-channel counters.
    pub fn record_attempt(&mut self, attempt: &DeliveryAttempt) {
        self.attempt_count = self.attempt_count.max(attempt.attempt);
        *self.channel_attempts.entry(attempt.channel).or_default() += 1;

        if attempt.outcome.is_delivered() {
            self.consecutive_failures = 0;
            self.last_error = None;
        } else {
            self.consecutive_failures = if self.last_channel_tried == Some(attempt.channel) {
                self.consecutive_failures + 1
            } else {
                1
            };
            self.last_error.clone_from(&attempt.error);
        }

        self.last_channel_tried = Some(attempt.channel);
        self.updated_at = attempt.timestamp;
    }

    /// Rebuild the counters from the full attempt log.
    pub fn replay_attempts(&mut self, attempts: &[DeliveryAttempt]) {
        self.attempt_count = 0;
        self.channel_attempts.clear();
        self.consecutive_failures = 0;
        self.last_channel_tried = None;

        for attempt in attempts {
            self.record_attempt(attempt);
        }
    }
}
