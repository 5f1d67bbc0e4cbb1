use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::message::ParseError;

/// A transport a message can be sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Voice,
    Sms,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Email,
}

impl ChannelKind {
    pub const ALL: [Self; 4] = [Self::Voice, Self::Sms, Self::WhatsApp, Self::Email];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Sms => "sms",
            Self::WhatsApp => "whatsapp",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voice" | "call" => Ok(Self::Voice),
            "sms" => Ok(Self::Sms),
            "whatsapp" => Ok(Self::WhatsApp),
            "email" => Ok(Self::Email),
            other => Err(ParseError::UnknownChannel(other.to_string())),
        }
    }
}
