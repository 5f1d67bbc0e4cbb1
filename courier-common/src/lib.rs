//! Types shared by every courier crate: the message model, the attempt log
//! entries, one-time codes, logging setup and audit events.

pub mod attempt;
pub mod audit;
pub mod channel;
pub mod logging;
pub mod message;
pub mod otp;

pub use attempt::{AttemptOutcome, DeliveryAttempt, FailureKind};
pub use channel::ChannelKind;
pub use message::{
    MessageId, MessageRequest, MessageStatus, MessageType, NewMessage, ParseError, Priority,
    RawMessage,
};
pub use otp::OtpCode;
pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
