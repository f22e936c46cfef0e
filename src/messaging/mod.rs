//! Messaging Module - Custom Message Channel
//!
//! Zehn unabhängige Kommando-Streams über die Raum-Verbindung:
//! - Sendeseitiges Rate Limiting (Nachrichten und Bytes pro Sekunde)
//! - Zuverlässige Zustellung mit Retransmits innerhalb eines Retry-Fensters
//! - Geordnete Zustellung mit begrenztem Reorder-Puffer

mod channel;
mod limiter;
mod receiver;
mod sender;

pub use channel::{ChannelStats, ChannelTick, CustomMessageChannel, CMD_ID_RANGE};
pub use limiter::SendRateLimiter;
pub use receiver::{Delivery, MessageReceiver};
pub use sender::{ReliableSender, SenderPoll};

use crate::error::codes;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("Command id {0} outside of 1..=10")]
    InvalidCmdId(u32),

    #[error("Payload of {size} bytes exceeds {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("reliable={reliable} and ordered={ordered} must be equal")]
    FlagMismatch { reliable: bool, ordered: bool },

    #[error("Send rate limit reached")]
    RateLimited,

    #[error("Too many unacknowledged reliable messages")]
    QueueFull,
}

impl MessageError {
    pub fn code(&self) -> i32 {
        match self {
            MessageError::InvalidCmdId(_) => codes::ERR_CUSTOM_MSG_CMD_ID,
            MessageError::PayloadTooLarge { .. } => codes::ERR_CUSTOM_MSG_TOO_LARGE,
            MessageError::FlagMismatch { .. } => codes::ERR_CUSTOM_MSG_FLAGS,
            MessageError::RateLimited => codes::ERR_CUSTOM_MSG_RATE_LIMITED,
            MessageError::QueueFull => codes::ERR_CUSTOM_MSG_QUEUE_FULL,
        }
    }
}
