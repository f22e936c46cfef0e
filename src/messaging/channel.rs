//! Custom Message Channel
//!
//! Bündelt Validierung, Rate Limiting, Retransmits und Reorder-Puffer.
//! Die Zeit wird immer von außen übergeben.

use super::limiter::SendRateLimiter;
use super::receiver::{Delivery, MessageReceiver};
use super::sender::ReliableSender;
use super::MessageError;
use crate::config::MessageChannelConfig;
use crate::signaling::ClientMessage;
use std::time::Instant;

/// Gültige Kommando-Ids
pub const CMD_ID_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// Ergebnis eines Timer-Ticks
#[derive(Debug, Default)]
pub struct ChannelTick {
    pub resend: Vec<ClientMessage>,
    pub expired: Vec<(u32, u32)>,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub rejected: u64,
    pub received: u64,
    pub retransmitted: u64,
}

#[derive(Debug)]
pub struct CustomMessageChannel {
    config: MessageChannelConfig,
    limiter: SendRateLimiter,
    sender: ReliableSender,
    receiver: MessageReceiver,
    stats: ChannelStats,
}

impl CustomMessageChannel {
    pub fn new(config: MessageChannelConfig) -> Self {
        Self {
            limiter: SendRateLimiter::new(config.max_messages_per_sec, config.max_bytes_per_sec),
            sender: ReliableSender::new(
                config.max_pending_reliable,
                config.retransmit_interval(),
                config.retry_window(),
            ),
            receiver: MessageReceiver::new(config.reorder_delay()),
            stats: ChannelStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &MessageChannelConfig {
        &self.config
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    fn validate(&self, cmd_id: u32, size: usize, reliable: bool, ordered: bool) -> Result<(), MessageError> {
        if !CMD_ID_RANGE.contains(&cmd_id) {
            return Err(MessageError::InvalidCmdId(cmd_id));
        }
        if reliable != ordered {
            return Err(MessageError::FlagMismatch { reliable, ordered });
        }
        if size > self.config.max_payload_bytes {
            return Err(MessageError::PayloadTooLarge {
                size,
                max: self.config.max_payload_bytes,
            });
        }
        if reliable && !self.sender.has_capacity() {
            return Err(MessageError::QueueFull);
        }
        Ok(())
    }

    /// Prüft und nummeriert eine Nachricht. Der Aufrufer sendet das Ergebnis.
    pub fn prepare_send(
        &mut self,
        cmd_id: u32,
        data: &[u8],
        reliable: bool,
        ordered: bool,
        now: Instant,
    ) -> Result<ClientMessage, MessageError> {
        let checked = self
            .validate(cmd_id, data.len(), reliable, ordered)
            .and_then(|()| {
                if self.limiter.try_acquire(data.len(), now) {
                    Ok(())
                } else {
                    Err(MessageError::RateLimited)
                }
            });
        if let Err(e) = checked {
            self.stats.rejected += 1;
            tracing::debug!("Custom message rejected: {}", e);
            return Err(e);
        }

        let seq = self.sender.next_seq(cmd_id);
        let message = ClientMessage::CustomCmd {
            cmd_id,
            seq,
            reliable,
            ordered,
            data: data.to_vec(),
        };
        if reliable {
            self.sender.track(cmd_id, seq, message.clone(), now);
        }
        self.stats.sent += 1;
        Ok(message)
    }

    pub fn on_ack(&mut self, cmd_id: u32, seq: u32) {
        self.sender.acknowledge(cmd_id, seq);
    }

    pub fn on_message(
        &mut self,
        user_id: &str,
        cmd_id: u32,
        seq: u32,
        ordered: bool,
        data: Vec<u8>,
        now: Instant,
    ) -> Vec<Delivery> {
        if !CMD_ID_RANGE.contains(&cmd_id) {
            tracing::warn!("Ignoring custom message with cmd_id {} from {}", cmd_id, user_id);
            return Vec::new();
        }
        let deliveries = self.receiver.on_message(user_id, cmd_id, seq, ordered, data, now);
        self.count_received(&deliveries);
        deliveries
    }

    fn count_received(&mut self, deliveries: &[Delivery]) {
        self.stats.received += deliveries
            .iter()
            .filter(|d| matches!(d, Delivery::Message { .. }))
            .count() as u64;
    }

    pub fn tick(&mut self, now: Instant) -> ChannelTick {
        let poll = self.sender.poll(now);
        self.stats.retransmitted += poll.resend.len() as u64;
        let deliveries = self.receiver.poll(now);
        self.count_received(&deliveries);
        ChannelTick {
            resend: poll.resend,
            expired: poll.expired,
            deliveries,
        }
    }

    pub fn remove_user(&mut self, user_id: &str) {
        self.receiver.remove_user(user_id);
    }

    pub fn reset(&mut self) {
        self.limiter.reset();
        self.sender.reset();
        self.receiver.reset();
        self.stats = ChannelStats::default();
    }
}
