//! Zuverlässige Sendeseite: Sequenznummern, Retransmits, Retry-Fenster

use crate::signaling::ClientMessage;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PendingMessage {
    message: ClientMessage,
    first_sent: Instant,
    last_sent: Instant,
    attempts: u32,
}

/// Ergebnis eines Timer-Durchlaufs
#[derive(Debug, Default, PartialEq)]
pub struct SenderPoll {
    pub resend: Vec<ClientMessage>,
    /// (cmd_id, seq) ohne Bestätigung innerhalb des Retry-Fensters
    pub expired: Vec<(u32, u32)>,
}

#[derive(Debug)]
pub struct ReliableSender {
    next_seq: HashMap<u32, u32>,
    pending: BTreeMap<(u32, u32), PendingMessage>,
    max_pending: usize,
    retransmit_interval: Duration,
    retry_window: Duration,
}

impl ReliableSender {
    pub fn new(max_pending: usize, retransmit_interval: Duration, retry_window: Duration) -> Self {
        Self {
            next_seq: HashMap::new(),
            pending: BTreeMap::new(),
            max_pending,
            retransmit_interval,
            retry_window,
        }
    }

    /// Nächste Sequenznummer für `cmd_id`, beginnend bei 1
    pub fn next_seq(&mut self, cmd_id: u32) -> u32 {
        let seq = self.next_seq.entry(cmd_id).or_insert(1);
        let current = *seq;
        *seq = seq.wrapping_add(1).max(1);
        current
    }

    pub fn has_capacity(&self) -> bool {
        self.pending.len() < self.max_pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn track(&mut self, cmd_id: u32, seq: u32, message: ClientMessage, now: Instant) {
        self.pending.insert(
            (cmd_id, seq),
            PendingMessage {
                message,
                first_sent: now,
                last_sent: now,
                attempts: 1,
            },
        );
    }

    /// `true` wenn die Nachricht noch offen war
    pub fn acknowledge(&mut self, cmd_id: u32, seq: u32) -> bool {
        self.pending.remove(&(cmd_id, seq)).is_some()
    }

    pub fn poll(&mut self, now: Instant) -> SenderPoll {
        let mut result = SenderPoll::default();
        let retry_window = self.retry_window;
        self.pending.retain(|&key, pending| {
            if now.saturating_duration_since(pending.first_sent) >= retry_window {
                tracing::debug!(
                    "Custom message cmd={} seq={} dropped after {} attempts",
                    key.0,
                    key.1,
                    pending.attempts
                );
                result.expired.push(key);
                return false;
            }
            true
        });
        for pending in self.pending.values_mut() {
            if now.saturating_duration_since(pending.last_sent) >= self.retransmit_interval {
                pending.last_sent = now;
                pending.attempts += 1;
                result.resend.push(pending.message.clone());
            }
        }
        result
    }

    /// Offene Nachrichten verwerfen, Sequenzen bleiben erhalten
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_seq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(cmd_id: u32, seq: u32) -> ClientMessage {
        ClientMessage::CustomCmd {
            cmd_id,
            seq,
            reliable: true,
            ordered: true,
            data: vec![1, 2, 3],
        }
    }

    fn sender() -> ReliableSender {
        ReliableSender::new(2, Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_sequences_per_command() {
        let mut sender = sender();
        assert_eq!(sender.next_seq(1), 1);
        assert_eq!(sender.next_seq(1), 2);
        assert_eq!(sender.next_seq(2), 1);
    }

    #[test]
    fn test_retransmit_until_ack() {
        let mut sender = sender();
        let now = Instant::now();
        sender.track(1, 1, message(1, 1), now);

        assert!(sender.poll(now + Duration::from_millis(50)).resend.is_empty());
        let poll = sender.poll(now + Duration::from_millis(100));
        assert_eq!(poll.resend, vec![message(1, 1)]);

        assert!(sender.acknowledge(1, 1));
        assert!(!sender.acknowledge(1, 1));
        assert_eq!(sender.poll(now + Duration::from_millis(300)), SenderPoll::default());
    }

    #[test]
    fn test_expires_after_retry_window() {
        let mut sender = sender();
        let now = Instant::now();
        sender.track(3, 7, message(3, 7), now);
        let poll = sender.poll(now + Duration::from_millis(1000));
        assert_eq!(poll.expired, vec![(3, 7)]);
        assert!(poll.resend.is_empty());
        assert_eq!(sender.pending_count(), 0);
    }

    #[test]
    fn test_capacity() {
        let mut sender = sender();
        let now = Instant::now();
        sender.track(1, 1, message(1, 1), now);
        assert!(sender.has_capacity());
        sender.track(1, 2, message(1, 2), now);
        assert!(!sender.has_capacity());
    }
}
