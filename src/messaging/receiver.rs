//! Empfangsseite: Duplikat-Filter und Reorder-Puffer pro (Absender, cmd_id)
//!
//! Geordnete Nachrichten mit Lücke werden gepuffert, bis die Lücke gefüllt ist
//! oder der älteste gepufferte Eintrag `reorder_delay` gewartet hat. Dann wird
//! die Lücke übersprungen und als verpasst gemeldet. Trifft eine übersprungene
//! Nachricht später doch noch ein, wird sie sofort zugestellt.
//!
//! Geordnete und ungeordnete Nachrichten teilen sich die Sequenz einer
//! cmd_id. Ungeordnete werden sofort zugestellt und füllen dabei ihre Lücke.
//! Absender beginnen bei 1; ein Stream, der mit einer höheren Sequenz
//! beginnt (später Beitritt), startet nach Ablauf der Wartezeit ohne
//! Verlustmeldung bei der kleinsten gepufferten Sequenz.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Wie viele bereits zugestellte Sequenzen für die Duplikat-Erkennung
/// gemerkt werden
const DEDUP_WINDOW: u32 = 1024;

/// Erste Sequenz jeder cmd_id beim Absender
const FIRST_SEQ: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message {
        user_id: String,
        cmd_id: u32,
        seq: u32,
        data: Vec<u8>,
    },
    Missed {
        user_id: String,
        cmd_id: u32,
        missed: u32,
    },
}

#[derive(Debug)]
struct Buffered {
    data: Vec<u8>,
    arrived: Instant,
}

#[derive(Debug, Default)]
struct StreamState {
    next_expected: Option<u32>,
    buffered: BTreeMap<u32, Buffered>,
    delivered: BTreeSet<u32>,
}

impl StreamState {
    fn remember(&mut self, seq: u32) {
        self.delivered.insert(seq);
        if self.delivered.len() > DEDUP_WINDOW as usize {
            if let Some(&top) = self.delivered.last() {
                self.delivered = self.delivered.split_off(&top.saturating_sub(DEDUP_WINDOW));
            }
        }
    }

    /// Stellt alle lückenlos anschließenden gepufferten Nachrichten zu.
    /// Bereits ungeordnet zugestellte Sequenzen gelten als gefüllt.
    fn drain_ready(&mut self, key: &(String, u32), out: &mut Vec<Delivery>) {
        while let Some(next) = self.next_expected {
            if let Some(entry) = self.buffered.remove(&next) {
                self.remember(next);
                out.push(Delivery::Message {
                    user_id: key.0.clone(),
                    cmd_id: key.1,
                    seq: next,
                    data: entry.data,
                });
            } else if !self.delivered.contains(&next) {
                break;
            }
            self.next_expected = Some(next.wrapping_add(1));
        }
    }

    /// Sequenzen in `[from, to)`, die nie zugestellt wurden
    fn count_missing(&self, from: u32, to: u32) -> u32 {
        let mut missing = 0;
        let mut seq = from;
        while seq != to {
            if !self.delivered.contains(&seq) {
                missing += 1;
            }
            seq = seq.wrapping_add(1);
        }
        missing
    }
}

#[derive(Debug)]
pub struct MessageReceiver {
    streams: HashMap<(String, u32), StreamState>,
    reorder_delay: Duration,
}

impl MessageReceiver {
    pub fn new(reorder_delay: Duration) -> Self {
        Self {
            streams: HashMap::new(),
            reorder_delay,
        }
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
        let key = (user_id.to_string(), cmd_id);
        let stream = self.streams.entry(key.clone()).or_default();
        let mut out = Vec::new();

        if stream.delivered.contains(&seq) || stream.buffered.contains_key(&seq) {
            tracing::trace!("Duplicate custom message {}:{} seq={}", user_id, cmd_id, seq);
            return out;
        }

        let deliver_now = |stream: &mut StreamState, data: Vec<u8>, out: &mut Vec<Delivery>| {
            stream.remember(seq);
            out.push(Delivery::Message {
                user_id: key.0.clone(),
                cmd_id,
                seq,
                data,
            });
        };

        if !ordered {
            deliver_now(stream, data, &mut out);
            if stream.next_expected.unwrap_or(FIRST_SEQ) == seq {
                stream.next_expected = Some(seq.wrapping_add(1));
                stream.drain_ready(&key, &mut out);
            }
            return out;
        }

        match stream.next_expected {
            Some(next) if seq == next => {
                stream.next_expected = Some(seq.wrapping_add(1));
                deliver_now(stream, data, &mut out);
                stream.drain_ready(&key, &mut out);
            }
            // Ordnungsfenster bereits abgelaufen
            Some(next) if seq < next => deliver_now(stream, data, &mut out),
            None if seq == FIRST_SEQ => {
                stream.next_expected = Some(seq.wrapping_add(1));
                deliver_now(stream, data, &mut out);
                stream.drain_ready(&key, &mut out);
            }
            _ => {
                stream.buffered.insert(seq, Buffered { data, arrived: now });
            }
        }
        out
    }

    /// Überspringt Lücken, deren Wartezeit abgelaufen ist
    pub fn poll(&mut self, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for (key, stream) in self.streams.iter_mut() {
            loop {
                let expired = stream
                    .buffered
                    .values()
                    .any(|b| now.saturating_duration_since(b.arrived) >= self.reorder_delay);
                if !expired {
                    break;
                }
                let Some(&first) = stream.buffered.keys().next() else {
                    break;
                };
                // Ohne bekannten Anfang gibt es keine Verlustmeldung
                let missed = match stream.next_expected {
                    Some(next) => stream.count_missing(next, first),
                    None => 0,
                };
                if missed > 0 {
                    out.push(Delivery::Missed {
                        user_id: key.0.clone(),
                        cmd_id: key.1,
                        missed,
                    });
                }
                stream.next_expected = Some(first);
                stream.drain_ready(key, &mut out);
            }
        }
        out
    }

    /// Vergisst alle Streams eines Absenders
    pub fn remove_user(&mut self, user_id: &str) {
        self.streams.retain(|(user, _), _| user != user_id);
    }

    pub fn buffered_count(&self) -> usize {
        self.streams.values().map(|s| s.buffered.len()).sum()
    }

    pub fn reset(&mut self) {
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(deliveries: &[Delivery]) -> Vec<u32> {
        deliveries
            .iter()
            .filter_map(|d| match d {
                Delivery::Message { seq, .. } => Some(*seq),
                Delivery::Missed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        assert_eq!(seqs(&rx.on_message("a", 1, 1, true, vec![1], now)), vec![1]);
        assert_eq!(seqs(&rx.on_message("a", 1, 2, true, vec![2], now)), vec![2]);
    }

    #[test]
    fn test_reorders_within_window() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        rx.on_message("a", 1, 1, true, vec![], now);
        assert!(rx.on_message("a", 1, 3, true, vec![], now).is_empty());
        assert!(rx.on_message("a", 1, 4, true, vec![], now).is_empty());
        assert_eq!(seqs(&rx.on_message("a", 1, 2, true, vec![], now)), vec![2, 3, 4]);
        assert_eq!(rx.buffered_count(), 0);
    }

    #[test]
    fn test_gap_skipped_after_deadline() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        rx.on_message("a", 1, 1, true, vec![], now);
        rx.on_message("a", 1, 4, true, vec![], now);
        assert!(rx.poll(now + Duration::from_millis(499)).is_empty());

        let out = rx.poll(now + Duration::from_millis(500));
        assert_eq!(
            out[0],
            Delivery::Missed {
                user_id: "a".into(),
                cmd_id: 1,
                missed: 2
            }
        );
        assert_eq!(seqs(&out), vec![4]);

        // Nachzügler wird sofort zugestellt
        let late = rx.on_message("a", 1, 2, true, vec![], now + Duration::from_millis(600));
        assert_eq!(seqs(&late), vec![2]);
    }

    #[test]
    fn test_streams_are_independent_per_command() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        rx.on_message("a", 1, 1, true, vec![], now);
        rx.on_message("a", 1, 3, true, vec![], now);
        // cmd 2 wird nicht von der Lücke in cmd 1 blockiert
        assert_eq!(seqs(&rx.on_message("a", 2, 1, true, vec![], now)), vec![1]);
        assert_eq!(seqs(&rx.on_message("a", 2, 2, true, vec![], now)), vec![2]);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        assert_eq!(rx.on_message("a", 1, 1, false, vec![], now).len(), 1);
        assert!(rx.on_message("a", 1, 1, false, vec![], now).is_empty());
        rx.on_message("b", 1, 5, true, vec![], now);
        assert!(rx.on_message("b", 1, 5, true, vec![], now).is_empty());
    }

    #[test]
    fn test_unordered_message_fills_sequence() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        assert_eq!(seqs(&rx.on_message("a", 1, 1, true, vec![], now)), vec![1]);
        assert_eq!(seqs(&rx.on_message("a", 1, 2, false, vec![], now)), vec![2]);
        assert_eq!(seqs(&rx.on_message("a", 1, 3, true, vec![], now)), vec![3]);
        assert_eq!(rx.buffered_count(), 0);
        assert!(rx.poll(now + Duration::from_millis(600)).is_empty());
    }

    #[test]
    fn test_unordered_message_ahead_of_ordered_one() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        rx.on_message("a", 1, 1, true, vec![], now);
        assert_eq!(seqs(&rx.on_message("a", 1, 3, false, vec![], now)), vec![3]);
        assert_eq!(seqs(&rx.on_message("a", 1, 2, true, vec![], now)), vec![2]);
        assert_eq!(seqs(&rx.on_message("a", 1, 4, true, vec![], now)), vec![4]);
        assert!(rx.poll(now + Duration::from_millis(600)).is_empty());
    }

    #[test]
    fn test_stream_start_is_reordered() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        assert!(rx.on_message("a", 1, 2, true, vec![], now).is_empty());
        let out = rx.on_message("a", 1, 1, true, vec![], now + Duration::from_millis(5));
        assert_eq!(seqs(&out), vec![1, 2]);
    }

    #[test]
    fn test_late_join_starts_without_missed_report() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        assert!(rx.on_message("a", 1, 40, true, vec![], now).is_empty());
        assert!(rx.on_message("a", 1, 41, true, vec![], now).is_empty());

        let out = rx.poll(now + Duration::from_millis(500));
        assert_eq!(seqs(&out), vec![40, 41]);
        assert!(out.iter().all(|d| matches!(d, Delivery::Message { .. })));
        assert_eq!(seqs(&rx.on_message("a", 1, 42, true, vec![], now)), vec![42]);
    }

    #[test]
    fn test_missed_count_skips_unordered_deliveries() {
        let mut rx = MessageReceiver::new(Duration::from_millis(500));
        let now = Instant::now();
        rx.on_message("a", 1, 1, true, vec![], now);
        rx.on_message("a", 1, 3, false, vec![], now);
        rx.on_message("a", 1, 5, true, vec![], now);

        let out = rx.poll(now + Duration::from_millis(500));
        assert_eq!(
            out[0],
            Delivery::Missed {
                user_id: "a".into(),
                cmd_id: 1,
                missed: 2
            }
        );
        assert_eq!(seqs(&out), vec![5]);
    }
}
