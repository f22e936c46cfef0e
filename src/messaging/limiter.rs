//! Sendeseitiges Rate Limiting über ein gleitendes Fenster

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SendRateLimiter {
    max_messages: u32,
    max_bytes: usize,
    sent: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl SendRateLimiter {
    pub fn new(max_messages: u32, max_bytes: usize) -> Self {
        Self {
            max_messages,
            max_bytes,
            sent: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, size)) = self.sent.front() {
            if now.saturating_duration_since(at) < WINDOW {
                break;
            }
            self.sent.pop_front();
            self.bytes_in_window -= size;
        }
    }

    /// Reserviert Platz für eine Nachricht. `false` = Limit erreicht.
    pub fn try_acquire(&mut self, size: usize, now: Instant) -> bool {
        self.expire(now);
        if self.sent.len() >= self.max_messages as usize
            || self.bytes_in_window + size > self.max_bytes
        {
            return false;
        }
        self.sent.push_back((now, size));
        self.bytes_in_window += size;
        true
    }

    pub fn reset(&mut self) {
        self.sent.clear();
        self.bytes_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_count_limit() {
        let mut limiter = SendRateLimiter::new(30, 8192);
        let now = Instant::now();
        let accepted = (0..40)
            .filter(|i| limiter.try_acquire(200, now + Duration::from_millis(i * 20)))
            .count();
        assert_eq!(accepted, 30);
    }

    #[test]
    fn test_byte_limit() {
        let mut limiter = SendRateLimiter::new(30, 8192);
        let now = Instant::now();
        assert!(limiter.try_acquire(1024 * 7, now));
        assert!(limiter.try_acquire(1024, now));
        assert!(!limiter.try_acquire(1, now));
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = SendRateLimiter::new(2, 8192);
        let now = Instant::now();
        assert!(limiter.try_acquire(10, now));
        assert!(limiter.try_acquire(10, now + Duration::from_millis(500)));
        assert!(!limiter.try_acquire(10, now + Duration::from_millis(900)));
        assert!(limiter.try_acquire(10, now + Duration::from_millis(1000)));
    }
}
