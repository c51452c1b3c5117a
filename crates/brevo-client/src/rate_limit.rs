//! Trailing 60 second request window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub(crate) const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) struct RateWindow {
    max_per_window: u32,
    sent: VecDeque<Instant>,
}

impl RateWindow {
    pub(crate) fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            sent: VecDeque::new(),
        }
    }

    /// How long to wait before the next request may go out.
    pub(crate) fn delay(&mut self, now: Instant) -> Option<Duration> {
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= RATE_WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }

        if self.max_per_window == 0 || self.sent.len() < self.max_per_window as usize {
            return None;
        }
        self.sent
            .front()
            .map(|oldest| (*oldest + RATE_WINDOW).saturating_duration_since(now))
    }

    pub(crate) fn record(&mut self, at: Instant) {
        self.sent.push_back(at);
    }

    pub(crate) fn len(&self) -> usize {
        self.sent.len()
    }
}
