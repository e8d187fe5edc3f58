//! Per-connection sliding-window rate limiting.
//!
//! A window of send instants is pruned on every check; once the window is
//! full the call is refused and counted as a violation. Enough violations
//! and the caller bans the connection.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SlidingWindow {
    hits: VecDeque<Instant>,
    max: usize,
    window: Duration,
    pub violations: u32,
}

impl SlidingWindow {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            hits: VecDeque::new(),
            max: max_per_window,
            window,
            violations: 0,
        }
    }

    /// Try to account one message. `false` means rate limited.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.max {
            self.violations += 1;
            return false;
        }
        self.hits.push_back(now);
        true
    }

    pub fn remaining(&self) -> usize {
        self.max.saturating_sub(self.hits.len())
    }
}
