use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use tandem_core::ids::UserId;

/// Acquires between sweeps of idle users.
const SWEEP_EVERY: u64 = 256;

/// Per-user rolling window.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: DashMap<UserId, VecDeque<Instant>>,
    acquires: AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: DashMap::new(),
            acquires: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Record a hit for `user_id` unless that would exceed the limit.
    pub fn try_acquire(&self, user_id: &UserId) -> bool {
        let now = Instant::now();
        if self.acquires.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        let mut hits = self.hits.entry(user_id.clone()).or_default();
        while hits
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
        {
            hits.pop_front();
        }
        if hits.len() >= self.limit as usize {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Forget users whose every hit has left the window.
    fn sweep(&self, now: Instant) {
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|newest| now.duration_since(*newest) < self.window)
        });
    }

    pub fn tracked_users(&self) -> usize {
        self.hits.len()
    }
}
