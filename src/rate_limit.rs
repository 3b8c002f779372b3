//! Per-client request ceilings guarding the model call.
//!
//! Each client carries two independent fixed windows: a short one (a minute
//! by default) and a long one (a day by default).  A window that has elapsed
//! restarts at count 1 with the current request; a window whose ceiling is
//! already reached rejects without counting.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub per_minute: u32,
    pub per_day: u32,
    pub minute_window: Duration,
    pub day_window: Duration,
    /// Store size above which clients with fully elapsed windows are evicted.
    pub max_clients: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            per_minute: 5,
            per_day: 50,
            minute_window: Duration::from_secs(60),
            day_window: Duration::from_secs(24 * 60 * 60),
            max_clients: 10_000,
        }
    }
}

#[derive(Clone, Debug)]
struct RateLimitCounter {
    minute_count: u32,
    minute_window_end: Instant,
    day_count: u32,
    day_window_end: Instant,
}

impl RateLimitCounter {
    fn fresh(now: Instant, settings: &RateLimitSettings) -> Self {
        Self {
            minute_count: 1,
            minute_window_end: now + settings.minute_window,
            day_count: 1,
            day_window_end: now + settings.day_window,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        now >= self.minute_window_end && now >= self.day_window_end
    }
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    clients: DashMap<String, RateLimitCounter>,
    /// Earliest time the next over-capacity sweep may run.
    next_sweep: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            clients: DashMap::new(),
            next_sweep: Mutex::new(None),
        }
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Record a request from `client_id` at `now`, returning true when it
    /// must be rejected.  A rejected request does not consume quota.
    pub fn is_limited(&self, client_id: &str, now: Instant) -> bool {
        if self.clients.len() > self.settings.max_clients && self.sweep_due(now) {
            self.evict_stale(now);
        }
        let settings = &self.settings;
        match self.clients.entry(client_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(RateLimitCounter::fresh(now, settings));
                false
            }
            Entry::Occupied(mut slot) => {
                let counter = slot.get_mut();

                let day_reset = now >= counter.day_window_end;
                if day_reset {
                    counter.day_count = 1;
                    counter.day_window_end = now + settings.day_window;
                } else if counter.day_count >= settings.per_day {
                    return true;
                }

                let minute_reset = now >= counter.minute_window_end;
                if minute_reset {
                    counter.minute_count = 1;
                    counter.minute_window_end = now + settings.minute_window;
                } else if counter.minute_count >= settings.per_minute {
                    return true;
                }

                if !day_reset {
                    counter.day_count += 1;
                }
                if !minute_reset {
                    counter.minute_count += 1;
                }
                false
            }
        }
    }

    /// At most one sweep per short window while the store stays over capacity.
    fn sweep_due(&self, now: Instant) -> bool {
        let mut next = self
            .next_sweep
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if next.is_some_and(|at| now < at) {
            return false;
        }
        *next = Some(now + self.settings.minute_window);
        true
    }

    /// Drop clients whose windows have both elapsed.  Such a client would be
    /// reset on its next request anyway, so eviction is unobservable.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, counter| !counter.is_stale(now));
        let evicted = before.saturating_sub(self.clients.len());
        if evicted > 0 {
            tracing::debug!(
                evicted,
                remaining = self.clients.len(),
                "evicted stale rate-limit clients"
            );
        }
        evicted
    }
}
