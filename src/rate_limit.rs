//! Sliding-window rate limiter with flood waits, permanent bans and an
//! adaptive per-destination limit.
//!
//! `try_acquire` checks three gates in order: the ban set, the destination's
//! flood-wait cooldown, then the global and per-destination windows. An
//! `Allow` consumes a slot in both windows immediately, so workers racing
//! between the check and the send cannot overshoot a limit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::transport::ChatId;

/// Smoothing weight kept from the previous success rate.
const SUCCESS_RATE_DECAY: f64 = 0.9;

/// Success rate at which a quiet destination is forgotten by `prune`.
const RECOVERED_SUCCESS_RATE: f64 = 0.99;

/// Window sizes and base limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Sends allowed across all destinations per window.
    pub global_limit: usize,
    /// Base per-destination limit before adaptive reduction.
    pub destination_limit: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            global_limit: 100,
            destination_limit: 30,
        }
    }
}

/// Outcome of `try_acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Banned,
    FloodWait { remaining: Duration },
    GlobalLimit,
    DestinationLimit { limit: usize },
}

/// Per-destination limiter state.
#[derive(Debug)]
struct DestinationState {
    sends: VecDeque<Instant>,
    errors: VecDeque<Instant>,
    success_rate: f64,
    flood_until: Option<Instant>,
}

impl DestinationState {
    fn new() -> Self {
        Self {
            sends: VecDeque::new(),
            errors: VecDeque::new(),
            success_rate: 1.0,
            flood_until: None,
        }
    }

    fn purge(&mut self, now: Instant, window: Duration) {
        purge_window(&mut self.sends, now, window);
        purge_window(&mut self.errors, now, window);
        if self.flood_until.is_some_and(|until| now >= until) {
            self.flood_until = None;
        }
    }

    /// Nothing in the window, no cooldown, and a success rate that has
    /// recovered. A degraded rate must outlive the window.
    fn is_idle(&self) -> bool {
        self.sends.is_empty()
            && self.errors.is_empty()
            && self.flood_until.is_none()
            && self.success_rate >= RECOVERED_SUCCESS_RATE
    }
}

#[derive(Debug, Default)]
struct Inner {
    global: VecDeque<Instant>,
    destinations: HashMap<ChatId, DestinationState>,
    banned: HashSet<ChatId>,
}

/// Read-only view of one destination's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationStats {
    pub destination: ChatId,
    pub sends_in_window: usize,
    pub limit: usize,
    pub success_rate: f64,
    pub recent_errors: usize,
    pub flood_wait_secs: Option<u64>,
}

/// Read-only view of the limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub global_sends_in_window: usize,
    pub global_limit: usize,
    pub banned: Vec<ChatId>,
    pub destinations: Vec<DestinationStats>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check all gates for `destination` and consume a slot on success.
    pub fn try_acquire(&self, destination: ChatId) -> Decision {
        let now = self.clock.now();
        let window = self.config.window;
        let mut inner = self.lock();

        if inner.banned.contains(&destination) {
            return Decision::Deny(DenyReason::Banned);
        }

        if let Some(state) = inner.destinations.get_mut(&destination) {
            match state.flood_until {
                Some(until) if now < until => {
                    return Decision::Deny(DenyReason::FloodWait {
                        remaining: until - now,
                    });
                }
                Some(_) => {
                    state.flood_until = None;
                    debug!(%destination, "Flood wait expired");
                }
                None => {}
            }
        }

        purge_window(&mut inner.global, now, window);
        if inner.global.len() >= self.config.global_limit {
            return Decision::Deny(DenyReason::GlobalLimit);
        }

        let base = self.config.destination_limit;
        let state = inner
            .destinations
            .entry(destination)
            .or_insert_with(DestinationState::new);
        state.purge(now, window);

        let limit = adaptive_limit(base, state.success_rate, state.errors.len());
        if state.sends.len() >= limit {
            return Decision::Deny(DenyReason::DestinationLimit { limit });
        }

        state.sends.push_back(now);
        inner.global.push_back(now);
        Decision::Allow
    }

    /// Fold a successful send into the destination's success rate.
    pub fn record_success(&self, destination: ChatId) {
        let mut inner = self.lock();
        let state = inner
            .destinations
            .entry(destination)
            .or_insert_with(DestinationState::new);
        state.success_rate = SUCCESS_RATE_DECAY * state.success_rate + (1.0 - SUCCESS_RATE_DECAY);
    }

    /// Fold a failed send into the destination's success rate and error count.
    pub fn record_failure(&self, destination: ChatId) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let state = inner
            .destinations
            .entry(destination)
            .or_insert_with(DestinationState::new);
        state.success_rate *= SUCCESS_RATE_DECAY;
        state.errors.push_back(now);
    }

    /// Block sends to `destination` for `duration`. An existing longer
    /// cooldown is kept.
    pub fn set_flood_wait(&self, destination: ChatId, duration: Duration) {
        let until = self.clock.now() + duration;
        let mut inner = self.lock();
        let state = inner
            .destinations
            .entry(destination)
            .or_insert_with(DestinationState::new);
        state.flood_until = Some(state.flood_until.map_or(until, |cur| cur.max(until)));
        info!(%destination, wait_secs = duration.as_secs(), "Flood wait installed");
    }

    pub fn ban_permanently(&self, destination: ChatId) {
        if self.lock().banned.insert(destination) {
            info!(%destination, "Destination banned");
        }
    }

    pub fn unban(&self, destination: ChatId) {
        if self.lock().banned.remove(&destination) {
            info!(%destination, "Destination unbanned");
        }
    }

    pub fn is_banned(&self, destination: ChatId) -> bool {
        self.lock().banned.contains(&destination)
    }

    /// Current adaptive limit for `destination`.
    pub fn destination_limit(&self, destination: ChatId) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.destinations.get_mut(&destination) {
            Some(state) => {
                state.purge(now, self.config.window);
                adaptive_limit(
                    self.config.destination_limit,
                    state.success_rate,
                    state.errors.len(),
                )
            }
            None => self.config.destination_limit,
        }
    }

    /// Snapshot of limiter state.
    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let window = self.config.window;
        let base = self.config.destination_limit;
        let mut inner = self.lock();

        purge_window(&mut inner.global, now, window);

        let mut destinations: Vec<DestinationStats> = inner
            .destinations
            .iter_mut()
            .map(|(dest, state)| {
                state.purge(now, window);
                DestinationStats {
                    destination: *dest,
                    sends_in_window: state.sends.len(),
                    limit: adaptive_limit(base, state.success_rate, state.errors.len()),
                    success_rate: state.success_rate,
                    recent_errors: state.errors.len(),
                    flood_wait_secs: state.flood_until.map(|until| (until - now).as_secs()),
                }
            })
            .collect();
        destinations.sort_by_key(|d| d.destination);

        let mut banned: Vec<ChatId> = inner.banned.iter().copied().collect();
        banned.sort();

        RateLimiterStats {
            global_sends_in_window: inner.global.len(),
            global_limit: self.config.global_limit,
            banned,
            destinations,
        }
    }

    /// Drop state for destinations with nothing in the window, no cooldown
    /// and a recovered success rate. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.window;
        let mut inner = self.lock();

        purge_window(&mut inner.global, now, window);
        let before = inner.destinations.len();
        inner.destinations.retain(|_, state| {
            state.purge(now, window);
            !state.is_idle()
        });
        inner.destinations.shrink_to_fit();

        let pruned = before - inner.destinations.len();
        if pruned > 0 {
            debug!(pruned, "Pruned idle rate limiter state");
        }
        pruned
    }
}

/// Per-destination limit after adaptive reduction. Never below 1.
pub fn adaptive_limit(base: usize, success_rate: f64, recent_errors: usize) -> usize {
    let limit = if success_rate < 0.5 || recent_errors > 10 {
        base * 3 / 10
    } else if success_rate < 0.8 || recent_errors > 5 {
        base * 6 / 10
    } else {
        base
    };
    limit.max(1)
}

fn purge_window(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while entries
        .front()
        .is_some_and(|&t| now.duration_since(t) >= window)
    {
        entries.pop_front();
    }
}
