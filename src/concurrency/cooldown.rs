//! Per-destination single-token cooldown.
//!
//! Each public destination holds one deadline. The token is present once the
//! deadline has passed; taking it pushes the deadline `cooldown` into the
//! future. Denied attempts change nothing.

use crate::state::SharedHandle;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Deadline per destination; lives in the shared state.
#[derive(Debug, Default)]
pub struct CooldownTable {
    deadlines: HashMap<String, Instant>,
}

impl CooldownTable {
    /// Make sure `destination` has an entry, primed to allow immediately.
    /// Returns `true` if the entry was created.
    pub fn prime(&mut self, destination: &str, now: Instant) -> bool {
        if self.deadlines.contains_key(destination) {
            return false;
        }
        self.deadlines.insert(destination.to_string(), now);
        true
    }

    pub fn try_consume(&mut self, destination: &str, now: Instant, cooldown: Duration) -> bool {
        let deadline = self
            .deadlines
            .entry(destination.to_string())
            .or_insert(now);
        if now < *deadline {
            return false;
        }
        *deadline = now + cooldown;
        true
    }

    pub fn deadline(&self, destination: &str) -> Option<Instant> {
        self.deadlines.get(destination).copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    state: SharedHandle,
    cooldown: Duration,
}

impl RateLimiter {
    pub fn new(state: SharedHandle, cooldown: Duration) -> Self {
        Self { state, cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn try_acquire(&self, destination: &str, is_private: bool) -> bool {
        self.try_acquire_at(destination, is_private, Instant::now())
    }

    pub fn try_acquire_at(&self, destination: &str, is_private: bool, now: Instant) -> bool {
        if is_private {
            return true;
        }

        let allowed = {
            let mut state = self.state.lock();
            if state.cooldowns.prime(destination, now) {
                debug!(destination, "cooldown entry created");
            }
            state.cooldowns.try_consume(destination, now, self.cooldown)
        };

        if !allowed {
            debug!(destination, "rate limited");
        }
        allowed
    }

    /// Create the entry for a newly joined destination.
    pub fn prime(&self, destination: &str) {
        self.state
            .lock()
            .cooldowns
            .prime(destination, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;

    fn limiter() -> RateLimiter {
        RateLimiter::new(SharedState::shared(), Duration::from_secs(60))
    }

    #[test]
    fn allowed_then_denied_within_cooldown() {
        let limiter = limiter();
        let now = Instant::now();

        assert!(limiter.try_acquire_at("#mania", false, now));
        assert!(!limiter.try_acquire_at("#mania", false, now + Duration::from_secs(1)));
        assert!(!limiter.try_acquire_at("#mania", false, now + Duration::from_secs(59)));
    }

    #[test]
    fn allowed_again_after_cooldown() {
        let limiter = limiter();
        let now = Instant::now();

        assert!(limiter.try_acquire_at("#mania", false, now));
        assert!(limiter.try_acquire_at("#mania", false, now + Duration::from_secs(60)));
        assert!(!limiter.try_acquire_at("#mania", false, now + Duration::from_secs(61)));
    }

    #[test]
    fn private_always_allowed() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.try_acquire_at("alice", true, now));
        }
        assert!(limiter.state.lock().cooldowns.is_empty());
    }

    #[test]
    fn destinations_are_independent() {
        let limiter = limiter();
        let now = Instant::now();

        assert!(limiter.try_acquire_at("#a", false, now));
        assert!(limiter.try_acquire_at("#b", false, now));
        assert!(!limiter.try_acquire_at("#a", false, now));
        assert_eq!(limiter.state.lock().cooldowns.len(), 2);
    }

    #[test]
    fn denied_attempt_leaves_deadline_unchanged() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.try_acquire_at("#mania", false, now);
        let deadline = limiter.state.lock().cooldowns.deadline("#mania");

        limiter.try_acquire_at("#mania", false, now + Duration::from_secs(30));
        assert_eq!(limiter.state.lock().cooldowns.deadline("#mania"), deadline);
    }

    #[test]
    fn prime_does_not_reset_consumed_token() {
        let mut table = CooldownTable::default();
        let now = Instant::now();

        assert!(table.prime("#mania", now));
        assert!(table.try_consume("#mania", now, Duration::from_secs(60)));
        assert!(!table.prime("#mania", now));
        assert!(!table.try_consume("#mania", now, Duration::from_secs(60)));
    }
}
