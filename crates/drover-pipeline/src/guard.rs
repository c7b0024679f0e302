//! Process-wide rate-limit breaker.
//!
//! Written only by the scheduler loop; handlers report rate-limit signals
//! through their completion messages and never touch the guard directly.

use std::time::{Duration, Instant};

pub struct RateLimitGuard {
    base: Duration,
    max: Duration,
    cooldown: Duration,
    /// Consecutive rate-limit signals in the current streak.
    streak: u32,
    deadline: Option<Instant>,
}

impl RateLimitGuard {
    pub fn new(base: Duration, max: Duration, cooldown: Duration) -> Self {
        Self {
            base,
            max,
            cooldown,
            streak: 0,
            deadline: None,
        }
    }

    pub fn from_config(config: &drover_types::DroverConfig) -> Self {
        Self::new(
            Duration::from_secs(config.rate_limit_base_delay_secs),
            Duration::from_secs(config.rate_limit_max_delay_secs),
            Duration::from_secs(config.rate_limit_cooldown_secs),
        )
    }

    /// Record one rate-limit signal; returns the backoff applied.
    /// The k-th consecutive signal backs off `min(base * 2^(k-1), max)`.
    pub fn on_rate_limit(&mut self, now: Instant) -> Duration {
        self.streak += 1;
        let exp = self.streak.saturating_sub(1).min(32);
        let delay = self
            .base
            .checked_mul(1u32 << exp.min(31))
            .unwrap_or(self.max)
            .min(self.max);
        self.deadline = Some(now + delay);
        tracing::warn!(
            streak = self.streak,
            delay_secs = delay.as_secs(),
            "rate limit signal, backing off"
        );
        delay
    }

    /// Record a cycle whose units all completed without rate-limit signals.
    /// Ends the streak but keeps a cooldown window: provider limits often
    /// re-trip right after the first success.
    pub fn on_clean_cycle(&mut self, now: Instant) -> Option<Duration> {
        if self.streak == 0 {
            return None;
        }
        self.streak = 0;
        self.deadline = Some(now + self.cooldown);
        tracing::info!(
            cooldown_secs = self.cooldown.as_secs(),
            "rate limit streak ended, entering cooldown"
        );
        Some(self.cooldown)
    }

    /// Time left before dispatch may resume, if any.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        match self.deadline {
            Some(deadline) if deadline > now => Some(deadline - now),
            _ => None,
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> RateLimitGuard {
        RateLimitGuard::new(
            Duration::from_secs(60),
            Duration::from_secs(600),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn backoff_doubles_per_consecutive_signal() {
        let mut g = guard();
        let now = Instant::now();
        assert_eq!(g.on_rate_limit(now), Duration::from_secs(60));
        assert_eq!(g.on_rate_limit(now), Duration::from_secs(120));
        assert_eq!(g.on_rate_limit(now), Duration::from_secs(240));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut g = guard();
        let now = Instant::now();
        for _ in 0..10 {
            g.on_rate_limit(now);
        }
        assert_eq!(g.on_rate_limit(now), Duration::from_secs(600));
    }

    #[test]
    fn clean_cycle_resets_streak_but_holds_cooldown() {
        let mut g = guard();
        let now = Instant::now();
        g.on_rate_limit(now);
        g.on_rate_limit(now);

        assert_eq!(g.on_clean_cycle(now), Some(Duration::from_secs(300)));
        assert_eq!(g.streak(), 0);
        let remaining = g.backoff_remaining(now).unwrap();
        assert!(remaining <= Duration::from_secs(300));
        assert!(remaining > Duration::from_secs(290));

        // Next signal starts a fresh streak at the base delay.
        assert_eq!(g.on_rate_limit(now), Duration::from_secs(60));
    }

    #[test]
    fn clean_cycle_without_streak_is_a_no_op() {
        let mut g = guard();
        assert_eq!(g.on_clean_cycle(Instant::now()), None);
        assert!(g.backoff_remaining(Instant::now()).is_none());
    }

    #[test]
    fn remaining_expires() {
        let mut g = guard();
        let now = Instant::now();
        g.on_rate_limit(now);
        assert!(g.backoff_remaining(now + Duration::from_secs(61)).is_none());
    }
}
