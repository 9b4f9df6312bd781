//! Request priorities and the reschedule backoff.
//!
//! # Example
//!
//! ```ignore
//! use treeprefetch::prefetch::{calculate_priority, Priority};
//! use treeprefetch::action::PrefetchAction;
//!
//! // Children of an on-demand block are throttled unless deep-syncing.
//! let child = calculate_priority(Priority::ON_DEMAND, PrefetchAction::WITH_PREFETCH);
//! assert_eq!(child, Priority(Priority::THROTTLE.value() - 1));
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::action::PrefetchAction;
use crate::config::BackoffConfig;

// =============================================================================
// Priority
// =============================================================================

/// Priority value for blocks a user is waiting on.
pub const PRIORITY_ON_DEMAND: i32 = 1 << 30;

/// Ceiling for prefetched children that are not deep-synced.
pub const PRIORITY_THROTTLE: i32 = 1 << 15;

/// Priority value for pointer updates.
pub const PRIORITY_UPDATE_POINTER: i32 = 1;

/// Retrieval priority (higher = more important).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Blocks a user read is waiting for.
    pub const ON_DEMAND: Priority = Priority(PRIORITY_ON_DEMAND);

    /// Throttled background prefetches.
    pub const THROTTLE: Priority = Priority(PRIORITY_THROTTLE);

    pub const UPDATE_POINTER: Priority = Priority(PRIORITY_UPDATE_POINTER);

    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::ON_DEMAND
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ON_DEMAND => write!(f, "ON_DEMAND"),
            Self::THROTTLE => write!(f, "THROTTLE"),
            Self(v) => write!(f, "Priority({})", v),
        }
    }
}

/// Priority for the children of a block requested at `base`.
///
/// Prefetched children are throttled unless the action deep-syncs, and
/// always rank one below their parent.
pub fn calculate_priority(base: Priority, action: PrefetchAction) -> Priority {
    let mut value = base.0;
    if value > PRIORITY_THROTTLE && !action.deep_sync() {
        value = PRIORITY_THROTTLE;
    }
    Priority(value.saturating_sub(1))
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Randomized exponential backoff for rescheduling one top-level block.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            started: Instant::now(),
        }
    }

    /// The next delay, or `None` once the elapsed-time budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let max_elapsed = self.config.max_elapsed;
        if !max_elapsed.is_zero() && self.started.elapsed() > max_elapsed {
            return None;
        }

        let delay = randomize(self.current, self.config.randomization_factor);
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config.multiplier)
            .unwrap_or(self.config.max_interval);
        self.current = grown.min(self.config.max_interval);
        Some(delay)
    }
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let delta = interval.as_secs_f64() * factor;
    let low = interval.as_secs_f64() - delta;
    let high = interval.as_secs_f64() + delta;
    let secs = rand::rng().random_range(low..=high);
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(350),
            max_elapsed: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::ON_DEMAND > Priority::THROTTLE);
        assert!(Priority::THROTTLE > Priority::UPDATE_POINTER);
        assert_eq!(Priority::default(), Priority::ON_DEMAND);
        assert_eq!(Priority::ON_DEMAND.to_string(), "ON_DEMAND");
        assert_eq!(Priority(7).to_string(), "Priority(7)");
    }

    #[test]
    fn test_calculate_priority_throttles_children() {
        assert_eq!(
            calculate_priority(Priority::ON_DEMAND, PrefetchAction::WITH_PREFETCH),
            Priority(PRIORITY_THROTTLE - 1)
        );
        assert_eq!(
            calculate_priority(Priority::ON_DEMAND, PrefetchAction::WITH_DEEP_SYNC),
            Priority(PRIORITY_ON_DEMAND - 1)
        );
        assert_eq!(
            calculate_priority(Priority(10), PrefetchAction::WITH_PREFETCH),
            Priority(9)
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = ExponentialBackoff::new(fixed_backoff());
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_backoff_with_unusable_multiplier_holds_at_max() {
        let config = BackoffConfig {
            multiplier: f64::NAN,
            ..fixed_backoff()
        };
        let mut backoff = ExponentialBackoff::new(config);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_backoff_randomization_stays_in_range() {
        let config = BackoffConfig {
            randomization_factor: 0.5,
            ..fixed_backoff()
        };
        for _ in 0..50 {
            let mut backoff = ExponentialBackoff::new(config.clone());
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_after_max_elapsed() {
        let config = BackoffConfig {
            max_elapsed: Duration::from_secs(1),
            ..fixed_backoff()
        };
        let mut backoff = ExponentialBackoff::new(config);
        assert!(backoff.next_backoff().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backoff.next_backoff(), None);
    }
}
