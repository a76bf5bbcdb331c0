//! # Per-item Exponential Backoff
//!
//! Tracks consecutive failures per work item and turns them into a requeue
//! delay. The delay doubles on every failure, starting at `base` and capped at
//! `max`: with the defaults the sequence is 5ms, 10ms, 20ms, ... up to 1000s.
//!
//! Items are tracked independently, so one failing key never slows down an
//! unrelated one. A successful reconcile calls [`ItemBackoff::forget`] and the
//! next failure starts again from `base`.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Default first delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff keyed by work item
#[derive(Debug, Clone)]
pub struct ItemBackoff<K> {
    /// Delay for the first failure
    base: Duration,
    /// Upper bound for any delay
    max: Duration,
    /// Consecutive failures per item
    failures: HashMap<K, u32>,
}

impl<K> ItemBackoff<K>
where
    K: Eq + Hash + Clone,
{
    /// Create a backoff with the given base delay and cap
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Get the delay for the next retry of `item` and record the failure
    pub fn next_delay(&mut self, item: &K) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let delay = Self::calculate_for_failures(*failures, self.base, self.max);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Clear the failure history of `item`
    pub fn forget(&mut self, item: &K) {
        self.failures.remove(item);
    }

    /// Number of consecutive failures recorded for `item`
    #[must_use]
    pub fn failures(&self, item: &K) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    /// Calculate the delay after `failures` consecutive failures (stateless)
    ///
    /// `base * 2^failures`, capped at `max`. Overflow saturates to `max`.
    #[must_use]
    pub fn calculate_for_failures(failures: u32, base: Duration, max: Duration) -> Duration {
        let factor = 2u32.checked_pow(failures);
        match factor.and_then(|f| base.checked_mul(f)) {
            Some(delay) => delay.min(max),
            None => max,
        }
    }
}

impl<K> Default for ItemBackoff<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(40));
        assert_eq!(backoff.failures(&"a"), 4);
    }

    #[test]
    fn test_max_cap() {
        let mut backoff = ItemBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.next_delay(&"a"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_secs(8));
        // Next would be 16s, capped at 10s
        assert_eq!(backoff.next_delay(&"a"), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_secs(10));
    }

    #[test]
    fn test_forget_resets() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1));

        backoff.next_delay(&"a");
        backoff.next_delay(&"a");
        backoff.next_delay(&"a");
        backoff.forget(&"a");

        assert_eq!(backoff.failures(&"a"), 0);
        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn test_items_are_independent() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1));

        backoff.next_delay(&"a");
        backoff.next_delay(&"a");

        assert_eq!(backoff.next_delay(&"b"), Duration::from_millis(5));
        assert_eq!(backoff.failures(&"a"), 2);
    }

    #[test]
    fn test_overflow_saturates_to_max() {
        let max = Duration::from_secs(1000);
        assert_eq!(
            ItemBackoff::<&str>::calculate_for_failures(64, Duration::from_millis(5), max),
            max
        );
        assert_eq!(
            ItemBackoff::<&str>::calculate_for_failures(u32::MAX, Duration::from_millis(5), max),
            max
        );
    }
}
