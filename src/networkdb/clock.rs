use std::sync::atomic::{AtomicU64, Ordering};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A point in Lamport time.
#[derive(
    Clone, Copy, Debug, Default, Decode, Encode, Deserialize, Serialize, PartialEq, Eq, PartialOrd,
    Ord, Hash,
)]
pub struct LamportTime(pub u64);

impl LamportTime {
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The next tick after this one.
    pub fn next(&self) -> LamportTime {
        LamportTime(self.0 + 1)
    }
}

impl From<u64> for LamportTime {
    fn from(t: u64) -> Self {
        LamportTime(t)
    }
}

impl std::fmt::Display for LamportTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LamportClock orders events within one scope (network or table events)
/// without a shared wall clock.
///
/// Local events `increment` the clock; every inbound event is `witness`ed so
/// the next local event is ordered after everything observed so far.
#[derive(Debug)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Current time, without advancing.
    pub fn time(&self) -> LamportTime {
        LamportTime(self.counter.load(Ordering::SeqCst))
    }

    /// Advance the clock for a locally originated event and return the new time.
    pub fn increment(&self) -> LamportTime {
        LamportTime(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Raise the clock past an observed remote time. Never lowers it.
    pub fn witness(&self, observed: LamportTime) {
        // The next local event must come strictly after anything witnessed
        let target = observed.0.saturating_add(1);
        self.counter.fetch_max(target, Ordering::SeqCst);
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_starts_at_zero() {
        let clock = LamportClock::new();
        assert_eq!(clock.time(), LamportTime(0));
    }

    #[test]
    fn test_increment_returns_new_time() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), LamportTime(1));
        assert_eq!(clock.increment(), LamportTime(2));
        assert_eq!(clock.time(), LamportTime(2));
    }

    #[test]
    fn test_witness_raises_clock() {
        let clock = LamportClock::new();
        clock.witness(LamportTime(10));
        assert_eq!(clock.time(), LamportTime(11));

        // A local event after witnessing is strictly newer
        assert!(clock.increment() > LamportTime(10));
    }

    #[test]
    fn test_witness_never_lowers_clock() {
        let clock = LamportClock::new();
        for _ in 0..20 {
            clock.increment();
        }
        let before = clock.time();
        clock.witness(LamportTime(3));
        assert_eq!(clock.time(), before);
    }

    #[test]
    fn test_witness_is_idempotent() {
        let clock = LamportClock::new();
        clock.witness(LamportTime(7));
        clock.witness(LamportTime(7));
        assert_eq!(clock.time(), LamportTime(8));
    }

    #[test]
    fn test_concurrent_increments_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..100).map(|_| clock.increment()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for t in handle.join().unwrap() {
                assert!(seen.insert(t));
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
