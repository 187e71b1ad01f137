//! Monotonic sequence counters for transaction and write-order IDs.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide monotonic 64-bit counter.
///
/// Two instances drive the channel: one issues transaction IDs, the other
/// write-order IDs (the global ordering stamped on every log record and on
/// each checkpoint). After replay both are seeded to the highest value
/// observed in any log or checkpoint, so every subsequently issued ID is
/// strictly greater than every persisted one. That guarantee is what makes
/// the next replay's "newer than the last checkpoint" test sound.
///
/// Instances are passed explicitly to the queue and the replay engine so
/// tests can run in parallel with isolated state.
#[derive(Debug, Default)]
pub struct SequenceOracle {
    counter: AtomicU64,
}

impl SequenceOracle {
    /// Creates an oracle starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next ID.
    #[must_use = "an issued ID must be used; skipping one widens the gap for no reason"]
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raises the counter to `value` if it is currently lower.
    ///
    /// Only replay calls this; the counter never moves backwards.
    pub fn set_seed(&self, value: u64) {
        self.counter.fetch_max(value, Ordering::SeqCst);
    }
}
