//! Reference counts of log files that still hold live events.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::QueueError;

/// Maximum number of log files that may hold live events at once.
/// Fixed by the checkpoint header layout.
pub const MAX_ACTIVE_LOGS: usize = 1024;

/// Tracks, per log file ID, how many pointers in the queue refer to it.
///
/// The log janitor deletes only files with no entry here; the table is
/// persisted in the checkpoint header so that decision survives restarts.
/// Each entry encodes for persistence as `(file_id << 32) | refcount`,
/// the same packing the ring uses for pointers.
#[derive(Debug, Default, Clone)]
pub struct ActiveFileTable {
    counts: BTreeMap<u32, u32>,
}

impl ActiveFileTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records one more live pointer into `file_id`, creating the entry if
    /// absent. Fails when a new entry would exceed [`MAX_ACTIVE_LOGS`].
    pub(crate) fn increment(&mut self, file_id: u32) -> Result<(), QueueError> {
        if let Some(count) = self.counts.get_mut(&file_id) {
            *count += 1;
            return Ok(());
        }
        if self.counts.len() == MAX_ACTIVE_LOGS {
            return Err(QueueError::TooManyActiveLogs {
                max: MAX_ACTIVE_LOGS,
            });
        }
        self.counts.insert(file_id, 1);
        Ok(())
    }

    /// Records the removal of a live pointer into `file_id`, dropping the
    /// entry when its count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics when no entry exists: the queue and the table have diverged,
    /// which is an internal invariant violation.
    pub(crate) fn decrement(&mut self, file_id: u32) {
        let Some(count) = self.counts.get_mut(&file_id) else {
            panic!("no reference count for log file {file_id}; queue and table are out of sync");
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&file_id);
        }
    }

    /// Restores an entry from its persisted slot encoding.
    #[allow(clippy::cast_possible_truncation)] // splitting the packed halves
    pub(crate) fn restore(&mut self, encoded: u64) {
        let file_id = (encoded >> 32) as u32;
        let count = encoded as u32;
        self.counts.insert(file_id, count);
    }

    /// Entries in persisted slot encoding, ascending by file ID.
    pub(crate) fn encoded(&self) -> impl Iterator<Item = u64> + '_ {
        self.counts
            .iter()
            .map(|(file_id, count)| (u64::from(*file_id) << 32) | u64::from(*count))
    }

    /// IDs of all log files with at least one live pointer, ascending.
    #[must_use]
    pub fn file_ids(&self) -> BTreeSet<u32> {
        self.counts.keys().copied().collect()
    }

    /// Live-pointer count for `file_id`, zero if absent.
    #[must_use]
    pub fn count(&self, file_id: u32) -> u32 {
        self.counts.get(&file_id).copied().unwrap_or(0)
    }

    /// Per-file counts, ascending by file ID.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<u32, u32> {
        self.counts.clone()
    }

    /// Number of active log files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no log file holds live events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
