//! Transaction log records and their replay ordering.

use std::cmp::Ordering;

/// Which flavor of staged work a COMMIT record finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// The transaction's staged puts become visible.
    Put,
    /// The transaction's staged takes are consumed.
    Take,
}

/// Operation described by a single log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// An event was appended. The event pointer is the location of this
    /// very record in its log file.
    Put,
    /// An event was consumed. Carries an explicit pointer back to the
    /// original put, which may live in a different log file.
    Take {
        /// Log file holding the taken event.
        file_id: u32,
        /// Offset of the taken event's put record.
        offset: u32,
    },
    /// The transaction's staged operations take effect.
    Commit {
        /// Whether puts or takes are being committed.
        committed: CommitKind,
    },
    /// The transaction's staged operations are discarded.
    Rollback,
}

/// One unit of the transaction log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRecord {
    /// The transaction this record belongs to.
    pub transaction_id: u64,
    /// Globally monotonic sequence number; defines the total replay order
    /// across all log files.
    pub write_order_id: u64,
    /// What the record describes.
    pub kind: RecordKind,
}

impl TransactionRecord {
    /// A put record.
    #[must_use]
    pub fn put(transaction_id: u64, write_order_id: u64) -> Self {
        Self {
            transaction_id,
            write_order_id,
            kind: RecordKind::Put,
        }
    }

    /// A take record referencing the put at `(file_id, offset)`.
    #[must_use]
    pub fn take(transaction_id: u64, write_order_id: u64, file_id: u32, offset: u32) -> Self {
        Self {
            transaction_id,
            write_order_id,
            kind: RecordKind::Take { file_id, offset },
        }
    }

    /// A commit of the transaction's staged puts.
    #[must_use]
    pub fn commit_put(transaction_id: u64, write_order_id: u64) -> Self {
        Self {
            transaction_id,
            write_order_id,
            kind: RecordKind::Commit {
                committed: CommitKind::Put,
            },
        }
    }

    /// A commit of the transaction's staged takes.
    #[must_use]
    pub fn commit_take(transaction_id: u64, write_order_id: u64) -> Self {
        Self {
            transaction_id,
            write_order_id,
            kind: RecordKind::Commit {
                committed: CommitKind::Take,
            },
        }
    }

    /// A rollback record.
    #[must_use]
    pub fn rollback(transaction_id: u64, write_order_id: u64) -> Self {
        Self {
            transaction_id,
            write_order_id,
            kind: RecordKind::Rollback,
        }
    }
}

/// A record together with the location it was read from.
///
/// For puts the location *is* the event pointer; for everything else it
/// only serves diagnostics and the merge tie-break.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord {
    /// ID of the log file the record was read from.
    pub file_id: u32,
    /// Offset of the record's frame within that file.
    pub offset: u32,
    /// The decoded record.
    pub record: TransactionRecord,
}

impl Eq for LogRecord {}

impl PartialEq for LogRecord {
    fn eq(&self, other: &Self) -> bool {
        self.record.write_order_id == other.record.write_order_id
            && self.file_id == other.file_id
            && self.offset == other.offset
    }
}

impl Ord for LogRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        // Write order is globally unique; ties can only come from damaged
        // logs and are broken by location for a deterministic merge.
        match self.record.write_order_id.cmp(&other.record.write_order_id) {
            Ordering::Equal => match self.file_id.cmp(&other.file_id) {
                Ordering::Equal => self.offset.cmp(&other.offset),
                ord => ord,
            },
            ord => ord,
        }
    }
}

impl PartialOrd for LogRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(write_order_id: u64, file_id: u32, offset: u32) -> LogRecord {
        LogRecord {
            file_id,
            offset,
            record: TransactionRecord::put(1, write_order_id),
        }
    }

    #[test]
    fn test_ordered_by_write_order() {
        assert!(entry(10, 9, 0) < entry(11, 1, 0));
    }

    #[test]
    fn test_ties_broken_by_file_then_offset() {
        assert!(entry(10, 1, 50) < entry(10, 2, 0));
        assert!(entry(10, 1, 50) < entry(10, 1, 60));
    }

    #[test]
    fn test_min_heap_yields_global_write_order() {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut heap = BinaryHeap::new();
        for entry in [entry(30, 1, 0), entry(10, 2, 0), entry(20, 3, 0)] {
            heap.push(Reverse(entry));
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|Reverse(e)| e.record.write_order_id)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }
}
