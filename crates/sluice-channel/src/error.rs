//! Error types for the durable event queue.

use std::path::PathBuf;

use crate::pointer::EventPointer;

/// Errors from checkpoint-file operations on the
/// [`IndexQueue`](crate::queue::IndexQueue).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// I/O failure against the checkpoint file or its mapping.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The previous checkpoint never reached its completion marker.
    ///
    /// The file cannot be trusted; the operator must delete it so the next
    /// start rebuilds the index from the logs alone.
    #[error(
        "the last checkpoint of {path} was not completed correctly; \
         delete the checkpoint file to rebuild it from the logs and start again"
    )]
    CorruptCheckpoint {
        /// Path of the rejected checkpoint file.
        path: PathBuf,
    },

    /// The checkpoint file's size disagrees with the configured capacity.
    #[error(
        "capacity cannot be changed once the channel is initialized: \
         {path} holds {file_slots} slots, expected {expected_slots}"
    )]
    CapacityMismatch {
        /// Path of the checkpoint file.
        path: PathBuf,
        /// Number of 8-byte slots the file actually holds.
        file_slots: u64,
        /// Number of slots the configured capacity requires.
        expected_slots: u64,
    },

    /// The checkpoint file was written by an incompatible format version.
    #[error("unsupported checkpoint version {found} in {path}")]
    UnsupportedVersion {
        /// Path of the checkpoint file.
        path: PathBuf,
        /// Version found in the header.
        found: u64,
    },

    /// The active-file table is full; no further log file can hold live
    /// events. Indicates misconfiguration (too many tiny logs).
    #[error("too many active log files: at most {max} log files may hold live events")]
    TooManyActiveLogs {
        /// The fixed table limit.
        max: usize,
    },
}

/// Errors from reading or writing transaction log files.
///
/// Torn trailing frames and checksum mismatches are *not* errors; they are
/// ordinary [`ReadOutcome`](crate::log::ReadOutcome) variants, because a
/// crash during append legitimately truncates the tail of a log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// I/O failure against a log file.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file carries the wrong magic number or format version.
    #[error("{path} is not a transaction log: {reason}")]
    BadHeader {
        /// Path of the rejected file.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },

    /// The file ends inside its own header; it was truncated before the
    /// first record could be written.
    #[error("log file {path} ends inside the file header")]
    TruncatedHeader {
        /// Path of the truncated file.
        path: PathBuf,
    },

    /// A record carries a type tag this version does not know.
    /// The data on disk is incompatible with this implementation.
    #[error("unknown record type {tag:#06x} in log file {file_id} at offset {offset}")]
    UnknownRecordType {
        /// The unrecognized tag.
        tag: u16,
        /// ID of the log file the record was read from.
        file_id: u32,
        /// Offset of the record frame.
        offset: u32,
    },

    /// A checksum-valid frame did not decode to a whole record.
    #[error("malformed record in log file {file_id} at offset {offset}: {reason}")]
    MalformedRecord {
        /// ID of the log file the record was read from.
        file_id: u32,
        /// Offset of the record frame.
        offset: u32,
        /// What was missing or inconsistent.
        reason: String,
    },
}

/// Errors from replaying transaction logs into the queue.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// A queue operation failed while applying a committed record.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A log file could not be read.
    #[error(transparent)]
    Log(#[from] LogError),

    /// I/O failure while enumerating log directories.
    #[error("I/O error while enumerating log files: {0}")]
    Io(#[from] std::io::Error),

    /// Two log files claim the same file ID.
    #[error("log file {path} reuses file id {file_id} of a log that is already being replayed")]
    DuplicateLogFile {
        /// The duplicated log file ID.
        file_id: u32,
        /// Path of the second file claiming it.
        path: PathBuf,
    },

    /// A committed put did not fit into the queue. The configured capacity
    /// is smaller than the backlog recorded in the logs.
    #[error("queue is full at capacity {capacity}; cannot replay committed put {pointer}")]
    QueueFull {
        /// The pointer that could not be added.
        pointer: EventPointer,
        /// The queue capacity.
        capacity: usize,
    },
}
