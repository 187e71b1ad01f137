//! # Sluice Channel
//!
//! Durable transactional event queue for a file-backed channel.
//!
//! A channel accepts producer transactions that append events and consumer
//! transactions that remove them, with at-least-once delivery across
//! process crashes. This crate is the durable core behind that contract:
//!
//! - [`IndexQueue`] — a fixed-capacity circular index of event pointers in
//!   a memory-mapped checkpoint file, persisted under a two-phase marker
//!   protocol.
//! - [`ReplayEngine`] — rebuilds the in-memory queue after a restart by
//!   merging the transaction logs into one stream ordered by write-order
//!   ID and reconciling commits against the last checkpoint.
//! - [`SequenceOracle`] — the monotonic counters behind transaction and
//!   write-order IDs, reseeded during replay so new IDs always exceed
//!   persisted ones.
//!
//! [`ChannelCore::open`] runs the whole startup sequence and hands back a
//! live queue.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Log-file reference counts persisted with the checkpoint.
pub mod active_files;

/// Startup driver: open the checkpoint, replay the logs.
pub mod channel;

/// Channel configuration.
pub mod config;

/// Error types.
pub mod error;

/// Transaction log codec, writer, and sequential reader.
pub mod log;

/// Monotonic ID counters.
pub mod oracle;

/// Event pointers.
pub mod pointer;

/// The memory-mapped index queue.
pub mod queue;

/// Log record model and replay ordering.
pub mod record;

/// Log replay into the queue.
pub mod replay;

pub use active_files::{ActiveFileTable, MAX_ACTIVE_LOGS};
pub use channel::ChannelCore;
pub use config::ChannelConfig;
pub use error::{LogError, QueueError, ReplayError};
pub use log::{LogWriter, ReadOutcome, SequentialReader};
pub use oracle::SequenceOracle;
pub use pointer::EventPointer;
pub use queue::{IndexQueue, HEADER_SIZE};
pub use record::{CommitKind, LogRecord, RecordKind, TransactionRecord};
pub use replay::{collect_log_files, ReplayEngine, ReplayStats};
