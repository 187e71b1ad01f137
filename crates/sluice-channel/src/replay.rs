//! Replays transaction logs into the index queue after a restart.
//!
//! The queue's checkpoint is a consistent snapshot as of its stamped
//! write-order ID; everything the logs recorded after that stamp is
//! reapplied here. Because a channel can span multiple log directories,
//! the records of one transaction may be spread across files — in
//! particular, the commit of a take can appear in the stream *before* the
//! commit of the put it consumes. The engine therefore merges all logs
//! into one stream ordered by write-order ID and reconciles such takes
//! through a pending list.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::{LogError, ReplayError};
use crate::log::{ReadOutcome, SequentialReader};
use crate::oracle::SequenceOracle;
use crate::pointer::EventPointer;
use crate::queue::IndexQueue;
use crate::record::{CommitKind, LogRecord, RecordKind};

/// Counters describing one replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records read across all logs, including skipped ones.
    pub read: u64,
    /// Put records newer than the checkpoint.
    pub puts: u64,
    /// Take records newer than the checkpoint.
    pub takes: u64,
    /// Rollback records newer than the checkpoint.
    pub rollbacks: u64,
    /// Commit records newer than the checkpoint.
    pub commits: u64,
    /// Records at or below the checkpoint's write-order ID.
    pub skipped: u64,
    /// Staged pointers applied to the queue by commits.
    pub applied: u64,
    /// Committed takes whose put never committed; each one means a
    /// duplicate may reach the destination.
    pub pending_takes: u64,
}

/// Replays a set of transaction logs into a borrowed [`IndexQueue`].
///
/// Runs single-threaded before the queue goes online. The engine owns the
/// log readers it opens; they are closed on every exit path. Both oracles
/// are seeded from every record decoded — even on a failed run — so that
/// IDs issued afterwards exceed everything already on disk.
pub struct ReplayEngine<'a> {
    queue: &'a IndexQueue,
    transaction_ids: &'a SequenceOracle,
    write_orders: &'a SequenceOracle,
    last_checkpoint: u64,
    readers: HashMap<u32, SequentialReader>,
    heap: BinaryHeap<Reverse<LogRecord>>,
    /// Committed takes seen before their committing put, stored packed.
    /// Filled by commit-take processing, drained by commit-put processing.
    pending_takes: Vec<u64>,
}

/// Accumulates the highest IDs seen during a run.
#[derive(Default, Clone, Copy)]
struct SeedAccumulator {
    transaction_id: u64,
    write_order_id: u64,
}

impl SeedAccumulator {
    fn observe(&mut self, transaction_id: u64, write_order_id: u64) {
        self.transaction_id = self.transaction_id.max(transaction_id);
        self.write_order_id = self.write_order_id.max(write_order_id);
    }
}

impl<'a> ReplayEngine<'a> {
    /// Creates an engine replaying into `queue`, seeding the given oracles.
    ///
    /// The replay window starts at the queue's checkpointed write-order ID.
    #[must_use]
    pub fn new(
        queue: &'a IndexQueue,
        transaction_ids: &'a SequenceOracle,
        write_orders: &'a SequenceOracle,
    ) -> Self {
        Self {
            queue,
            transaction_ids,
            write_orders,
            last_checkpoint: queue.log_write_order_id(),
            readers: HashMap::new(),
            heap: BinaryHeap::new(),
            pending_takes: Vec::new(),
        }
    }

    /// Replays `logs` merged into one stream by write-order ID.
    ///
    /// # Errors
    ///
    /// Returns an error on unreadable records, duplicate log file IDs, or
    /// queue failures. Torn log tails are tolerated with a warning. Even on
    /// failure the oracles are seeded from what was read.
    pub fn replay(&mut self, logs: &[PathBuf]) -> Result<ReplayStats, ReplayError> {
        info!(logs = logs.len(), "starting replay");
        let mut stats = ReplayStats::default();
        // The checkpoint stamp itself counts as observed: records skipped by
        // the readers are all at or below it.
        let mut seeds = SeedAccumulator {
            transaction_id: 0,
            write_order_id: self.last_checkpoint,
        };

        let result = self.replay_merged(logs, &mut stats, &mut seeds);
        self.finish(seeds);
        result?;

        stats.pending_takes = self.pending_takes.len() as u64;
        self.warn_pending_takes();
        Ok(stats)
    }

    /// Replays each log end-to-end on its own, in the order given.
    ///
    /// Retained for old logs whose write-order IDs cannot be trusted across
    /// files. For well-formed inputs the outcome matches [`Self::replay`]:
    /// staged transactions and pending takes carry across files, and the
    /// oracles are seeded the same way.
    ///
    /// # Errors
    ///
    /// As for [`Self::replay`].
    #[deprecated(note = "single-pass replay for logs predating reliable write order; use `replay`")]
    pub fn replay_legacy(&mut self, logs: &[PathBuf]) -> Result<ReplayStats, ReplayError> {
        info!(logs = logs.len(), "starting legacy replay");
        let mut stats = ReplayStats::default();
        let mut seeds = SeedAccumulator {
            transaction_id: 0,
            write_order_id: self.last_checkpoint,
        };

        let result = self.replay_per_file(logs, &mut stats, &mut seeds);
        self.finish(seeds);
        result?;

        stats.pending_takes = self.pending_takes.len() as u64;
        self.warn_pending_takes();
        Ok(stats)
    }

    fn replay_merged(
        &mut self,
        logs: &[PathBuf],
        stats: &mut ReplayStats,
        seeds: &mut SeedAccumulator,
    ) -> Result<(), ReplayError> {
        for log in logs {
            info!(path = %log.display(), "replaying");
            let Some(mut reader) = self.open_log(log, stats, seeds)? else {
                continue;
            };
            let file_id = reader.log_file_id();
            if self.readers.contains_key(&file_id) {
                return Err(ReplayError::DuplicateLogFile {
                    file_id,
                    path: log.clone(),
                });
            }
            match reader.next()? {
                ReadOutcome::Record(entry) => {
                    self.heap.push(Reverse(entry));
                    self.readers.insert(file_id, reader);
                }
                ReadOutcome::Eof => {}
                ReadOutcome::TornWrite { position, reason } => {
                    warn!(path = %log.display(), position, reason = %reason, "ignoring torn log tail");
                }
                ReadOutcome::ChecksumMismatch { position } => {
                    warn!(path = %log.display(), position, "ignoring log tail with bad checksum");
                }
            }
        }

        let mut staged: HashMap<u64, Vec<EventPointer>> = HashMap::new();
        while let Some(entry) = self.next_merged()? {
            seeds.observe(entry.record.transaction_id, entry.record.write_order_id);
            stats.read += 1;
            if entry.record.write_order_id > self.last_checkpoint {
                stats.applied += self.apply_record(entry, &mut staged, stats)?;
            } else {
                stats.skipped += 1;
            }
        }

        info!(
            read = stats.read,
            puts = stats.puts,
            takes = stats.takes,
            rollbacks = stats.rollbacks,
            commits = stats.commits,
            skipped = stats.skipped,
            applied = stats.applied,
            "replay complete"
        );
        Ok(())
    }

    fn replay_per_file(
        &mut self,
        logs: &[PathBuf],
        stats: &mut ReplayStats,
        seeds: &mut SeedAccumulator,
    ) -> Result<(), ReplayError> {
        let mut staged: HashMap<u64, Vec<EventPointer>> = HashMap::new();
        for log in logs {
            info!(path = %log.display(), "replaying");
            let Some(mut reader) = self.open_log(log, stats, seeds)? else {
                continue;
            };
            let mut applied_here = 0_u64;
            loop {
                match reader.next()? {
                    ReadOutcome::Record(entry) => {
                        seeds.observe(entry.record.transaction_id, entry.record.write_order_id);
                        stats.read += 1;
                        if entry.record.write_order_id > self.last_checkpoint {
                            applied_here += self.apply_record(entry, &mut staged, stats)?;
                        } else {
                            stats.skipped += 1;
                        }
                    }
                    ReadOutcome::Eof => break,
                    ReadOutcome::TornWrite { position, reason } => {
                        warn!(path = %log.display(), position, reason = %reason, "hit torn tail");
                        break;
                    }
                    ReadOutcome::ChecksumMismatch { position } => {
                        warn!(path = %log.display(), position, "hit bad checksum");
                        break;
                    }
                }
            }
            info!(applied = applied_here, path = %log.display(), "replayed log");
            stats.applied += applied_here;
        }
        Ok(())
    }

    /// Opens a log and fast-forwards past checkpointed records. Returns
    /// `None` for logs that are truncated at birth or already exhausted by
    /// the skip — both tolerated with a warning.
    fn open_log(
        &mut self,
        log: &Path,
        stats: &mut ReplayStats,
        seeds: &mut SeedAccumulator,
    ) -> Result<Option<SequentialReader>, ReplayError> {
        let mut reader = match SequentialReader::open(log) {
            Ok(reader) => reader,
            Err(LogError::TruncatedHeader { path }) => {
                warn!(path = %path.display(), "ignoring log truncated inside its header");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let skipped = reader.skip_to_last_checkpoint_position(self.last_checkpoint)?;
        stats.read += skipped;
        stats.skipped += skipped;
        // Records consumed by the skip still count as observed.
        seeds.observe(
            reader.highest_transaction_id(),
            reader.highest_write_order_id(),
        );
        Ok(Some(reader))
    }

    /// Pops the globally next record and advances the reader it came from.
    fn next_merged(&mut self) -> Result<Option<LogRecord>, ReplayError> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(reader) = self.readers.get_mut(&entry.file_id) {
            match reader.next()? {
                ReadOutcome::Record(next) => self.heap.push(Reverse(next)),
                ReadOutcome::Eof => {
                    debug!(file_id = entry.file_id, "log exhausted");
                    self.readers.remove(&entry.file_id);
                }
                ReadOutcome::TornWrite { position, reason } => {
                    warn!(
                        file_id = entry.file_id,
                        position,
                        reason = %reason,
                        "closing log at torn tail"
                    );
                    self.readers.remove(&entry.file_id);
                }
                ReadOutcome::ChecksumMismatch { position } => {
                    warn!(
                        file_id = entry.file_id,
                        position, "closing log at bad checksum"
                    );
                    self.readers.remove(&entry.file_id);
                }
            }
        }
        Ok(Some(entry))
    }

    /// Stages puts and takes, discards on rollback, applies on commit.
    /// Returns how many staged pointers the record applied.
    fn apply_record(
        &mut self,
        entry: LogRecord,
        staged: &mut HashMap<u64, Vec<EventPointer>>,
        stats: &mut ReplayStats,
    ) -> Result<u64, ReplayError> {
        let record = entry.record;
        match record.kind {
            RecordKind::Put => {
                stats.puts += 1;
                staged
                    .entry(record.transaction_id)
                    .or_default()
                    .push(EventPointer::new(entry.file_id, entry.offset));
                Ok(0)
            }
            RecordKind::Take { file_id, offset } => {
                stats.takes += 1;
                staged
                    .entry(record.transaction_id)
                    .or_default()
                    .push(EventPointer::new(file_id, offset));
                Ok(0)
            }
            RecordKind::Rollback => {
                stats.rollbacks += 1;
                staged.remove(&record.transaction_id);
                Ok(0)
            }
            RecordKind::Commit { committed } => {
                stats.commits += 1;
                match staged.remove(&record.transaction_id) {
                    Some(pointers) if !pointers.is_empty() => {
                        self.process_commit(committed, &pointers)?;
                        Ok(pointers.len() as u64)
                    }
                    _ => Ok(0),
                }
            }
        }
    }

    /// Applies a commit's staged pointers to the queue.
    ///
    /// A committed put goes to the tail; if its pointer was already taken
    /// (the take's commit sorted earlier in the stream), the add is undone
    /// immediately and the pending take is settled. A committed take whose
    /// pointer is not in the queue joins the pending list — its put must
    /// still be ahead of us.
    fn process_commit(
        &mut self,
        kind: CommitKind,
        pointers: &[EventPointer],
    ) -> Result<(), ReplayError> {
        match kind {
            CommitKind::Put => {
                for &pointer in pointers {
                    if !self.queue.add_tail(pointer)? {
                        return Err(ReplayError::QueueFull {
                            pointer,
                            capacity: self.queue.capacity(),
                        });
                    }
                    if let Some(found) = self
                        .pending_takes
                        .iter()
                        .position(|&packed| packed == pointer.as_u64())
                    {
                        self.pending_takes.remove(found);
                        assert!(
                            self.queue.remove(pointer),
                            "take was pending and pointer {pointer} was added \
                             to the queue but could not be removed"
                        );
                    }
                }
            }
            CommitKind::Take => {
                for &pointer in pointers {
                    if !self.queue.remove(pointer) {
                        self.pending_takes.push(pointer.as_u64());
                    }
                }
            }
        }
        Ok(())
    }

    /// Seeds the oracles and closes all remaining readers. Runs on every
    /// exit path, successful or not.
    fn finish(&mut self, seeds: SeedAccumulator) {
        self.transaction_ids.set_seed(seeds.transaction_id);
        self.write_orders.set_seed(seeds.write_order_id);
        self.readers.clear();
        self.heap.clear();
    }

    fn warn_pending_takes(&self) {
        if self.pending_takes.is_empty() {
            return;
        }
        error!(
            count = self.pending_takes.len(),
            "pending takes exist after the end of replay; \
             duplicate events will exist in the destination"
        );
        for &packed in &self.pending_takes {
            debug!(pointer = %EventPointer::from_u64(packed), "pending take");
        }
    }
}

/// Collects `log-<fileID>` files from the given directories, sorted by
/// file name for a stable startup order. The replay outcome does not
/// depend on this order; the sort only steadies the logs.
///
/// # Errors
///
/// Returns an error when a directory cannot be read.
pub fn collect_log_files(dirs: &[PathBuf]) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut logs = Vec::new();
    for dir in dirs {
        for dir_entry in std::fs::read_dir(dir)? {
            let path = dir_entry?.path();
            let is_log = path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("log-"));
            if is_log {
                logs.push(path);
            }
        }
    }
    logs.sort();
    Ok(logs)
}
