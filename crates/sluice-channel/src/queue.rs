//! The persistent index queue: a fixed-capacity circular array of event
//! pointers in a memory-mapped checkpoint file.
//!
//! ## Disk Layout
//!
//! One contiguous array of 8-byte slots, read and written in the
//! platform's native byte order through the mapping:
//!
//! ```text
//! slot 0                 VERSION            (current = 2)
//! slot 1                 WRITE_ORDER_ID     at the last completed checkpoint
//! slot 2                 SIZE               logical queue size
//! slot 3                 HEAD               physical index of logical element 0
//! slot 4                 CHECKPOINT_MARKER  0 = complete, 1 = in progress
//! slots 5..1029          active-log table   (file_id << 32) | refcount, 0 = empty
//! slots 1029..1029+cap   ring buffer        event pointers, 0 = empty
//! ```
//!
//! ## Durability
//!
//! Ring-slot writes between checkpoints are staged in an in-memory overlay;
//! the mapped file is mutated only inside [`IndexQueue::checkpoint`], under
//! the two-phase marker protocol. A reader therefore finds the file either
//! at the previous complete checkpoint or flagged incomplete — never
//! silently half-written. Whatever was staged but not checkpointed is
//! reconstructed by log replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::active_files::{ActiveFileTable, MAX_ACTIVE_LOGS};
use crate::config::ChannelConfig;
use crate::error::QueueError;
use crate::oracle::SequenceOracle;
use crate::pointer::EventPointer;

/// Checkpoint format version.
const VERSION: u64 = 2;
/// The empty-slot sentinel.
const EMPTY: u64 = 0;

const INDEX_VERSION: usize = 0;
const INDEX_WRITE_ORDER_ID: usize = 1;
const INDEX_SIZE: usize = 2;
const INDEX_HEAD: usize = 3;
const INDEX_CHECKPOINT_MARKER: usize = 4;
const INDEX_ACTIVE_LOG: usize = 5;

const CHECKPOINT_COMPLETE: u64 = 0;
const CHECKPOINT_INCOMPLETE: u64 = 1;

/// Header size in slots: five fixed fields plus the active-log table.
pub const HEADER_SIZE: usize = INDEX_ACTIVE_LOG + MAX_ACTIVE_LOGS;

const SLOT_BYTES: usize = 8;

fn slot_get(mmap: &MmapMut, slot: usize) -> u64 {
    let byte = slot * SLOT_BYTES;
    let mut buf = [0_u8; SLOT_BYTES];
    buf.copy_from_slice(&mmap[byte..byte + SLOT_BYTES]);
    u64::from_ne_bytes(buf)
}

fn slot_put(mmap: &mut MmapMut, slot: usize, value: u64) {
    let byte = slot * SLOT_BYTES;
    mmap[byte..byte + SLOT_BYTES].copy_from_slice(&value.to_ne_bytes());
}

/// The capacity a checkpoint file of `file_len` bytes was created with,
/// or `None` if the length cannot belong to a checkpoint file.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // slot counts fit usize on supported targets
pub fn capacity_for(file_len: u64) -> Option<usize> {
    if file_len % SLOT_BYTES as u64 != 0 {
        return None;
    }
    let slots = (file_len / SLOT_BYTES as u64) as usize;
    slots.checked_sub(HEADER_SIZE).filter(|capacity| *capacity > 0)
}

/// Fixed-capacity circular index of event pointers, backed by a
/// memory-mapped checkpoint file.
///
/// A single logical writer mutates the queue; every operation takes the
/// instance's one exclusive lock, so derived state (`size`, `file_ids`)
/// may be read from any thread.
#[derive(Debug)]
pub struct IndexQueue {
    inner: Mutex<QueueState>,
    capacity: usize,
    path: PathBuf,
    name: String,
    write_orders: Arc<SequenceOracle>,
}

#[derive(Debug)]
struct QueueState {
    mmap: MmapMut,
    /// Staged ring-slot writes, keyed by slot index. Reads consult this
    /// before the mapping; `checkpoint` drains it into the mapping.
    overlay: HashMap<usize, u64>,
    active_files: ActiveFileTable,
    capacity: usize,
    size: usize,
    head: usize,
    write_order_id: u64,
}

impl IndexQueue {
    /// Opens the checkpoint file named by `config`, creating and
    /// zero-filling it when absent.
    ///
    /// The write-order oracle stamps each completed checkpoint; it must be
    /// the same instance the log writers draw from.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::CapacityMismatch`] when an existing file does
    /// not match the configured capacity, [`QueueError::UnsupportedVersion`]
    /// for a foreign format, and [`QueueError::CorruptCheckpoint`] when the
    /// last checkpoint never completed (the operator must delete the file so
    /// replay can rebuild it from the logs alone).
    ///
    /// # Panics
    ///
    /// Panics when `config.capacity` is zero.
    pub fn open(
        config: &ChannelConfig,
        write_orders: Arc<SequenceOracle>,
    ) -> Result<Self, QueueError> {
        let capacity = config.capacity;
        assert!(capacity > 0, "capacity must be greater than zero");
        let path = config.checkpoint_path.clone();
        let expected_slots = (HEADER_SIZE + capacity) as u64;
        let expected_bytes = expected_slots * SLOT_BYTES as u64;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let freshly_allocated = file_len == 0;
        if freshly_allocated {
            info!(
                channel = %config.name,
                path = %path.display(),
                capacity,
                "checkpoint has zero allocation, initializing to capacity"
            );
            file.set_len(expected_bytes)?;
        } else if file_len != expected_bytes {
            return Err(QueueError::CapacityMismatch {
                path,
                file_slots: file_len / SLOT_BYTES as u64,
                expected_slots,
            });
        }

        // SAFETY: the file is created read-write above and the mapping is
        // owned by this queue instance for its whole lifetime; the channel
        // contract gives one process exclusive access to the checkpoint.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let state = if freshly_allocated {
            slot_put(&mut mmap, INDEX_VERSION, VERSION);
            QueueState {
                mmap,
                overlay: HashMap::new(),
                active_files: ActiveFileTable::new(),
                capacity,
                size: 0,
                head: 0,
                write_order_id: 0,
            }
        } else {
            let version = slot_get(&mmap, INDEX_VERSION);
            if version != VERSION {
                return Err(QueueError::UnsupportedVersion {
                    path,
                    found: version,
                });
            }
            if slot_get(&mmap, INDEX_CHECKPOINT_MARKER) != CHECKPOINT_COMPLETE {
                return Err(QueueError::CorruptCheckpoint { path });
            }

            let write_order_id = slot_get(&mmap, INDEX_WRITE_ORDER_ID);
            #[allow(clippy::cast_possible_truncation)] // bounded by capacity at write time
            let size = slot_get(&mmap, INDEX_SIZE) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let head = slot_get(&mmap, INDEX_HEAD) as usize;

            let mut active_files = ActiveFileTable::new();
            for slot in INDEX_ACTIVE_LOG..INDEX_ACTIVE_LOG + MAX_ACTIVE_LOGS {
                let encoded = slot_get(&mmap, slot);
                if encoded != EMPTY {
                    active_files.restore(encoded);
                }
            }

            QueueState {
                mmap,
                overlay: HashMap::new(),
                active_files,
                capacity,
                size,
                head,
                write_order_id,
            }
        };

        Ok(Self {
            inner: Mutex::new(state),
            capacity,
            path,
            name: config.name.clone(),
            write_orders,
        })
    }

    /// Adds a pointer at the head of the queue.
    ///
    /// Returns `Ok(false)` iff the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TooManyActiveLogs`] when the pointer's log
    /// file cannot be tracked.
    pub fn add_head(&self, pointer: EventPointer) -> Result<bool, QueueError> {
        let mut state = self.inner.lock();
        if state.size == self.capacity {
            return Ok(false);
        }
        state.active_files.increment(pointer.file_id())?;
        state.insert_at(0, pointer.as_u64());
        Ok(true)
    }

    /// Adds a pointer at the tail of the queue. Used on the recovery path,
    /// where replay re-appends committed puts in write order.
    ///
    /// Returns `Ok(false)` iff the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TooManyActiveLogs`] when the pointer's log
    /// file cannot be tracked.
    pub fn add_tail(&self, pointer: EventPointer) -> Result<bool, QueueError> {
        let mut state = self.inner.lock();
        if state.size == self.capacity {
            return Ok(false);
        }
        state.active_files.increment(pointer.file_id())?;
        let index = state.size;
        state.insert_at(index, pointer.as_u64());
        Ok(true)
    }

    /// Retrieves and removes the head of the queue, or `None` when empty.
    pub fn remove_head(&self) -> Option<EventPointer> {
        let mut state = self.inner.lock();
        if state.size == 0 {
            return None;
        }
        let value = state.remove_at(0);
        assert_ne!(value, EMPTY, "empty value at head of queue {}", self.name);
        let pointer = EventPointer::from_u64(value);
        state.active_files.decrement(pointer.file_id());
        Some(pointer)
    }

    /// Removes the first occurrence of `pointer` from the queue.
    ///
    /// Linear in the queue size; only the recovery path and the rare
    /// pending-take reconciliation call this.
    pub fn remove(&self, pointer: EventPointer) -> bool {
        let mut state = self.inner.lock();
        let value = pointer.as_u64();
        for index in 0..state.size {
            if state.get(index) == value {
                state.remove_at(index);
                state.active_files.decrement(pointer.file_id());
                return true;
            }
        }
        false
    }

    /// IDs of all log files that currently contribute at least one pointer,
    /// ascending. The log janitor must not delete any of these.
    #[must_use]
    pub fn file_ids(&self) -> BTreeSet<u32> {
        self.inner.lock().active_files.file_ids()
    }

    /// Per-file live-pointer counts, ascending by file ID.
    #[must_use]
    pub fn active_file_counts(&self) -> BTreeMap<u32, u32> {
        self.inner.lock().active_files.counts()
    }

    /// Logical queue size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Maximum event capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical ring index of logical element 0. Diagnostics only.
    #[must_use]
    pub fn head(&self) -> usize {
        self.inner.lock().head
    }

    /// Write-order ID stamped on the last completed checkpoint. Replay
    /// applies only records with a newer write-order ID.
    #[must_use]
    pub fn log_write_order_id(&self) -> u64 {
        self.inner.lock().write_order_id
    }

    /// Path of the backing checkpoint file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Raw ring contents in logical order, including empty slots.
    /// Diagnostics only (the checkpoint inspection tool).
    #[must_use]
    pub fn snapshot_ring(&self) -> Vec<u64> {
        let state = self.inner.lock();
        (0..state.capacity)
            .map(|index| {
                let slot = state.physical_slot(index);
                state
                    .overlay
                    .get(&slot)
                    .copied()
                    .unwrap_or_else(|| slot_get(&state.mmap, slot))
            })
            .collect()
    }

    /// Persists the in-memory index to the mapped file under the two-phase
    /// marker protocol.
    ///
    /// Returns `Ok(false)` when nothing is staged and `force` is off.
    ///
    /// The sequence is: mark the checkpoint incomplete, refresh the header
    /// (a fresh write-order ID, size, head), rewrite the active-log table,
    /// drain the staged ring writes, mark complete, then force the mapping
    /// to stable storage. A crash before the final marker write leaves the
    /// file flagged incomplete and the next open rejects it.
    ///
    /// # Errors
    ///
    /// Returns an error if forcing the mapping to disk fails.
    ///
    /// # Panics
    ///
    /// Panics if the overlay is not empty after draining, which would mean
    /// a concurrent writer bypassed the instance lock.
    pub fn checkpoint(&self, force: bool) -> Result<bool, QueueError> {
        let mut state = self.inner.lock();
        if state.overlay.is_empty() && !force {
            debug!(channel = %self.name, "checkpoint not required");
            return Ok(false);
        }

        // Start checkpoint.
        slot_put(&mut state.mmap, INDEX_CHECKPOINT_MARKER, CHECKPOINT_INCOMPLETE);

        state.write_order_id = self.write_orders.next();
        let write_order_id = state.write_order_id;
        let size = state.size as u64;
        let head = state.head as u64;
        slot_put(&mut state.mmap, INDEX_WRITE_ORDER_ID, write_order_id);
        slot_put(&mut state.mmap, INDEX_SIZE, size);
        slot_put(&mut state.mmap, INDEX_HEAD, head);
        debug!(
            channel = %self.name,
            write_order_id, size, head, "updating checkpoint headers"
        );

        let encoded: Vec<u64> = state.active_files.encoded().collect();
        for (offset, value) in encoded.iter().enumerate() {
            slot_put(&mut state.mmap, INDEX_ACTIVE_LOG + offset, *value);
        }
        for slot in INDEX_ACTIVE_LOG + encoded.len()..INDEX_ACTIVE_LOG + MAX_ACTIVE_LOGS {
            slot_put(&mut state.mmap, slot, EMPTY);
        }

        let staged: Vec<(usize, u64)> = state.overlay.drain().collect();
        for (slot, value) in staged {
            slot_put(&mut state.mmap, slot, value);
        }
        assert!(
            state.overlay.is_empty(),
            "concurrent update detected during checkpoint of queue {}",
            self.name
        );

        // Finish checkpoint.
        slot_put(&mut state.mmap, INDEX_CHECKPOINT_MARKER, CHECKPOINT_COMPLETE);
        state.mmap.flush()?;

        Ok(true)
    }
}

impl QueueState {
    fn physical_slot(&self, index: usize) -> usize {
        HEADER_SIZE + (self.head + index) % self.capacity
    }

    fn get(&self, index: usize) -> u64 {
        assert!(
            index < self.size,
            "index {index} out of bounds for queue of size {}",
            self.size
        );
        let slot = self.physical_slot(index);
        match self.overlay.get(&slot) {
            Some(value) => *value,
            None => slot_get(&self.mmap, slot),
        }
    }

    fn set(&mut self, index: usize, value: u64) {
        assert!(
            index < self.size,
            "index {index} out of bounds for queue of size {}",
            self.size
        );
        let slot = self.physical_slot(index);
        self.overlay.insert(slot, value);
    }

    /// Inserts at logical `index`, shifting whichever half is shorter:
    /// the left half moves one slot down (head retreats, cost `O(index)`),
    /// the right half moves one slot up (cost `O(size - index)`). Balanced
    /// for the two common workloads, head takes and tail replay appends.
    fn insert_at(&mut self, index: usize, value: u64) {
        assert!(
            index <= self.size,
            "index {index} out of bounds for insert into queue of size {}",
            self.size
        );
        assert_ne!(value, EMPTY, "cannot store the empty-slot sentinel");
        debug_assert!(self.size < self.capacity);

        self.size += 1;
        if index <= self.size / 2 {
            // Shift left.
            self.head = if self.head == 0 {
                self.capacity - 1
            } else {
                self.head - 1
            };
            for i in 0..index {
                let shifted = self.get(i + 1);
                self.set(i, shifted);
            }
        } else {
            // Shift right.
            let mut i = self.size - 1;
            while i > index {
                let shifted = self.get(i - 1);
                self.set(i, shifted);
                i -= 1;
            }
        }
        self.set(index, value);
    }

    /// Removes the element at logical `index`, closing the gap from
    /// whichever side is shorter.
    fn remove_at(&mut self, index: usize) -> u64 {
        assert!(
            index < self.size,
            "index {index} out of bounds for queue of size {}",
            self.size
        );
        let value = self.get(index);

        if index > self.size / 2 {
            // Move the tail part left.
            for i in index..self.size - 1 {
                let shifted = self.get(i + 1);
                self.set(i, shifted);
            }
            self.set(self.size - 1, EMPTY);
        } else {
            // Move the head part right.
            for i in (0..index).rev() {
                let shifted = self.get(i);
                self.set(i + 1, shifted);
            }
            self.set(0, EMPTY);
            self.head += 1;
            if self.head == self.capacity {
                self.head = 0;
            }
        }

        self.size -= 1;
        value
    }
}
