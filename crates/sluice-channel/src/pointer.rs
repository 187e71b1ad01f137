//! Event pointers: the 8-byte values the queue stores.

use std::fmt;

/// Location of an event inside a transaction log file.
///
/// Packs to a single `u64` for storage in the checkpoint ring: the high
/// 32 bits hold the log file ID, the low 32 bits the byte offset of the
/// event's record within that file. The packed value `0` is reserved as
/// the empty-slot sentinel and is never a valid pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventPointer {
    file_id: u32,
    offset: u32,
}

impl EventPointer {
    /// Creates a pointer to `offset` within log file `file_id`.
    ///
    /// # Panics
    ///
    /// Panics on `(0, 0)`, which packs to the reserved empty-slot value.
    #[must_use]
    pub fn new(file_id: u32, offset: u32) -> Self {
        assert!(
            file_id != 0 || offset != 0,
            "pointer (0, 0) is reserved for empty slots"
        );
        Self { file_id, offset }
    }

    /// ID of the log file holding the event.
    #[must_use]
    pub fn file_id(self) -> u32 {
        self.file_id
    }

    /// Byte offset of the event's record within the log file.
    #[must_use]
    pub fn offset(self) -> u32 {
        self.offset
    }

    /// Packs the pointer into its stored form.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        (u64::from(self.file_id) << 32) | u64::from(self.offset)
    }

    /// Unpacks a stored pointer.
    ///
    /// # Panics
    ///
    /// Panics on the reserved empty-slot value `0`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // splitting the packed halves
    pub fn from_u64(value: u64) -> Self {
        assert_ne!(value, 0, "0 is the empty-slot sentinel, not a pointer");
        Self {
            file_id: (value >> 32) as u32,
            offset: value as u32,
        }
    }
}

impl fmt::Display for EventPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(file id {}, offset {})", self.file_id, self.offset)
    }
}
