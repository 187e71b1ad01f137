//! Transaction log files: record codec, append-side writer, and the
//! sequential reader the replay engine consumes.
//!
//! ## Disk Layout
//!
//! ```text
//! header:  MAGIC (u64) | FORMAT_VERSION (u32) | log_file_id (u32)
//! record:  frame_len (u32) | crc32c(payload) (u32) | payload
//! payload: kind tag (u16) | transaction_id (u64) | write_order_id (u64)
//!          TAKE appends file_id (u32), offset (u32)
//!          COMMIT appends the committed kind tag (u16)
//! ```
//!
//! Integers are little-endian. A frame that runs past the end of the file,
//! or whose checksum does not match, is reported as a [`ReadOutcome`]
//! rather than an error: a crash during append legitimately leaves a
//! partially written trailing record, and replay must tolerate it.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LogError;
use crate::record::{CommitKind, LogRecord, RecordKind, TransactionRecord};

/// "SLUICE1" in hex-ish; identifies a transaction log file.
const LOG_MAGIC: u64 = 0x0053_4C55_4943_4531;
/// Current log format version.
const LOG_FORMAT_VERSION: u32 = 1;
/// Size of the per-file header (magic + version + file ID).
const FILE_HEADER_SIZE: u64 = 16;
/// Size of the per-record frame header (length + CRC32C).
const RECORD_HEADER_SIZE: u64 = 8;

const TAG_PUT: u16 = 1;
const TAG_TAKE: u16 = 2;
const TAG_COMMIT: u16 = 3;
const TAG_ROLLBACK: u16 = 4;

/// Result of pulling the next record off a log file.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// A fully framed and decoded record.
    Record(LogRecord),
    /// Clean end of file at a record boundary.
    Eof,
    /// Partial trailing frame: the file ends mid-record.
    TornWrite {
        /// Offset of the incomplete frame.
        position: u64,
        /// What was incomplete.
        reason: String,
    },
    /// The frame checksum did not match its payload.
    ChecksumMismatch {
        /// Offset of the corrupt frame.
        position: u64,
    },
}

fn encode_payload(record: &TransactionRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(28);
    let tag = match record.kind {
        RecordKind::Put => TAG_PUT,
        RecordKind::Take { .. } => TAG_TAKE,
        RecordKind::Commit { .. } => TAG_COMMIT,
        RecordKind::Rollback => TAG_ROLLBACK,
    };
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&record.transaction_id.to_le_bytes());
    buf.extend_from_slice(&record.write_order_id.to_le_bytes());
    match record.kind {
        RecordKind::Take { file_id, offset } => {
            buf.extend_from_slice(&file_id.to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        RecordKind::Commit { committed } => {
            let inner = match committed {
                CommitKind::Put => TAG_PUT,
                CommitKind::Take => TAG_TAKE,
            };
            buf.extend_from_slice(&inner.to_le_bytes());
        }
        RecordKind::Put | RecordKind::Rollback => {}
    }
    buf
}

/// Cursor over a checksum-validated payload.
struct PayloadCursor<'a> {
    bytes: &'a [u8],
    file_id: u32,
    offset: u32,
}

impl PayloadCursor<'_> {
    fn read<const N: usize>(&mut self) -> Result<[u8; N], LogError> {
        let Some((head, rest)) = self.bytes.split_first_chunk::<N>() else {
            return Err(LogError::MalformedRecord {
                file_id: self.file_id,
                offset: self.offset,
                reason: format!("payload ends {N} bytes short"),
            });
        };
        self.bytes = rest;
        Ok(*head)
    }

    fn read_u16(&mut self) -> Result<u16, LogError> {
        Ok(u16::from_le_bytes(self.read()?))
    }

    fn read_u32(&mut self) -> Result<u32, LogError> {
        Ok(u32::from_le_bytes(self.read()?))
    }

    fn read_u64(&mut self) -> Result<u64, LogError> {
        Ok(u64::from_le_bytes(self.read()?))
    }
}

fn decode_payload(bytes: &[u8], file_id: u32, offset: u32) -> Result<TransactionRecord, LogError> {
    let mut cursor = PayloadCursor {
        bytes,
        file_id,
        offset,
    };
    let tag = cursor.read_u16()?;
    let transaction_id = cursor.read_u64()?;
    let write_order_id = cursor.read_u64()?;
    let kind = match tag {
        TAG_PUT => RecordKind::Put,
        TAG_TAKE => RecordKind::Take {
            file_id: cursor.read_u32()?,
            offset: cursor.read_u32()?,
        },
        TAG_COMMIT => {
            let inner = cursor.read_u16()?;
            let committed = match inner {
                TAG_PUT => CommitKind::Put,
                TAG_TAKE => CommitKind::Take,
                _ => {
                    return Err(LogError::UnknownRecordType {
                        tag: inner,
                        file_id,
                        offset,
                    })
                }
            };
            RecordKind::Commit { committed }
        }
        TAG_ROLLBACK => RecordKind::Rollback,
        _ => {
            return Err(LogError::UnknownRecordType {
                tag,
                file_id,
                offset,
            })
        }
    };
    Ok(TransactionRecord {
        transaction_id,
        write_order_id,
        kind,
    })
}

/// Append-side writer for a single transaction log file.
///
/// Creates the file with its header and appends framed records. Rolling to
/// a new file when this one grows too large is the caller's concern.
pub struct LogWriter {
    writer: BufWriter<File>,
    file_id: u32,
    position: u64,
}

impl LogWriter {
    /// Creates a new log file at `path` with the given file ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be created.
    pub fn create(path: &Path, file_id: u32) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&LOG_MAGIC.to_le_bytes())?;
        writer.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&file_id.to_le_bytes())?;
        Ok(Self {
            writer,
            file_id,
            position: FILE_HEADER_SIZE,
        })
    }

    /// Appends a record and returns the offset its frame starts at.
    ///
    /// For puts that offset, paired with [`file_id`](Self::file_id), is the
    /// event pointer producers hand to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    #[allow(clippy::cast_possible_truncation)] // offsets are bounded by the 32-bit pointer model
    pub fn append(&mut self, record: &TransactionRecord) -> Result<u32, LogError> {
        let start = self.position;
        let payload = encode_payload(record);
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc32c::crc32c(&payload).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.position += RECORD_HEADER_SIZE + payload.len() as u64;
        Ok(start as u32)
    }

    /// Flushes buffered frames and forces them to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error on flush or sync failure.
    pub fn sync(&mut self) -> Result<(), LogError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// The log file ID written into the header.
    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Offset the next frame will start at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Sequential reader over one transaction log file.
///
/// Exposes the capability replay needs: the file ID, a skip primitive to
/// fast-forward past already-checkpointed records, and `next` with clean
/// EOF as an ordinary outcome. Once a terminal outcome (EOF, torn write,
/// checksum mismatch) is reached the reader keeps returning it.
#[derive(Debug)]
pub struct SequentialReader {
    reader: BufReader<File>,
    path: PathBuf,
    file_id: u32,
    position: u64,
    file_len: u64,
    peeked: Option<ReadOutcome>,
    highest_transaction_id: u64,
    highest_write_order_id: u64,
}

impl SequentialReader {
    /// Opens a log file and validates its header.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::TruncatedHeader`] when the file ends inside the
    /// header (a log truncated at birth; callers skip it with a warning)
    /// and [`LogError::BadHeader`] when the magic or version is wrong.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FILE_HEADER_SIZE {
            return Err(LogError::TruncatedHeader {
                path: path.to_path_buf(),
            });
        }
        let mut reader = BufReader::new(file);

        let mut magic = [0_u8; 8];
        reader.read_exact(&mut magic)?;
        let magic = u64::from_le_bytes(magic);
        if magic != LOG_MAGIC {
            return Err(LogError::BadHeader {
                path: path.to_path_buf(),
                reason: format!("bad magic {magic:#018x}"),
            });
        }

        let mut version = [0_u8; 4];
        reader.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != LOG_FORMAT_VERSION {
            return Err(LogError::BadHeader {
                path: path.to_path_buf(),
                reason: format!("unsupported format version {version}"),
            });
        }

        let mut file_id = [0_u8; 4];
        reader.read_exact(&mut file_id)?;
        let file_id = u32::from_le_bytes(file_id);

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            file_id,
            position: FILE_HEADER_SIZE,
            file_len,
            peeked: None,
            highest_transaction_id: 0,
            highest_write_order_id: 0,
        })
    }

    /// The log file ID from the header.
    #[must_use]
    pub fn log_file_id(&self) -> u32 {
        self.file_id
    }

    /// Path the reader was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest transaction ID decoded so far, including skipped records.
    #[must_use]
    pub fn highest_transaction_id(&self) -> u64 {
        self.highest_transaction_id
    }

    /// Highest write-order ID decoded so far, including skipped records.
    #[must_use]
    pub fn highest_write_order_id(&self) -> u64 {
        self.highest_write_order_id
    }

    /// Pulls the next outcome off the file.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or on a record this version cannot
    /// decode. Torn tails and checksum mismatches are outcomes, not errors.
    pub fn next(&mut self) -> Result<ReadOutcome, LogError> {
        match self.peeked.take() {
            Some(ReadOutcome::Record(entry)) => return Ok(ReadOutcome::Record(entry)),
            Some(terminal) => {
                // Terminal outcomes are sticky.
                self.peeked = Some(terminal.clone());
                return Ok(terminal);
            }
            None => {}
        }
        let outcome = self.read_frame()?;
        if !matches!(outcome, ReadOutcome::Record(_)) {
            self.peeked = Some(outcome.clone());
        }
        Ok(outcome)
    }

    /// Consumes records already covered by the last checkpoint, stopping
    /// just before the first record with a newer write-order ID. Returns
    /// how many records were skipped.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or an undecodable record.
    pub fn skip_to_last_checkpoint_position(&mut self, checkpoint: u64) -> Result<u64, LogError> {
        let mut skipped = 0_u64;
        loop {
            match self.next()? {
                ReadOutcome::Record(entry) if entry.record.write_order_id <= checkpoint => {
                    skipped += 1;
                }
                outcome => {
                    self.peeked = Some(outcome);
                    break;
                }
            }
        }
        debug!(
            file_id = self.file_id,
            skipped, checkpoint, "skipped to last checkpoint position"
        );
        Ok(skipped)
    }

    #[allow(clippy::cast_possible_truncation)] // offsets are bounded by the 32-bit pointer model
    fn read_frame(&mut self) -> Result<ReadOutcome, LogError> {
        let remaining = self.file_len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if remaining < RECORD_HEADER_SIZE {
            return Ok(ReadOutcome::TornWrite {
                position: self.position,
                reason: format!(
                    "incomplete frame header: {remaining} bytes remaining, need {RECORD_HEADER_SIZE}"
                ),
            });
        }

        let frame_start = self.position;

        let mut len_bytes = [0_u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let len = u64::from(u32::from_le_bytes(len_bytes));

        let mut crc_bytes = [0_u8; 4];
        self.reader.read_exact(&mut crc_bytes)?;
        let expected_crc = u32::from_le_bytes(crc_bytes);
        self.position += RECORD_HEADER_SIZE;

        let data_remaining = self.file_len.saturating_sub(self.position);
        if data_remaining < len {
            return Ok(ReadOutcome::TornWrite {
                position: frame_start,
                reason: format!("incomplete payload: {data_remaining} bytes remaining, need {len}"),
            });
        }

        let mut payload = vec![0_u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        self.position += len;

        if crc32c::crc32c(&payload) != expected_crc {
            return Ok(ReadOutcome::ChecksumMismatch {
                position: frame_start,
            });
        }

        let record = decode_payload(&payload, self.file_id, frame_start as u32)?;
        self.highest_transaction_id = self.highest_transaction_id.max(record.transaction_id);
        self.highest_write_order_id = self.highest_write_order_id.max(record.write_order_id);
        Ok(ReadOutcome::Record(LogRecord {
            file_id: self.file_id,
            offset: frame_start as u32,
            record,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use tempfile::TempDir;

    fn read_all(reader: &mut SequentialReader) -> Vec<LogRecord> {
        let mut entries = Vec::new();
        while let ReadOutcome::Record(entry) = reader.next().unwrap() {
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-5");
        let mut writer = LogWriter::create(&path, 5).unwrap();

        let put_offset = writer.append(&TransactionRecord::put(1, 10)).unwrap();
        writer
            .append(&TransactionRecord::take(2, 11, 5, put_offset))
            .unwrap();
        writer.append(&TransactionRecord::commit_put(1, 12)).unwrap();
        writer.append(&TransactionRecord::rollback(2, 13)).unwrap();
        writer.sync().unwrap();

        let mut reader = SequentialReader::open(&path).unwrap();
        assert_eq!(reader.log_file_id(), 5);

        let entries = read_all(&mut reader);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].offset, put_offset);
        assert_eq!(entries[0].record, TransactionRecord::put(1, 10));
        assert_eq!(
            entries[1].record,
            TransactionRecord::take(2, 11, 5, put_offset)
        );
        assert_eq!(entries[2].record, TransactionRecord::commit_put(1, 12));
        assert_eq!(entries[3].record, TransactionRecord::rollback(2, 13));

        assert_eq!(reader.highest_transaction_id(), 2);
        assert_eq!(reader.highest_write_order_id(), 13);
    }

    #[test]
    fn test_eof_is_sticky() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        let mut writer = LogWriter::create(&path, 1).unwrap();
        writer.append(&TransactionRecord::put(1, 1)).unwrap();
        writer.sync().unwrap();

        let mut reader = SequentialReader::open(&path).unwrap();
        assert!(matches!(reader.next().unwrap(), ReadOutcome::Record(_)));
        assert!(matches!(reader.next().unwrap(), ReadOutcome::Eof));
        assert!(matches!(reader.next().unwrap(), ReadOutcome::Eof));
    }

    #[test]
    fn test_skip_consumes_checkpointed_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        let mut writer = LogWriter::create(&path, 1).unwrap();
        for write_order_id in 1..=5 {
            writer
                .append(&TransactionRecord::put(1, write_order_id))
                .unwrap();
        }
        writer.sync().unwrap();

        let mut reader = SequentialReader::open(&path).unwrap();
        assert_eq!(reader.skip_to_last_checkpoint_position(3).unwrap(), 3);

        let entries = read_all(&mut reader);
        let orders: Vec<u64> = entries.iter().map(|e| e.record.write_order_id).collect();
        assert_eq!(orders, vec![4, 5]);

        // Skipped records still feed the oracle seeds.
        assert_eq!(reader.highest_write_order_id(), 5);
    }

    #[test]
    fn test_torn_tail_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        let mut writer = LogWriter::create(&path, 1).unwrap();
        writer.append(&TransactionRecord::put(1, 1)).unwrap();
        writer.sync().unwrap();

        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xFF, 0xFF, 0xFF]).unwrap();
        file.sync_all().unwrap();

        let mut reader = SequentialReader::open(&path).unwrap();
        assert!(matches!(reader.next().unwrap(), ReadOutcome::Record(_)));
        assert!(matches!(
            reader.next().unwrap(),
            ReadOutcome::TornWrite { .. }
        ));
        assert!(matches!(
            reader.next().unwrap(),
            ReadOutcome::TornWrite { .. }
        ));
    }

    #[test]
    fn test_checksum_mismatch_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        let mut writer = LogWriter::create(&path, 1).unwrap();
        let offset = writer.append(&TransactionRecord::put(1, 1)).unwrap();
        writer.sync().unwrap();

        // Flip a payload byte without touching the stored checksum.
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::Start(
            u64::from(offset) + RECORD_HEADER_SIZE + 2,
        ))
        .unwrap();
        file.write_all(&[0xAA]).unwrap();
        file.sync_all().unwrap();

        let mut reader = SequentialReader::open(&path).unwrap();
        assert!(matches!(
            reader.next().unwrap(),
            ReadOutcome::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn test_unknown_record_type_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        // Hand-frame a payload with an unassigned tag and a valid checksum.
        let mut payload = Vec::new();
        payload.extend_from_slice(&99_u16.to_le_bytes());
        payload.extend_from_slice(&1_u64.to_le_bytes());
        payload.extend_from_slice(&1_u64.to_le_bytes());
        {
            let mut writer = LogWriter::create(&path, 1).unwrap();
            writer.sync().unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&crc32c::crc32c(&payload).to_le_bytes())
            .unwrap();
        file.write_all(&payload).unwrap();
        file.sync_all().unwrap();

        let mut reader = SequentialReader::open(&path).unwrap();
        let err = reader.next().unwrap_err();
        assert!(matches!(err, LogError::UnknownRecordType { tag: 99, .. }));
    }

    #[test]
    fn test_empty_file_is_truncated_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        std::fs::write(&path, []).unwrap();

        let err = SequentialReader::open(&path).unwrap_err();
        assert!(matches!(err, LogError::TruncatedHeader { .. }));
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log-1");
        std::fs::write(&path, b"definitely not a transaction log").unwrap();

        let err = SequentialReader::open(&path).unwrap_err();
        assert!(matches!(err, LogError::BadHeader { .. }));
    }
}
