//! Reference journal for a volume store
//!
//! Every mutation of a volume's reference ledger is appended here before it
//! is applied in memory, so the ledger can be rebuilt by replaying the
//! journal on open. Payload bytes are not journaled; they live in per-block
//! files next to the journal.
//!
//! # Format
//!
//! ```text
//! header:  magic (u64) | version (u32) | base sequence (u64)
//! record:  body length (u32) | crc32c of body (u32) | bincode(JournalEntry)
//! ```
//!
//! Replay stops at the first short or checksum-failing record. That tail is
//! what a crash in the middle of an append leaves behind, so it is cut off
//! before new records are appended.

use crate::error::{BlockError, BlockResult};
use crate::volume_store::RefRecord;

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use stratafs_common::{BlockContext, BlockId};
use tracing::{debug, info, warn};

/// Magic number for journal file header
const JOURNAL_MAGIC: u64 = 0x5346_5F52_4546_4A4C; // "SF_REFJL"

/// Journal file version
const JOURNAL_VERSION: u32 = 1;

/// magic + version + base sequence
const HEADER_LEN: u64 = 8 + 4 + 8;

/// length + checksum
const RECORD_PREFIX_LEN: u64 = 4 + 4;

/// A reference ledger mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Primary reference created for a newly stored payload
    Put {
        id: BlockId,
        context: BlockContext,
        size: u64,
    },
    /// Live count of one reference incremented
    AddReference { id: BlockId, context: BlockContext },
    /// Live counts of the given references decremented
    RemoveReferences {
        id: BlockId,
        contexts: Vec<BlockContext>,
    },
    /// The given references marked archived
    ArchiveReferences {
        id: BlockId,
        contexts: Vec<BlockContext>,
    },
    /// Full state of one block, written by compaction
    Restore {
        id: BlockId,
        size: u64,
        refs: Vec<RefRecord>,
    },
}

/// A journaled operation with its sequence number
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JournalEntry {
    /// Sequence number
    pub sequence: u64,
    /// The operation
    pub op: JournalOp,
}

/// Borrowing twin of [`JournalEntry`] so appends need not clone the op
#[derive(Serialize)]
struct JournalEntryRef<'a> {
    sequence: u64,
    op: &'a JournalOp,
}

fn encode_record(sequence: u64, op: &JournalOp) -> BlockResult<Vec<u8>> {
    let body = bincode::serialize(&JournalEntryRef { sequence, op })
        .map_err(|e| BlockError::Journal(format!("failed to encode entry: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| BlockError::Journal(format!("entry too large: {} bytes", body.len())))?;

    let mut buf = Vec::with_capacity(RECORD_PREFIX_LEN as usize + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read one record, returning it with its encoded length
///
/// `available` is the number of file bytes left at the record's offset; a
/// length prefix pointing past the end of the file is a torn tail.
fn decode_record<R: Read>(reader: &mut R, available: u64) -> BlockResult<(JournalEntry, u64)> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|e| BlockError::Journal(format!("short record length: {e}")))?;
    let len = u32::from_le_bytes(len_buf);
    if u64::from(len) > available.saturating_sub(RECORD_PREFIX_LEN) {
        return Err(BlockError::Journal(format!(
            "record length {len} exceeds the {available} bytes left in the journal"
        )));
    }

    let mut crc_buf = [0u8; 4];
    reader
        .read_exact(&mut crc_buf)
        .map_err(|e| BlockError::Journal(format!("short record checksum: {e}")))?;
    let checksum = u32::from_le_bytes(crc_buf);

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .map_err(|e| BlockError::Journal(format!("short record body: {e}")))?;
    if crc32c::crc32c(&body) != checksum {
        return Err(BlockError::Journal("record checksum mismatch".to_string()));
    }

    let entry = bincode::deserialize(&body)
        .map_err(|e| BlockError::Journal(format!("failed to decode entry: {e}")))?;
    Ok((entry, RECORD_PREFIX_LEN + u64::from(len)))
}

/// Append-only journal of reference ledger mutations for one volume
pub struct RefJournal {
    /// Journal file path
    path: PathBuf,
    /// Journal file writer; `None` once closed
    writer: Option<BufWriter<File>>,
    /// Next sequence number
    sequence: u64,
    /// Current journal size
    current_size: u64,
    /// Size that triggers compaction
    max_size: u64,
    /// fsync after every append
    sync_on_write: bool,
}

impl RefJournal {
    /// Create or open a journal, returning the operations it already holds
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size: u64,
        sync_on_write: bool,
    ) -> BlockResult<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BlockError::Journal(format!("failed to create journal dir: {e}")))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BlockError::Journal(format!("failed to open journal: {e}")))?;
        let file_len = file
            .metadata()
            .map_err(|e| BlockError::Journal(format!("failed to stat journal: {e}")))?
            .len();

        let (entries, sequence, valid_len) = if file_len == 0 {
            let mut writer = BufWriter::new(&file);
            Self::write_header(&mut writer, 0)?;
            (Vec::new(), 0, HEADER_LEN)
        } else {
            Self::replay(&file, file_len)?
        };

        if valid_len < file_len {
            warn!(
                "Discarding {} bytes of torn journal tail at {:?}",
                file_len - valid_len,
                path
            );
            file.set_len(valid_len)
                .map_err(|e| BlockError::Journal(format!("failed to truncate journal: {e}")))?;
        }
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| BlockError::Journal(format!("failed to reopen journal: {e}")))?;

        info!(
            "Opened journal at {:?}: seq={}, entries={}, size={}",
            path,
            sequence,
            entries.len(),
            valid_len
        );

        Ok((
            Self {
                path,
                writer: Some(BufWriter::new(file)),
                sequence,
                current_size: valid_len,
                max_size,
                sync_on_write,
            },
            entries,
        ))
    }

    /// Write journal header
    fn write_header<W: Write>(writer: &mut W, base_sequence: u64) -> BlockResult<()> {
        writer
            .write_all(&JOURNAL_MAGIC.to_le_bytes())
            .map_err(|e| BlockError::Journal(format!("failed to write magic: {e}")))?;
        writer
            .write_all(&JOURNAL_VERSION.to_le_bytes())
            .map_err(|e| BlockError::Journal(format!("failed to write version: {e}")))?;
        writer
            .write_all(&base_sequence.to_le_bytes())
            .map_err(|e| BlockError::Journal(format!("failed to write sequence: {e}")))?;
        writer
            .flush()
            .map_err(|e| BlockError::Journal(format!("failed to flush header: {e}")))?;
        Ok(())
    }

    /// Validate the header and read every intact record
    ///
    /// Returns the entries, the next sequence number, and the length of the
    /// intact prefix of the file.
    fn replay(file: &File, file_len: u64) -> BlockResult<(Vec<JournalEntry>, u64, u64)> {
        let mut reader = BufReader::new(file);

        let mut magic_buf = [0u8; 8];
        reader
            .read_exact(&mut magic_buf)
            .map_err(|e| BlockError::Journal(format!("failed to read magic: {e}")))?;
        if u64::from_le_bytes(magic_buf) != JOURNAL_MAGIC {
            return Err(BlockError::Journal("invalid journal magic".to_string()));
        }

        let mut version_buf = [0u8; 4];
        reader
            .read_exact(&mut version_buf)
            .map_err(|e| BlockError::Journal(format!("failed to read version: {e}")))?;
        let version = u32::from_le_bytes(version_buf);
        if version != JOURNAL_VERSION {
            return Err(BlockError::Journal(format!(
                "unsupported journal version: {version}"
            )));
        }

        let mut seq_buf = [0u8; 8];
        reader
            .read_exact(&mut seq_buf)
            .map_err(|e| BlockError::Journal(format!("failed to read sequence: {e}")))?;
        let mut next_sequence = u64::from_le_bytes(seq_buf);

        let mut entries = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < file_len {
            match decode_record(&mut reader, file_len - offset) {
                Ok((entry, len)) => {
                    next_sequence = next_sequence.max(entry.sequence + 1);
                    offset += len;
                    entries.push(entry);
                }
                Err(e) => {
                    warn!("Stopping journal replay at offset {}: {}", offset, e);
                    break;
                }
            }
        }

        Ok((entries, next_sequence, offset))
    }

    /// Append an operation
    pub fn append(&mut self, op: &JournalOp) -> BlockResult<u64> {
        let data = encode_record(self.sequence, op)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BlockError::Journal("journal closed".to_string()))?;

        writer
            .write_all(&data)
            .map_err(|e| BlockError::Journal(format!("write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| BlockError::Journal(format!("flush failed: {e}")))?;
        if self.sync_on_write {
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| BlockError::Journal(format!("sync failed: {e}")))?;
        }

        self.current_size += data.len() as u64;
        let seq = self.sequence;
        self.sequence += 1;
        Ok(seq)
    }

    /// Whether the journal has outgrown its size limit
    #[must_use]
    pub const fn needs_compaction(&self) -> bool {
        self.current_size > self.max_size
    }

    /// Current journal size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.current_size
    }

    /// Replace the journal with the given snapshot operations
    ///
    /// The new journal is written beside the old one and renamed over it, so
    /// a crash leaves either the old or the new journal intact.
    pub fn compact<I>(&mut self, snapshot: I) -> BlockResult<()>
    where
        I: IntoIterator<Item = JournalOp>,
    {
        let old = self
            .writer
            .as_mut()
            .ok_or_else(|| BlockError::Journal("journal closed".to_string()))?;
        old.flush()
            .map_err(|e| BlockError::Journal(format!("flush failed: {e}")))?;

        // The old writer stays in place until the new file is live.
        let tmp_path = self.path.with_extension("compact");
        let written = Self::write_snapshot(&tmp_path, self.sequence, snapshot).and_then(|out| {
            std::fs::rename(&tmp_path, &self.path)
                .map_err(|e| BlockError::Journal(format!("failed to replace journal: {e}")))?;
            Ok(out)
        });
        let (file, sequence, size) = match written {
            Ok(out) => out,
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&tmp_path) {
                    debug!("Could not remove {:?}: {}", tmp_path, rm);
                }
                return Err(e);
            }
        };
        self.writer = Some(BufWriter::new(file));

        info!(
            "Compacted journal at {:?}: {} -> {} bytes",
            self.path, self.current_size, size
        );
        self.sequence = sequence;
        self.current_size = size;
        Ok(())
    }

    /// Write a compacted journal to `path`
    ///
    /// Returns an append handle to it with the next sequence and its size.
    fn write_snapshot<I>(path: &Path, base: u64, snapshot: I) -> BlockResult<(File, u64, u64)>
    where
        I: IntoIterator<Item = JournalOp>,
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| BlockError::Journal(format!("failed to create compacted journal: {e}")))?;
        let mut writer = BufWriter::new(file);

        Self::write_header(&mut writer, base)?;
        let mut size = HEADER_LEN;
        let mut sequence = base;
        for op in snapshot {
            let data = encode_record(sequence, &op)?;
            writer
                .write_all(&data)
                .map_err(|e| BlockError::Journal(format!("write failed: {e}")))?;
            size += data.len() as u64;
            sequence += 1;
        }
        let file = writer
            .into_inner()
            .map_err(|e| BlockError::Journal(format!("flush failed: {e}")))?;
        file.sync_all()
            .map_err(|e| BlockError::Journal(format!("sync failed: {e}")))?;
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| BlockError::Journal(format!("failed to reopen journal: {e}")))?;
        Ok((file, sequence, size))
    }

    /// Sync journal to disk
    pub fn sync(&mut self) -> BlockResult<()> {
        if let Some(ref mut writer) = self.writer {
            writer
                .flush()
                .map_err(|e| BlockError::Journal(format!("flush failed: {e}")))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| BlockError::Journal(format!("sync failed: {e}")))?;
        }
        Ok(())
    }

    /// Sync and close; later appends fail
    pub fn close(&mut self) -> BlockResult<()> {
        self.sync()?;
        self.writer = None;
        debug!("Closed journal at {:?}", self.path);
        Ok(())
    }
}
