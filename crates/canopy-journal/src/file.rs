use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use canopy_types::{ChangeEvent, NodeKey};

use crate::error::{JournalError, JournalResult};
use crate::records::JournalRecord;
use crate::traits::{ChangeJournal, IterationOrder, JournalIter};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Upper bound on one frame's payload. Anything larger is treated as
/// corruption rather than allocated.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Flush/sync strategy for the file journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every append (safest, highest latency).
    EveryAppend,
    /// Flush to the OS page cache only (fastest, least durable).
    #[default]
    OsDefault,
}

/// Configuration for the [`FileJournal`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FileJournalConfig {
    pub sync_mode: SyncMode,
}

struct JournalWriter {
    writer: BufWriter<File>,
    /// Current append offset.
    offset: u64,
    /// Byte offset of every valid record, in sequence order. The record at
    /// `offsets[i]` has sequence `i + 1`.
    offsets: Vec<u64>,
}

/// Crash-recoverable append-only file journal.
///
/// On-disk format, one frame per record:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized JournalRecord)]
/// ```
///
/// On open the file is scanned front-to-back; a torn tail (an incomplete or
/// CRC-failing final frame left by a crash) is truncated away. Every append
/// is flushed before returning, so a fresh read handle always observes it;
/// [`SyncMode::EveryAppend`] additionally fsyncs.
pub struct FileJournal {
    path: PathBuf,
    config: FileJournalConfig,
    inner: Mutex<JournalWriter>,
}

impl FileJournal {
    /// Open (or create) a journal file at the given path.
    pub fn open(path: &Path, config: FileJournalConfig) -> JournalResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Scan existing content to rebuild the offset index.
        let (offsets, valid_end, file_len) = scan(path)?;
        if valid_end < file_len {
            warn!(
                path = %path.display(),
                torn_bytes = file_len - valid_end,
                "truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_end)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let writer = BufWriter::new(file);

        debug!(path = %path.display(), records = offsets.len(), "journal opened");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            inner: Mutex::new(JournalWriter {
                writer,
                offset: valid_end,
                offsets,
            }),
        })
    }
}

fn scan(path: &Path) -> JournalResult<(Vec<u64>, u64, u64)> {
    let mut offsets = Vec::new();
    let mut valid_end = 0u64;
    let file_len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok((offsets, 0, 0)),
    };

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    loop {
        match read_frame(&mut reader)? {
            Some((_, consumed)) => {
                offsets.push(valid_end);
                valid_end += consumed;
            }
            None => break,
        }
    }
    Ok((offsets, valid_end, file_len))
}

/// Read one frame. Returns `Ok(None)` at a clean end of file or at a torn
/// or CRC-failing frame (incomplete write from a crash).
fn read_frame(reader: &mut impl Read) -> JournalResult<Option<(JournalRecord, u64)>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_FRAME_SIZE {
        return Ok(None);
    }

    let mut payload = vec![0u8; length as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if crc32fast::hash(&payload) != crc {
        return Ok(None);
    }

    let record: JournalRecord = bincode::deserialize(&payload)
        .map_err(|e| JournalError::Serialization(e.to_string()))?;
    Ok(Some((record, (HEADER_SIZE + length as usize) as u64)))
}

impl ChangeJournal for FileJournal {
    fn append(
        &self,
        changed: BTreeSet<NodeKey>,
        payload: Option<Vec<ChangeEvent>>,
    ) -> JournalResult<JournalRecord> {
        let mut inner = self.inner.lock().expect("journal mutex poisoned");

        let record = JournalRecord {
            seq: inner.offsets.len() as u64 + 1,
            timestamp: Utc::now(),
            changed,
            payload,
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        let length = bytes.len() as u32;
        let crc = crc32fast::hash(&bytes);

        let record_offset = inner.offset;
        inner.writer.write_all(&length.to_le_bytes())?;
        inner.writer.write_all(&crc.to_le_bytes())?;
        inner.writer.write_all(&bytes)?;
        inner.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryAppend {
            inner.writer.get_ref().sync_all()?;
        }

        inner.offset += (HEADER_SIZE + bytes.len()) as u64;
        inner.offsets.push(record_offset);

        debug!(seq = record.seq, keys = record.changed.len(), "journal record appended");
        Ok(record)
    }

    fn records(&self, order: IterationOrder) -> JournalResult<JournalIter> {
        match order {
            IterationOrder::Forward => {
                let file = File::open(&self.path)?;
                let count = self.inner.lock().expect("journal mutex poisoned").offsets.len();
                Ok(Box::new(ForwardIter {
                    reader: BufReader::new(file),
                    remaining: count,
                }))
            }
            IterationOrder::Reverse => {
                let offsets = {
                    let inner = self.inner.lock().expect("journal mutex poisoned");
                    inner.offsets.clone()
                };
                let file = File::open(&self.path)?;
                Ok(Box::new(ReverseIter { file, offsets }))
            }
        }
    }

    fn last_sequence(&self) -> JournalResult<u64> {
        Ok(self.inner.lock().expect("journal mutex poisoned").offsets.len() as u64)
    }
}

/// Lazy front-to-back reader over its own file handle. Bounded by the
/// record count observed at creation, so a concurrent append never makes
/// the pass unbounded.
struct ForwardIter {
    reader: BufReader<File>,
    remaining: usize,
}

impl Iterator for ForwardIter {
    type Item = JournalResult<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match read_frame(&mut self.reader) {
            Ok(Some((record, _))) => {
                self.remaining -= 1;
                Some(Ok(record))
            }
            Ok(None) => None,
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Most-recent-first reader that seeks to each recorded offset.
struct ReverseIter {
    file: File,
    offsets: Vec<u64>,
}

impl Iterator for ReverseIter {
    type Item = JournalResult<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offsets.pop()?;
        let result = (|| -> JournalResult<Option<JournalRecord>> {
            self.file.seek(SeekFrom::Start(offset))?;
            let mut reader = BufReader::new(&mut self.file);
            Ok(read_frame(&mut reader)?.map(|(record, _)| record))
        })();
        match result {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => Some(Err(JournalError::Corrupt {
                offset,
                reason: "indexed record unreadable".into(),
            })),
            Err(e) => Some(Err(e)),
        }
    }
}
