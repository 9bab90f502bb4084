//! Crash-durable marker mapping backed by an append-only journal.
//!
//! Every insert or removal is appended to the journal and fsynced before it
//! becomes visible. Reopening replays the journal; a torn or corrupt tail
//! left by a crash is truncated. Once superseded entries pile up, the
//! journal is rewritten with one entry per live key.

use super::mapping::MarkerMapping;
use super::marker::ReplayMarker;
use crate::error::{Result, StreamError};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for journal files.
const JOURNAL_MAGIC: &[u8; 4] = b"RMJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic plus version.
const HEADER_LEN: u64 = 5;

/// Sanity bound for a single entry.
const MAX_ENTRY_LEN: usize = 1024 * 1024;

/// Entries written before a compaction is considered.
pub const DEFAULT_COMPACT_AFTER: usize = 1024;

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum JournalEntry {
    Set { key: String, marker: ReplayMarker },
    Remove { key: String },
}

struct JournalState {
    entries: HashMap<String, ReplayMarker>,
    writer: BufWriter<File>,
    /// Entries in the journal file, live or superseded.
    written: usize,
}

/// Marker mapping persisted in a journal file.
pub struct JournalMapping {
    path: PathBuf,
    /// Lock file for exclusive access.
    _lock_file: File,
    state: Mutex<JournalState>,
    compact_after: usize,
}

impl JournalMapping {
    /// Open or create a journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_compaction(path, DEFAULT_COMPACT_AFTER)
    }

    /// Open or create a journal, compacting once more than `compact_after`
    /// entries have been written and most of them are superseded.
    pub fn open_with_compaction(path: impl AsRef<Path>, compact_after: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&path)?;

        let (entries, written) = if Self::is_started(&path)? {
            Self::recover(&path)?
        } else {
            Self::create(&path)?;
            (HashMap::new(), 0)
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        debug!(path = %path.display(), markers = entries.len(), "Opened marker journal");

        Ok(Self {
            path,
            _lock_file: lock_file,
            state: Mutex::new(JournalState {
                entries,
                writer,
                written,
            }),
            compact_after,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal with one entry per live key.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)
    }

    fn append(&self, entry: JournalEntry) -> Result<()> {
        let mut state = self.state.lock();

        Self::write_entry(&mut state.writer, &entry)?;
        state.writer.flush()?;
        // fsync for durability
        state.writer.get_ref().sync_data()?;
        state.written += 1;

        match entry {
            JournalEntry::Set { key, marker } => {
                state.entries.insert(key, marker);
            }
            JournalEntry::Remove { key } => {
                state.entries.remove(&key);
            }
        }

        if state.written > self.compact_after && state.written > state.entries.len() * 2 {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }

    fn compact_locked(&self, state: &mut JournalState) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(JOURNAL_MAGIC)?;
            writer.write_all(&[JOURNAL_VERSION])?;
            for (key, marker) in &state.entries {
                let entry = JournalEntry::Set {
                    key: key.clone(),
                    marker: marker.clone(),
                };
                Self::write_entry(&mut writer, &entry)?;
            }
            writer.flush()?;
            drop(writer);
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        state.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);

        debug!(
            path = %self.path.display(),
            before = state.written,
            after = state.entries.len(),
            "Compacted marker journal"
        );
        state.written = state.entries.len();
        Ok(())
    }

    /// Replay the journal, truncating anything after the last valid entry.
    fn recover(path: &Path) -> Result<(HashMap<String, ReplayMarker>, usize)> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // Verify header
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StreamError::Corruption(format!(
                "{} is not a marker journal",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StreamError::Corruption(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = HashMap::new();
        let mut written = 0;
        let mut valid_len = HEADER_LEN;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, len))) => {
                    match entry {
                        JournalEntry::Set { key, marker } => {
                            entries.insert(key, marker);
                        }
                        JournalEntry::Remove { key } => {
                            entries.remove(&key);
                        }
                    }
                    written += 1;
                    valid_len += len;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding damaged journal tail");
                    break;
                }
            }
        }

        if valid_len < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok((entries, written))
    }

    /// Whether `path` holds a journal with a complete header. A file cut
    /// short inside the header counts as never created.
    fn is_started(path: &Path) -> Result<bool> {
        let len = match fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if len >= HEADER_LEN {
            return Ok(true);
        }

        let prefix = fs::read(path)?;
        let mut header = JOURNAL_MAGIC.to_vec();
        header.push(JOURNAL_VERSION);
        if !header.starts_with(&prefix) {
            return Err(StreamError::Corruption(format!(
                "{} is not a marker journal",
                path.display()
            )));
        }
        warn!(path = %path.display(), len, "Replacing journal with incomplete header");
        Ok(false)
    }

    /// Write an empty journal, replacing whatever is at `path` in one step.
    fn create(path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("new");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            Self::write_header(&mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.with_extension("lock"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StreamError::Locked)?;

        Ok(lock_file)
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        Ok(())
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read one entry; `Ok(None)` at a clean end of file.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(JournalEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(StreamError::Corruption("Journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StreamError::Corruption("Journal checksum mismatch".into()));
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, (len + 8) as u64)))
    }
}

impl MarkerMapping for JournalMapping {
    fn get(&self, key: &str) -> Result<Option<ReplayMarker>> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    fn insert(&self, key: &str, marker: ReplayMarker) -> Result<()> {
        self.append(JournalEntry::Set {
            key: key.to_string(),
            marker,
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if !self.state.lock().entries.contains_key(key) {
            return Ok(());
        }
        self.append(JournalEntry::Remove {
            key: key.to_string(),
        })
    }

    fn len(&self) -> Result<usize> {
        Ok(self.state.lock().entries.len())
    }
}
