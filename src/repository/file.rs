//! Journal-backed tag repository.
//!
//! Every write appends a checksummed entry to `tags.journal`; opening the
//! repository replays the journal into an in-memory [`TagTable`]. A torn
//! final entry (crash mid-write) is truncated away on open, while a checksum
//! mismatch anywhere else is reported as corruption.

use super::{TagRepository, TagTable};
use crate::error::{Result, TagError};
use crate::types::{ScopeId, Tag, TagFilter, TagId};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"TAG\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Largest entry accepted on replay.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

const JOURNAL_FILE: &str = "tags.journal";
const LOCK_FILE: &str = "LOCK";

/// File repository configuration.
#[derive(Clone, Debug)]
pub struct FileRepositoryConfig {
    /// Directory holding the journal and lock file.
    pub path: PathBuf,

    /// Sync every N writes (0 and 1 both mean every write).
    pub sync_interval: u64,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileRepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tags"),
            sync_interval: 100,
            create_if_missing: true,
        }
    }
}

/// One journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum JournalEntry {
    /// Full tag state after a write.
    Put(Tag),
    /// Tag removed.
    Delete(TagId),
    /// Id high-water mark, so ids of compacted-away tags are never reused.
    NextId(u64),
}

/// Append handle plus sync bookkeeping.
struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Length of the journal up to the last complete entry.
    len: u64,
    max_entry_size: usize,
    writes_since_sync: u64,
    sync_interval: u64,
}

impl Journal {
    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > self.max_entry_size {
            return Err(TagError::Serialization(format!(
                "Journal entry of {} bytes exceeds limit of {}",
                encoded.len(),
                self.max_entry_size
            )));
        }

        if let Err(e) = self.write_frame(&encoded) {
            if let Err(reset) = self.discard_partial() {
                warn!(path = %self.path.display(), error = %reset, "journal reset failed");
            }
            return Err(e);
        }
        self.len += (4 + encoded.len() + 4) as u64;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.writer.get_ref().sync_all()?;
            self.writes_since_sync = 0;
        }
        Ok(())
    }

    fn write_frame(&mut self, encoded: &[u8]) -> Result<()> {
        self.writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        self.writer.write_all(encoded)?;
        self.writer
            .write_all(&crc32fast::hash(encoded).to_le_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Drop buffered bytes and cut the file back to the last complete entry.
    fn discard_partial(&mut self) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.len)?;
        let torn = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // Not flushed: the buffered bytes belong to the failed entry
        let _ = torn.into_parts();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }
}

/// Tag repository persisted as an append-only journal.
pub struct FileTagRepository {
    config: FileRepositoryConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Replayed state. Always locked before `journal`.
    table: RwLock<TagTable>,

    journal: Mutex<Journal>,
}

impl FileTagRepository {
    /// Open an existing repository or create a new one.
    pub fn open_or_create(config: FileRepositoryConfig) -> Result<Self> {
        if config.path.join(JOURNAL_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(TagError::NotInitialized)
        }
    }

    /// Create a new, empty repository.
    pub fn create(config: FileRepositoryConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let journal_path = config.path.join(JOURNAL_FILE);
        Self::write_header(&journal_path)?;

        let journal = Self::open_journal(&journal_path, config.sync_interval)?;
        Ok(Self {
            config,
            _lock_file: lock_file,
            table: RwLock::new(TagTable::new()),
            journal: Mutex::new(journal),
        })
    }

    /// Open an existing repository, replaying its journal.
    pub fn open(config: FileRepositoryConfig) -> Result<Self> {
        let lock_file = Self::acquire_lock(&config.path)?;

        let journal_path = config.path.join(JOURNAL_FILE);
        let (table, good_len) = Self::replay(&journal_path)?;

        let file_len = fs::metadata(&journal_path)?.len();
        if good_len < file_len {
            warn!(
                path = %journal_path.display(),
                good_len,
                file_len,
                "truncating torn journal tail"
            );
            OpenOptions::new()
                .write(true)
                .open(&journal_path)?
                .set_len(good_len)?;
        }

        debug!(tags = table.len(), "tag journal replayed");

        let journal = Self::open_journal(&journal_path, config.sync_interval)?;
        Ok(Self {
            config,
            _lock_file: lock_file,
            table: RwLock::new(table),
            journal: Mutex::new(journal),
        })
    }

    /// Directory this repository lives in.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored tags.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Force pending journal writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.journal.lock().sync()
    }

    /// Rewrite the journal so it holds one `Put` per live tag.
    pub fn compact(&self) -> Result<()> {
        let table = self.table.read();
        let mut journal = self.journal.lock();

        let tmp_path = self.config.path.join(format!("{}.tmp", JOURNAL_FILE));
        Self::write_header(&tmp_path)?;
        {
            let mut tmp = Self::open_journal(&tmp_path, u64::MAX)?;
            tmp.append(&JournalEntry::NextId(table.next_id()))?;
            for tag in table.all() {
                tmp.append(&JournalEntry::Put(tag))?;
            }
            tmp.sync()?;
        }

        let path = journal.path.clone();
        fs::rename(&tmp_path, &path)?;
        *journal = Self::open_journal(&path, self.config.sync_interval)?;

        debug!(tags = table.len(), "tag journal compacted");
        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn open_journal(path: &Path, sync_interval: u64) -> Result<Journal> {
        let file = OpenOptions::new().append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Journal {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len,
            max_entry_size: MAX_ENTRY_SIZE,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Replay the journal. Returns the table and the length of the valid prefix.
    fn replay(path: &Path) -> Result<(TagTable, u64)> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(TagError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(TagError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut table = TagTable::new();
        let mut offset = HEADER_SIZE;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, size))) => {
                    match entry {
                        JournalEntry::Put(tag) => table.insert(tag),
                        JournalEntry::Delete(id) => {
                            table.remove(id);
                        }
                        JournalEntry::NextId(next_id) => table.reserve_ids(next_id),
                    }
                    offset += size;
                }
                Ok(None) => break,
                Err(TagError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((table, offset))
    }

    /// Read one entry. `Ok(None)` on a clean end of file.
    fn read_entry(reader: &mut impl Read) -> Result<Option<(JournalEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(TagError::Corruption("Journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(TagError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, (4 + len + 4) as u64)))
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| TagError::Locked)?;
        Ok(lock_file)
    }

    /// Journal `tag` and apply it, with the table write lock held.
    fn put_locked(&self, table: &mut TagTable, tag: Tag) -> Result<()> {
        self.journal.lock().append(&JournalEntry::Put(tag.clone()))?;
        table.insert(tag);
        Ok(())
    }
}

impl TagRepository for FileTagRepository {
    fn find_by_id(&self, id: TagId) -> Result<Option<Tag>> {
        Ok(self.table.read().get(id).cloned())
    }

    fn find_by_parent(&self, parent: TagId) -> Result<Vec<Tag>> {
        Ok(self.table.read().children_of(parent))
    }

    fn find_by_scope(&self, scope: &ScopeId, filter: &TagFilter) -> Result<Vec<Tag>> {
        Ok(self.table.read().in_scope(scope, filter))
    }

    fn save(&self, tag: &Tag) -> Result<()> {
        let mut table = self.table.write();
        self.put_locked(&mut table, tag.clone())
    }

    fn delete(&self, id: TagId) -> Result<bool> {
        let mut table = self.table.write();
        if table.get(id).is_none() {
            return Ok(false);
        }
        self.journal.lock().append(&JournalEntry::Delete(id))?;
        table.remove(id);
        Ok(true)
    }

    fn all(&self) -> Result<Vec<Tag>> {
        Ok(self.table.read().all())
    }

    fn next_id(&self) -> Result<TagId> {
        self.table.write().allocate_id()
    }

    fn save_fields(&self, tag: &Tag) -> Result<Option<Tag>> {
        let mut table = self.table.write();
        let Some(stored) = table.get(tag.id) else {
            return Ok(None);
        };
        let mut updated = tag.clone();
        updated.children = stored.children.clone();
        self.put_locked(&mut table, updated.clone())?;
        Ok(Some(updated))
    }

    fn add_descendants(&self, id: TagId, ids: &[TagId]) -> Result<Option<Tag>> {
        let mut table = self.table.write();
        let Some(mut tag) = table.get(id).cloned() else {
            return Ok(None);
        };
        tag.children.extend(ids.iter().copied());
        self.put_locked(&mut table, tag.clone())?;
        Ok(Some(tag))
    }

    fn remove_descendants(&self, id: TagId, ids: &BTreeSet<TagId>) -> Result<Option<Tag>> {
        let mut table = self.table.write();
        let Some(mut tag) = table.get(id).cloned() else {
            return Ok(None);
        };
        tag.children.retain(|child| !ids.contains(child));
        self.put_locked(&mut table, tag.clone())?;
        Ok(Some(tag))
    }
}

impl Drop for FileTagRepository {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
