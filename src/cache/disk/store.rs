//! Journal-backed, size-bounded LRU file store.
//!
//! Each entry is one file named after its key. Writes go to `<key>.tmp`
//! through an [`Editor`] and are published by rename on commit, so a
//! [`Snapshot`] always reads either the previous or the committed value.

use super::journal::{
    self, JOURNAL_FILE, JOURNAL_FILE_BACKUP, JOURNAL_FILE_TEMP, JournalOp, JournalReplay,
};
use crate::errors::{CacheError, CacheResult};
use lru::LruCache;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

/// Journal is compacted once this many superfluous lines have accumulated.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

#[derive(Debug, Clone, Copy)]
struct Entry {
    length: u64,
    readable: bool,
    editing: bool,
}

struct StoreInner {
    entries: LruCache<String, Entry>,
    size: u64,
    /// `None` once closed
    journal: Option<BufWriter<File>>,
    redundant_ops: usize,
}

pub struct DiskLruStore {
    directory: PathBuf,
    app_id: u32,
    max_size: u64,
    inner: Mutex<StoreInner>,
}

/// Read handle on a committed entry
#[derive(Debug)]
pub struct Snapshot {
    key: String,
    length: u64,
    file: File,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.length as usize);
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for Snapshot {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Write handle; aborts on drop unless committed
pub struct Editor<'a> {
    store: &'a DiskLruStore,
    key: String,
    writer: Option<BufWriter<File>>,
}

impl Editor<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the written bytes atomically.
    pub fn commit(mut self) -> CacheResult<()> {
        let Some(writer) = self.writer.take() else {
            return Err(CacheError::Closed);
        };
        let synced = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all());
        match synced {
            Ok(()) => self.store.complete_edit(&self.key, true),
            Err(e) => {
                let _ = self.store.complete_edit(&self.key, false);
                Err(e.into())
            }
        }
    }

    pub fn abort(mut self) -> CacheResult<()> {
        self.writer.take();
        self.store.complete_edit(&self.key, false)
    }
}

impl Write for Editor<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::other("editor already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Editor<'_> {
    fn drop(&mut self) {
        if self.writer.take().is_some()
            && let Err(e) = self.store.complete_edit(&self.key, false)
        {
            debug!("Failed to abort abandoned edit of {}: {}", self.key, e);
        }
    }
}

impl DiskLruStore {
    /// Open or create a store in `directory`.
    ///
    /// A journal that cannot be replayed, including one written with a
    /// different format version or app id, discards the directory contents.
    pub fn open(directory: impl AsRef<Path>, app_id: u32, max_size: u64) -> CacheResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let journal_path = directory.join(JOURNAL_FILE);
        let backup_path = directory.join(JOURNAL_FILE_BACKUP);
        if backup_path.exists() {
            if journal_path.exists() {
                fs::remove_file(&backup_path)?;
            } else {
                fs::rename(&backup_path, &journal_path)?;
            }
        }

        let store = Self {
            directory,
            app_id,
            max_size,
            inner: Mutex::new(StoreInner {
                entries: LruCache::unbounded(),
                size: 0,
                journal: None,
                redundant_ops: 0,
            }),
        };

        if journal_path.exists() {
            match journal::read_journal(&journal_path, app_id) {
                Ok(replay) => {
                    store.restore(replay)?;
                    return Ok(store);
                }
                Err(e) => {
                    warn!(
                        "Disk cache at {} is unusable, rebuilding empty: {}",
                        store.directory.display(),
                        e
                    );
                    fs::remove_dir_all(&store.directory)?;
                    fs::create_dir_all(&store.directory)?;
                }
            }
        }

        {
            let mut inner = store.lock();
            store.rebuild_journal(&mut inner)?;
        }
        Ok(store)
    }

    fn restore(&self, replay: JournalReplay) -> CacheResult<()> {
        let mut inner = self.lock();
        let line_count = replay.ops.len();

        for op in replay.ops {
            match op {
                JournalOp::Dirty(key) => match inner.entries.get_mut(&key) {
                    Some(entry) => entry.editing = true,
                    None => {
                        inner.entries.put(
                            key,
                            Entry {
                                length: 0,
                                readable: false,
                                editing: true,
                            },
                        );
                    }
                },
                JournalOp::Clean(key, length) => {
                    inner.entries.put(
                        key,
                        Entry {
                            length,
                            readable: true,
                            editing: false,
                        },
                    );
                }
                JournalOp::Remove(key) => {
                    inner.entries.pop(&key);
                }
                JournalOp::Read(key) => {
                    inner.entries.get(&key);
                }
            }
        }

        let _ = fs::remove_file(self.directory.join(JOURNAL_FILE_TEMP));

        // Edits interrupted by a crash: drop both the partial and the old value
        let interrupted: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.editing || !entry.readable)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &interrupted {
            inner.entries.pop(key);
            remove_if_exists(&self.dirty_path(key))?;
            remove_if_exists(&self.clean_path(key))?;
        }

        inner.size = inner.entries.iter().map(|(_, entry)| entry.length).sum();
        inner.redundant_ops = line_count.saturating_sub(inner.entries.len());

        if replay.truncated {
            self.rebuild_journal(&mut inner)?;
        } else {
            let file = OpenOptions::new()
                .append(true)
                .open(self.directory.join(JOURNAL_FILE))?;
            inner.journal = Some(BufWriter::new(file));
        }

        info!(
            "Opened disk cache at {} with {} entries ({} bytes)",
            self.directory.display(),
            inner.entries.len(),
            inner.size
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clean_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }

    fn dirty_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.tmp"))
    }

    fn check_key(key: &str) -> CacheResult<()> {
        if journal::is_valid_key(key) {
            Ok(())
        } else {
            Err(CacheError::InvalidKey {
                key: key.to_string(),
            })
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes of committed entries
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn len(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.readable)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().journal.is_none()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .entries
            .peek(key)
            .is_some_and(|entry| entry.readable)
    }

    /// Open a committed entry, promoting it to most recently used.
    pub fn get(&self, key: &str) -> CacheResult<Option<Snapshot>> {
        Self::check_key(key)?;
        let mut inner = self.lock();
        if inner.journal.is_none() {
            return Err(CacheError::Closed);
        }

        let length = match inner.entries.get(key) {
            Some(entry) if entry.readable => entry.length,
            _ => return Ok(None),
        };

        let file = match File::open(self.clean_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Deleted behind our back; forget it
                inner.entries.pop(key);
                inner.size = inner.size.saturating_sub(length);
                self.append(&mut inner, &JournalOp::Remove(key.to_string()))?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        inner.redundant_ops += 1;
        self.append(&mut inner, &JournalOp::Read(key.to_string()))?;
        self.compact_if_needed(&mut inner)?;

        Ok(Some(Snapshot {
            key: key.to_string(),
            length,
            file,
        }))
    }

    /// Begin writing `key`. Only one editor per key may be open.
    pub fn edit(&self, key: &str) -> CacheResult<Editor<'_>> {
        Self::check_key(key)?;
        let mut inner = self.lock();
        if inner.journal.is_none() {
            return Err(CacheError::Closed);
        }

        match inner.entries.get_mut(key) {
            Some(entry) if entry.editing => {
                return Err(CacheError::EditInProgress {
                    key: key.to_string(),
                });
            }
            Some(entry) => entry.editing = true,
            None => {
                inner.entries.put(
                    key.to_string(),
                    Entry {
                        length: 0,
                        readable: false,
                        editing: true,
                    },
                );
            }
        }

        self.append(&mut inner, &JournalOp::Dirty(key.to_string()))?;
        if let Some(journal) = inner.journal.as_mut() {
            journal.flush()?;
        }

        let file = match File::create(self.dirty_path(key)) {
            Ok(file) => file,
            Err(e) => {
                drop(inner);
                let _ = self.complete_edit(key, false);
                return Err(e.into());
            }
        };

        Ok(Editor {
            store: self,
            key: key.to_string(),
            writer: Some(BufWriter::new(file)),
        })
    }

    fn complete_edit(&self, key: &str, success: bool) -> CacheResult<()> {
        let dirty = self.dirty_path(key);
        let mut inner = self.lock();

        if inner.journal.is_none() {
            remove_if_exists(&dirty)?;
            return Err(CacheError::Closed);
        }
        let Some(entry) = inner.entries.peek(key).copied() else {
            remove_if_exists(&dirty)?;
            return Err(CacheError::Closed);
        };

        let op = if success {
            let clean = self.clean_path(key);
            let published = fs::rename(&dirty, &clean).and_then(|()| fs::metadata(&clean));
            match published {
                Ok(metadata) => {
                    let length = metadata.len();
                    let previous = if entry.readable { entry.length } else { 0 };
                    inner.size = inner.size.saturating_sub(previous) + length;
                    inner.entries.put(
                        key.to_string(),
                        Entry {
                            length,
                            readable: true,
                            editing: false,
                        },
                    );
                    JournalOp::Clean(key.to_string(), length)
                }
                Err(e) => {
                    remove_if_exists(&dirty)?;
                    self.finish_failed_edit(&mut inner, key, entry)?;
                    return Err(e.into());
                }
            }
        } else {
            remove_if_exists(&dirty)?;
            return self.finish_failed_edit(&mut inner, key, entry);
        };

        inner.redundant_ops += 1;
        self.append(&mut inner, &op)?;
        if let Some(journal) = inner.journal.as_mut() {
            journal.flush()?;
        }

        self.trim_to_size(&mut inner)?;
        self.compact_if_needed(&mut inner)
    }

    fn finish_failed_edit(&self, inner: &mut StoreInner, key: &str, entry: Entry) -> CacheResult<()> {
        inner.redundant_ops += 1;
        let op = if entry.readable {
            if let Some(current) = inner.entries.peek_mut(key) {
                current.editing = false;
            }
            JournalOp::Clean(key.to_string(), entry.length)
        } else {
            inner.entries.pop(key);
            JournalOp::Remove(key.to_string())
        };
        self.append(inner, &op)?;
        if let Some(journal) = inner.journal.as_mut() {
            journal.flush()?;
        }
        Ok(())
    }

    /// Delete a committed entry. Entries being edited are left alone.
    pub fn remove(&self, key: &str) -> CacheResult<bool> {
        Self::check_key(key)?;
        let mut inner = self.lock();
        if inner.journal.is_none() {
            return Err(CacheError::Closed);
        }
        let removed = self.remove_locked(&mut inner, key)?;
        if removed {
            self.compact_if_needed(&mut inner)?;
        }
        Ok(removed)
    }

    fn remove_locked(&self, inner: &mut StoreInner, key: &str) -> CacheResult<bool> {
        let entry = match inner.entries.peek(key) {
            Some(entry) if !entry.editing => *entry,
            _ => return Ok(false),
        };
        remove_if_exists(&self.clean_path(key))?;
        inner.entries.pop(key);
        inner.size = inner.size.saturating_sub(entry.length);
        inner.redundant_ops += 1;
        self.append(inner, &JournalOp::Remove(key.to_string()))?;
        Ok(true)
    }

    fn trim_to_size(&self, inner: &mut StoreInner) -> CacheResult<()> {
        while inner.size > self.max_size {
            let victim = inner
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.readable && !entry.editing)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            trace!("Evicting {} from disk cache", key);
            self.remove_locked(inner, &key)?;
        }
        Ok(())
    }

    fn append(&self, inner: &mut StoreInner, op: &JournalOp) -> CacheResult<()> {
        match inner.journal.as_mut() {
            Some(journal) => {
                writeln!(journal, "{op}")?;
                Ok(())
            }
            None => Err(CacheError::Closed),
        }
    }

    fn compact_if_needed(&self, inner: &mut StoreInner) -> CacheResult<()> {
        if inner.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
            && inner.redundant_ops >= inner.entries.len()
        {
            self.rebuild_journal(inner)?;
        }
        Ok(())
    }

    /// Write a minimal journal reflecting current state and swap it in.
    fn rebuild_journal(&self, inner: &mut StoreInner) -> CacheResult<()> {
        if let Some(mut journal) = inner.journal.take() {
            let _ = journal.flush();
        }

        let temp_path = self.directory.join(JOURNAL_FILE_TEMP);
        let journal_path = self.directory.join(JOURNAL_FILE);
        let backup_path = self.directory.join(JOURNAL_FILE_BACKUP);

        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            journal::write_header(&mut writer, self.app_id)?;
            // Oldest first so replay reproduces the access order
            for (key, entry) in inner.entries.iter().rev() {
                let op = if entry.editing {
                    JournalOp::Dirty(key.clone())
                } else {
                    JournalOp::Clean(key.clone(), entry.length)
                };
                writeln!(writer, "{op}")?;
            }
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        if journal_path.exists() {
            fs::rename(&journal_path, &backup_path)?;
        }
        fs::rename(&temp_path, &journal_path)?;
        remove_if_exists(&backup_path)?;

        let file = OpenOptions::new().append(true).open(&journal_path)?;
        inner.journal = Some(BufWriter::new(file));
        inner.redundant_ops = 0;
        debug!("Rebuilt disk cache journal in {}", self.directory.display());
        Ok(())
    }

    /// Trim to budget and push buffered journal lines to the OS.
    pub fn flush(&self) -> CacheResult<()> {
        let mut inner = self.lock();
        if inner.journal.is_none() {
            return Err(CacheError::Closed);
        }
        self.trim_to_size(&mut inner)?;
        if let Some(journal) = inner.journal.as_mut() {
            journal.flush()?;
        }
        Ok(())
    }

    /// Close the journal. Open editors fail on commit afterwards.
    pub fn close(&self) -> CacheResult<()> {
        let mut inner = self.lock();
        if inner.journal.is_none() {
            return Ok(());
        }
        self.trim_to_size(&mut inner)?;
        if let Some(mut journal) = inner.journal.take() {
            journal.flush()?;
        }
        Ok(())
    }

    /// Close and delete every file in the store's directory.
    pub fn delete(&self) -> CacheResult<()> {
        self.close()?;
        match fs::remove_dir_all(&self.directory) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
