//! Core cache engine — the heart of cellar.
//!
//! CellarCache maps short string keys to one payload file per entry inside an
//! exclusive directory, bounded by byte and entry-count budgets.
//!
//! **Read path**: look up the entry under the index lock, open its clean file
//! **Write path**: journal DIRTY, stream into `<key>.tmp`, publish by atomic
//! rename on commit, journal CLEAN
//! **Background**: journal appends run on a caller-supplied serial executor;
//! evictions run on an engine-owned one
//!
//! The index is access-ordered: `get`, `has`, and `edit` move an entry to the
//! most-recently-used end, and eviction consumes entries from the other end.
//! Budgets are soft: an over-budget cache trims in the background, and
//! entries under edit are never evicted.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::entry::Entry;
use crate::error::{CellarError, CellarResult};
use crate::executor::SerialExecutor;
use crate::journal::{Journal, JournalRecord};
use crate::reader::SnapshotReader;
use crate::writer::EditorWriter;

/// Embedder-supplied predicate; returns true when called on the UI thread.
pub type UiThreadCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Bounded, journaled, LRU disk cache.
///
/// Clones share one underlying cache. All methods take `&self`; the index
/// sits behind a short critical section and file I/O happens outside it.
/// Opening and closing must not happen on the embedder's UI thread when a
/// [`UiThreadCheck`] is wired in.
#[derive(Clone)]
pub struct CellarCache {
    shared: Arc<Shared>,
}

/// Engine state shared between the cache handle, live editors, and
/// background tasks. Editors hold an `Arc` of this plus a generation id
/// instead of pointing back at their entry.
pub(crate) struct Shared {
    /// Cache directory; `None` for a stub cache
    directory: Option<PathBuf>,
    /// Byte budget; mutable via `set_max_size_in_bytes`
    max_size_in_bytes: AtomicU64,
    /// Entry-count budget, fixed at open
    max_count: usize,
    /// Access-ordered index, least-recently-used end drives eviction
    entries: Mutex<LruCache<String, Entry>>,
    /// Clean files whose delete failed, retried before each trim pass
    remove_retry: Mutex<Vec<RetryFile>>,
    /// Held for the whole of a trim pass; flush and the background slot
    /// must not trim concurrently
    trim_lock: Mutex<()>,
    /// Sum of committed lengths over all readable entries
    size_in_bytes: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    /// Generation counter backing editor identity checks
    next_writer_id: AtomicU64,
    /// `None` for a stub cache
    journal: Option<Journal>,
    /// Caller-supplied executor serializing journal appends
    journal_executor: Arc<SerialExecutor>,
    /// Engine-owned single-slot executor for background trims
    trim_executor: SerialExecutor,
    ui_thread_check: Option<UiThreadCheck>,
}

/// An entry whose clean file outlived its index slot because the delete failed.
struct RetryFile {
    clean_path: PathBuf,
    length_in_bytes: u64,
}

impl CellarCache {
    /// Open or create a cache per `config`, recovering state from the journal.
    ///
    /// A stub configuration (no directory or a zero budget) yields a cache
    /// where every read misses and every edit is refused, with no file ever
    /// touched. `journal_executor` serializes journal appends; supply one
    /// whose thread the embedder can afford to spend on journal I/O.
    pub fn open(config: CacheConfig, journal_executor: Arc<SerialExecutor>) -> CellarResult<Self> {
        Self::open_inner(config, journal_executor, None)
    }

    /// Like [`CellarCache::open`], with a UI-thread guard: `open` and
    /// [`CellarCache::close`] fail when `is_ui_thread` returns true.
    pub fn open_with_ui_check(
        config: CacheConfig,
        journal_executor: Arc<SerialExecutor>,
        is_ui_thread: UiThreadCheck,
    ) -> CellarResult<Self> {
        Self::open_inner(config, journal_executor, Some(is_ui_thread))
    }

    fn open_inner(
        config: CacheConfig,
        journal_executor: Arc<SerialExecutor>,
        ui_thread_check: Option<UiThreadCheck>,
    ) -> CellarResult<Self> {
        assert_off_ui_thread(&ui_thread_check, "cache construction")?;

        let trim_executor = SerialExecutor::new("cellar-trim").map_err(|e| CellarError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn trim executor: {}", e),
        })?;

        let directory = if config.is_stub() { None } else { config.directory.clone() };

        let mut entries = LruCache::unbounded();
        let mut journal = None;
        let mut size_in_bytes = 0u64;
        if let Some(dir) = &directory {
            let j = Journal::new(dir);
            match j.recover_entries() {
                Some(recovered) => {
                    size_in_bytes = recovered.iter().map(|(_, e)| e.length_in_bytes()).sum();
                    if !recovered.is_empty() {
                        eprintln!(
                            "[CELLAR] Recovered {} entries from journal at {}",
                            recovered.len(),
                            dir.display()
                        );
                    }
                    entries = recovered;
                }
                None => {
                    // Unreadable or absent journal: the directory was swept.
                    // Recreate it and start a fresh journal.
                    let _ = fs::create_dir_all(dir);
                    j.rebuild(&[]);
                }
            }
            journal = Some(j);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                directory,
                max_size_in_bytes: AtomicU64::new(config.max_size_in_bytes),
                max_count: config.max_count,
                entries: Mutex::new(entries),
                remove_retry: Mutex::new(Vec::new()),
                trim_lock: Mutex::new(()),
                size_in_bytes: AtomicU64::new(size_in_bytes),
                hit_count: AtomicU64::new(0),
                miss_count: AtomicU64::new(0),
                next_writer_id: AtomicU64::new(0),
                journal,
                journal_executor,
                trim_executor,
                ui_thread_check,
            }),
        })
    }

    /// Check whether a readable entry for `key` exists with its clean file
    /// still on disk. Advisory: eviction can race the existence check.
    pub fn has(&self, key: &str) -> CellarResult<bool> {
        validate_key(key)?;
        let clean_path = {
            let mut entries = self.shared.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.is_readable() => Some(entry.clean_path().to_path_buf()),
                _ => None,
            }
        };
        Ok(clean_path.map_or(false, |path| path.exists()))
    }

    /// Open a snapshot reader over the entry's committed payload.
    ///
    /// Absent when the entry does not exist, is not readable, or its clean
    /// file fails to open. A successful lookup makes the entry
    /// most-recently-used.
    pub fn get(&self, key: &str) -> CellarResult<Option<SnapshotReader>> {
        validate_key(key)?;
        let snapshot = {
            let mut entries = self.shared.entries.lock();
            entries
                .get(key)
                .filter(|entry| entry.is_readable())
                .map(|entry| (entry.clean_path().to_path_buf(), entry.length_in_bytes()))
        };
        match snapshot {
            None => {
                self.shared.miss_count.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some((clean_path, length_in_bytes)) => {
                self.shared.hit_count.fetch_add(1, Ordering::Relaxed);
                match SnapshotReader::open(&clean_path, length_in_bytes) {
                    Ok(reader) => Ok(Some(reader)),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    /// Start an edit of `key`, creating the entry if needed.
    ///
    /// Absent on a stub cache or when the dirty file cannot be created even
    /// after recreating the cache directory. Fails with an illegal-state
    /// error when an editor is already live for `key`.
    pub fn edit(&self, key: &str) -> CellarResult<Option<EditorWriter>> {
        validate_key(key)?;
        let shared = &self.shared;
        let Some(directory) = shared.directory.clone() else { return Ok(None) };
        if shared.max_size_in_bytes.load(Ordering::Relaxed) == 0 || shared.max_count == 0 {
            return Ok(None);
        }

        let id = shared.next_writer_id.fetch_add(1, Ordering::Relaxed);
        let dirty_path;
        {
            let mut entries = shared.entries.lock();
            if let Some(entry) = entries.get_mut(key) {
                if entry.writer_id().is_some() {
                    return Err(CellarError::EditInProgress { key: key.to_string() });
                }
                entry.set_writer_id(Some(id));
                dirty_path = entry.dirty_path().to_path_buf();
            } else {
                let mut entry = Entry::new(&directory, key);
                entry.set_writer_id(Some(id));
                dirty_path = entry.dirty_path().to_path_buf();
                entries.put(key.to_string(), entry);
            }
        }
        log_dirty(shared, key);

        let file = match File::create(&dirty_path) {
            Ok(file) => file,
            Err(_) => {
                // The directory may have been cleared externally; recreate and
                // retry once before giving up on this edit.
                let _ = fs::create_dir_all(&directory);
                match File::create(&dirty_path) {
                    Ok(file) => file,
                    Err(_) => {
                        release_writer_slot(shared, key, id);
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(EditorWriter::new(Arc::clone(shared), key.to_string(), id, file)))
    }

    /// Remove the entry and delete its clean file.
    ///
    /// Fails with an illegal-state error while an editor is live for `key`;
    /// commit or abort first. A failed file delete parks the entry on a
    /// retry list walked before each eviction pass.
    pub fn remove(&self, key: &str) -> CellarResult<()> {
        validate_key(key)?;
        remove_entry(&self.shared, key)
    }

    /// Trim to the current budgets now and compact the journal if it has
    /// crossed the rebuild threshold.
    pub fn flush(&self) {
        trim_to_size_and_count(&self.shared);
        if let Some(journal) = &self.shared.journal {
            if journal.needs_rebuild() {
                schedule_rebuild(&self.shared);
            }
        }
    }

    /// Trim, compact the journal unconditionally, and close it.
    ///
    /// Must not be called on the embedder's UI thread.
    pub fn close(&self) -> CellarResult<()> {
        assert_off_ui_thread(&self.shared.ui_thread_check, "cache close")?;
        trim_to_size_and_count(&self.shared);
        if let Some(journal) = &self.shared.journal {
            journal.rebuild(&journal_records(&self.shared));
            journal.close();
        }
        Ok(())
    }

    /// Update the byte budget and schedule an eviction pass.
    pub fn set_max_size_in_bytes(&self, max_size_in_bytes: u64) {
        self.shared.max_size_in_bytes.store(max_size_in_bytes, Ordering::Relaxed);
        schedule_trim(&self.shared);
    }

    /// Cache directory, `None` for a stub cache.
    pub fn directory(&self) -> Option<&Path> {
        self.shared.directory.as_deref()
    }

    /// Current bytes across all readable entries.
    pub fn size(&self) -> u64 {
        self.shared.size_in_bytes.load(Ordering::Relaxed)
    }

    /// Current number of indexed entries.
    pub fn count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn max_size_in_bytes(&self) -> u64 {
        self.shared.max_size_in_bytes.load(Ordering::Relaxed)
    }

    pub fn max_count(&self) -> usize {
        self.shared.max_count
    }

    /// Hit-rate summary:
    /// `CellarCache[max_size_in_bytes=…,hits=…,misses=…,hitRate=…%]`
    pub fn hit_rate_string(&self) -> String {
        let hits = self.shared.hit_count.load(Ordering::Relaxed);
        let misses = self.shared.miss_count.load(Ordering::Relaxed);
        let accesses = hits + misses;
        let hit_percent = if accesses != 0 { 100 * hits / accesses } else { 0 };
        format!(
            "CellarCache[max_size_in_bytes={},hits={},misses={},hitRate={}%]",
            self.shared.max_size_in_bytes.load(Ordering::Relaxed),
            hits,
            misses,
            hit_percent
        )
    }
}

fn validate_key(key: &str) -> CellarResult<()> {
    let valid = !key.is_empty()
        && key.len() <= 120
        && key.bytes().all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(CellarError::InvalidKey { key: key.to_string() })
    }
}

fn assert_off_ui_thread(
    check: &Option<UiThreadCheck>,
    operation: &'static str,
) -> CellarResult<()> {
    if let Some(is_ui_thread) = check {
        if is_ui_thread() {
            return Err(CellarError::UiThreadAccess { operation });
        }
    }
    Ok(())
}

/// True while this generation id still owns the entry's editor slot.
pub(crate) fn is_current_writer(shared: &Shared, key: &str, id: u64) -> bool {
    let entries = shared.entries.lock();
    entries.peek(key).map_or(false, |entry| entry.writer_id() == Some(id))
}

/// Publish a finished edit: rename dirty over clean, account the new length,
/// journal the CLEAN. An edit that wrote nothing leaves the previous payload
/// standing; a failed rename discards the entry entirely.
pub(crate) fn commit_edit(shared: &Arc<Shared>, key: &str) {
    let paths = {
        let entries = shared.entries.lock();
        entries.peek(key).map(|entry| {
            (
                entry.dirty_path().to_path_buf(),
                entry.clean_path().to_path_buf(),
                entry.length_in_bytes(),
            )
        })
    };
    let Some((dirty_path, clean_path, old_length)) = paths else { return };

    if !dirty_path.exists() {
        let mut entries = shared.entries.lock();
        if let Some(entry) = entries.peek_mut(key) {
            entry.set_writer_id(None);
        }
        drop(entries);
        finish_update(shared, key);
    } else if fs::rename(&dirty_path, &clean_path).is_ok() {
        let new_length = fs::metadata(&clean_path).map(|m| m.len()).unwrap_or(0);
        {
            let mut entries = shared.entries.lock();
            // get_mut also bumps the published entry to most-recently-used
            if let Some(entry) = entries.get_mut(key) {
                entry.mark_published(new_length);
            }
        }
        shared.size_in_bytes.fetch_add(new_length, Ordering::Relaxed);
        shared.size_in_bytes.fetch_sub(old_length, Ordering::Relaxed);
        finish_update(shared, key);
    } else {
        abort_edit(shared, key);
        let _ = remove_entry(shared, key);
    }
}

/// Discard an edit: delete the dirty file, free the editor slot, and drop the
/// entry if it never published.
pub(crate) fn abort_edit(shared: &Arc<Shared>, key: &str) {
    let dirty_path = {
        let entries = shared.entries.lock();
        entries.peek(key).map(|entry| entry.dirty_path().to_path_buf())
    };
    if let Some(dirty_path) = dirty_path {
        if dirty_path.exists() {
            let _ = fs::remove_file(&dirty_path);
        }
    }
    {
        let mut entries = shared.entries.lock();
        if let Some(entry) = entries.peek_mut(key) {
            entry.set_writer_id(None);
        }
    }
    finish_update(shared, key);
}

/// Post-edit bookkeeping shared by commit and abort: journal a CLEAN for a
/// readable entry, drop an unreadable one, and trim if over budget.
fn finish_update(shared: &Arc<Shared>, key: &str) {
    let published_length = {
        let mut entries = shared.entries.lock();
        let state = entries.peek(key).map(|e| (e.is_readable(), e.length_in_bytes()));
        match state {
            Some((true, length)) => Some(length),
            Some((false, _)) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    };
    if let Some(length) = published_length {
        log_clean(shared, key, length);
    }
    if over_budget(shared) {
        schedule_trim(shared);
    }
}

/// Drop `key` from the index and delete its clean file. Errors while an
/// editor is live. A failed delete parks the file for retry instead of
/// leaking the accounted bytes.
pub(crate) fn remove_entry(shared: &Shared, key: &str) -> CellarResult<()> {
    let entry = {
        let mut entries = shared.entries.lock();
        match entries.peek(key).map(|e| e.writer_id().is_some()) {
            None => return Ok(()),
            Some(true) => {
                return Err(CellarError::RemoveDuringEdit { key: key.to_string() });
            }
            Some(false) => entries.pop(key),
        }
    };
    if let Some(entry) = entry {
        if !entry.clean_path().exists() || fs::remove_file(entry.clean_path()).is_ok() {
            shared.size_in_bytes.fetch_sub(entry.length_in_bytes(), Ordering::Relaxed);
        } else {
            shared.remove_retry.lock().push(RetryFile {
                clean_path: entry.clean_path().to_path_buf(),
                length_in_bytes: entry.length_in_bytes(),
            });
        }
    }
    Ok(())
}

fn release_writer_slot(shared: &Shared, key: &str, id: u64) {
    let mut entries = shared.entries.lock();
    if let Some(entry) = entries.peek_mut(key) {
        if entry.writer_id() == Some(id) {
            entry.set_writer_id(None);
            if !entry.is_readable() {
                entries.pop(key);
            }
        }
    }
}

fn over_budget(shared: &Shared) -> bool {
    shared.size_in_bytes.load(Ordering::Relaxed)
        > shared.max_size_in_bytes.load(Ordering::Relaxed)
        || shared.entries.lock().len() > shared.max_count
}

/// Evict from the least-recently-used end until both budgets hold.
///
/// Deliberately not strict: entries under edit are skipped, so the cache may
/// stay over budget until their editors finish.
fn trim_to_size_and_count(shared: &Shared) {
    let _trim_guard = shared.trim_lock.lock();
    retry_pending_removes(shared);
    loop {
        if !over_budget(shared) {
            break;
        }
        let victim = {
            let entries = shared.entries.lock();
            entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.writer_id().is_none())
                .map(|(key, _)| key.clone())
        };
        let Some(key) = victim else { break };
        let _ = remove_entry(shared, &key);
    }
}

/// Re-attempt deletes that failed during remove, freeing their bytes.
fn retry_pending_removes(shared: &Shared) {
    let mut retry = shared.remove_retry.lock();
    retry.retain(|file| {
        if file.clean_path.exists() && fs::remove_file(&file.clean_path).is_ok() {
            shared.size_in_bytes.fetch_sub(file.length_in_bytes, Ordering::Relaxed);
            false
        } else {
            true
        }
    });
}

/// Snapshot the index for a journal rebuild, least-recently-used first so
/// replay reconstructs the same access order.
fn journal_records(shared: &Shared) -> Vec<JournalRecord> {
    let entries = shared.entries.lock();
    entries
        .iter()
        .rev()
        .map(|(key, entry)| JournalRecord {
            key: key.clone(),
            readable: entry.is_readable(),
            length_in_bytes: entry.length_in_bytes(),
        })
        .collect()
}

fn log_dirty(shared: &Arc<Shared>, key: &str) {
    let weak = Arc::downgrade(shared);
    let key = key.to_string();
    shared.journal_executor.execute(move || {
        let Some(shared) = weak.upgrade() else { return };
        let Some(journal) = &shared.journal else { return };
        if journal.append_dirty(&key) {
            schedule_rebuild(&shared);
        }
    });
}

fn log_clean(shared: &Arc<Shared>, key: &str, length_in_bytes: u64) {
    let weak = Arc::downgrade(shared);
    let key = key.to_string();
    shared.journal_executor.execute(move || {
        let Some(shared) = weak.upgrade() else { return };
        let Some(journal) = &shared.journal else { return };
        if journal.append_clean(&key, length_in_bytes) {
            schedule_rebuild(&shared);
        }
    });
}

fn schedule_rebuild(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    shared.journal_executor.execute(move || {
        let Some(shared) = weak.upgrade() else { return };
        let Some(journal) = &shared.journal else { return };
        // A burst of appends may have queued several of these.
        if journal.needs_rebuild() {
            journal.rebuild(&journal_records(&shared));
        }
    });
}

fn schedule_trim(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    shared.trim_executor.execute(move || {
        let Some(shared) = weak.upgrade() else { return };
        if over_budget(&shared) {
            trim_to_size_and_count(&shared);
        }
    });
}
