//! Append-only journal of entry state transitions
//!
//! The cache records every entry transition as one ASCII line in a file named
//! `journal` inside the cache directory:
//!
//! ```text
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832
//! DIRTY 335c4c6028171cfddfbaae1a9c313c52
//! CLEAN 335c4c6028171cfddfbaae1a9c313c52 3934
//! ```
//!
//! - `DIRTY <key>` marks an edit in progress. A DIRTY with no later CLEAN
//!   means the edit never published; its files are deleted on the next open.
//! - `CLEAN <key> <length>` marks a published payload of `length` bytes.
//!
//! Replaying the journal in line order reconstructs the entry map with its
//! access ordering intact, because the compacted journal is written from
//! least- to most-recently used.
//!
//! Compaction is crash-safe through a temp-plus-backup swap:
//! 1. Write the compacted log to `journal.tmp`
//! 2. Rename `journal` to `journal.bkp`
//! 3. Rename `journal.tmp` to `journal`
//! 4. Delete `journal.bkp`
//!
//! A crash between 2 and 3 leaves only the backup, which is promoted on the
//! next open; a crash between 3 and 4 leaves an obsolete backup, which is
//! deleted on the next open.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashSet;
use lru::LruCache;
use parking_lot::Mutex;

use crate::entry::{Entry, CLEAN_FILE_EXTENSION, DIRTY_FILE_EXTENSION};

/// Live journal filename
pub const JOURNAL_FILE: &str = "journal";

/// Scratch filename used only during a rebuild
pub const JOURNAL_FILE_TMP: &str = "journal.tmp";

/// Backup filename; present at open time only after a crash mid-rebuild
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";

/// A rebuild is scheduled once the line count exceeds this (soft bound)
pub const REBUILD_THRESHOLD: usize = 1000;

const CLEAN_PREFIX: &str = "CLEAN";
const DIRTY_PREFIX: &str = "DIRTY";

/// One entry's worth of journal state, snapshotted for a rebuild.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub key: String,
    pub readable: bool,
    pub length_in_bytes: u64,
}

struct JournalState {
    /// Append writer on the live journal; `None` when unopened or closed
    writer: Option<BufWriter<File>>,
    /// Lines in the live journal, counted across recovery and appends
    line_count: usize,
}

/// Journal file set and append state for one cache directory.
pub struct Journal {
    directory: PathBuf,
    journal_path: PathBuf,
    tmp_path: PathBuf,
    backup_path: PathBuf,
    state: Mutex<JournalState>,
}

impl Journal {
    pub fn new(directory: &Path) -> Self {
        Self {
            journal_path: directory.join(JOURNAL_FILE),
            tmp_path: directory.join(JOURNAL_FILE_TMP),
            backup_path: directory.join(JOURNAL_FILE_BACKUP),
            directory: directory.to_path_buf(),
            state: Mutex::new(JournalState { writer: None, line_count: 0 }),
        }
    }

    /// Rebuild the entry map from the journal on disk.
    ///
    /// Promotes a leftover backup first. On success the append writer is left
    /// open and the recovered map is returned in least- to most-recently-used
    /// order. On a missing, corrupted, or unreadable journal every `.clean`
    /// and `.tmp` file in the directory is deleted and `None` is returned;
    /// the caller starts over with an empty cache.
    pub fn recover_entries(&self) -> Option<LruCache<String, Entry>> {
        promote_backup(&self.journal_path, &self.backup_path);

        if self.journal_path.exists() {
            if let Some(entries) = self.replay() {
                return Some(entries);
            }
            eprintln!(
                "[JOURNAL] Unreadable journal at {}, sweeping cache directory",
                self.journal_path.display()
            );
        }
        sweep_directory(&self.directory);
        None
    }

    fn replay(&self) -> Option<LruCache<String, Entry>> {
        let file = File::open(&self.journal_path).ok()?;
        let reader = BufReader::new(file);

        let mut entries: LruCache<String, Entry> = LruCache::unbounded();
        let mut dirty_pending: HashSet<String> = HashSet::new();
        let mut line_count = 0usize;

        for line in reader.lines() {
            let line = line.ok()?;
            self.apply_line(&line, &mut entries, &mut dirty_pending)?;
            line_count += 1;
        }

        // A DIRTY with no matching CLEAN: the edit never published.
        for key in dirty_pending {
            let stale = Entry::new(&self.directory, &key);
            delete_file_if_exists(stale.clean_path());
            delete_file_if_exists(stale.dirty_path());
            entries.pop(&key);
        }

        let mut state = self.state.lock();
        state.line_count = line_count;
        state.writer = open_append_writer(&self.journal_path);
        Some(entries)
    }

    /// Apply one journal line; `None` marks the journal corrupted.
    fn apply_line(
        &self,
        line: &str,
        entries: &mut LruCache<String, Entry>,
        dirty_pending: &mut HashSet<String>,
    ) -> Option<()> {
        let tokens: Vec<&str> = line.split(' ').collect();
        match tokens.as_slice() {
            [state, key, length] if *state == CLEAN_PREFIX => {
                let length: u64 = length.parse().ok()?;
                if let Some(entry) = entries.get_mut(*key) {
                    entry.mark_published(length);
                } else {
                    let mut entry = Entry::new(&self.directory, key);
                    entry.mark_published(length);
                    entries.put(key.to_string(), entry);
                }
                dirty_pending.remove(*key);
                Some(())
            }
            [state, key] if *state == DIRTY_PREFIX => {
                dirty_pending.insert(key.to_string());
                Some(())
            }
            _ => None,
        }
    }

    /// Append a `CLEAN` line. Returns true once the rebuild threshold is crossed.
    pub fn append_clean(&self, key: &str, length_in_bytes: u64) -> bool {
        self.append_line(&format!("{} {} {}\n", CLEAN_PREFIX, key, length_in_bytes))
    }

    /// Append a `DIRTY` line. Returns true once the rebuild threshold is crossed.
    pub fn append_dirty(&self, key: &str) -> bool {
        self.append_line(&format!("{} {}\n", DIRTY_PREFIX, key))
    }

    fn append_line(&self, line: &str) -> bool {
        let mut state = self.state.lock();
        let Some(writer) = state.writer.as_mut() else { return false };
        if writer.write_all(line.as_bytes()).is_err() {
            return false;
        }
        if writer.flush().is_err() {
            return false;
        }
        state.line_count += 1;
        state.line_count > REBUILD_THRESHOLD
    }

    /// Double-checked inside the scheduled rebuild task to absorb bursts.
    pub fn needs_rebuild(&self) -> bool {
        self.state.lock().line_count > REBUILD_THRESHOLD
    }

    /// Replace the journal with a compacted log of one line per entry.
    ///
    /// `records` must be ordered least- to most-recently used so the access
    /// ordering survives the next open. Failures are absorbed; the worst
    /// outcome is an oversized or stale journal reconciled on the next open.
    pub fn rebuild(&self, records: &[JournalRecord]) {
        let mut state = self.state.lock();
        state.writer = None;
        state.line_count = records.len();

        let tmp_file = match File::create(&self.tmp_path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("[JOURNAL] Rebuild failed to create {}: {}", self.tmp_path.display(), e);
                return;
            }
        };
        let mut tmp = BufWriter::new(tmp_file);
        for record in records {
            let line = if record.readable {
                format!("{} {} {}\n", CLEAN_PREFIX, record.key, record.length_in_bytes)
            } else {
                format!("{} {}\n", DIRTY_PREFIX, record.key)
            };
            if tmp.write_all(line.as_bytes()).is_err() {
                return;
            }
        }
        if tmp.flush().is_err() {
            return;
        }
        drop(tmp);

        if self.journal_path.exists() {
            let _ = fs::rename(&self.journal_path, &self.backup_path);
        }
        let _ = fs::rename(&self.tmp_path, &self.journal_path);
        state.writer = open_append_writer(&self.journal_path);
        let _ = fs::remove_file(&self.backup_path);
    }

    /// Close the append writer; later appends become no-ops.
    pub fn close(&self) {
        self.state.lock().writer = None;
    }
}

/// A surviving backup means a rebuild crashed mid-swap. If the primary also
/// survived the backup is obsolete; otherwise the backup is the journal.
fn promote_backup(journal_path: &Path, backup_path: &Path) {
    if backup_path.exists() {
        if journal_path.exists() {
            let _ = fs::remove_file(backup_path);
        } else {
            let _ = fs::rename(backup_path, journal_path);
        }
    }
}

/// Delete every cache payload file in the directory, tracked or not.
fn sweep_directory(directory: &Path) {
    let Ok(dir_entries) = fs::read_dir(directory) else { return };
    for dir_entry in dir_entries.flatten() {
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(CLEAN_FILE_EXTENSION) || name.ends_with(DIRTY_FILE_EXTENSION) {
            let _ = fs::remove_file(dir_entry.path());
        }
    }
}

fn delete_file_if_exists(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}

fn open_append_writer(path: &Path) -> Option<BufWriter<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
        .map(BufWriter::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_journal(dir: &Path, contents: &str) {
        fs::write(dir.join(JOURNAL_FILE), contents).unwrap();
    }

    fn read_journal(dir: &Path) -> String {
        String::from_utf8(fs::read(dir.join(JOURNAL_FILE)).unwrap()).unwrap()
    }

    #[test]
    fn test_replay_dirty_then_clean() {
        let temp = TempDir::new().unwrap();
        write_journal(temp.path(), "DIRTY k1\nCLEAN k1 12\n");

        let journal = Journal::new(temp.path());
        let entries = journal.recover_entries().unwrap();

        assert_eq!(entries.len(), 1);
        let entry = entries.peek("k1").unwrap();
        assert!(entry.is_readable());
        assert_eq!(entry.length_in_bytes(), 12);
    }

    #[test]
    fn test_replay_unmatched_dirty_deletes_files() {
        let temp = TempDir::new().unwrap();
        let clean = temp.path().join("k1.clean");
        let dirty = temp.path().join("k1.tmp");
        fs::write(&clean, "A").unwrap();
        fs::write(&dirty, "D").unwrap();
        write_journal(temp.path(), "CLEAN k1 1\nDIRTY k1\n");

        let journal = Journal::new(temp.path());
        let entries = journal.recover_entries().unwrap();

        assert_eq!(entries.len(), 0);
        assert!(!clean.exists());
        assert!(!dirty.exists());
    }

    #[test]
    fn test_replay_dirty_only_key_still_swept() {
        let temp = TempDir::new().unwrap();
        let dirty = temp.path().join("k2.tmp");
        fs::write(&dirty, "partial").unwrap();
        write_journal(temp.path(), "DIRTY k2\n");

        let journal = Journal::new(temp.path());
        let entries = journal.recover_entries().unwrap();

        assert_eq!(entries.len(), 0);
        assert!(!dirty.exists());
    }

    #[test]
    fn test_backup_promoted_when_primary_missing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(JOURNAL_FILE_BACKUP), "DIRTY k1\nCLEAN k1 12\n").unwrap();

        let journal = Journal::new(temp.path());
        let entries = journal.recover_entries().unwrap();

        assert_eq!(entries.len(), 1);
        assert!(temp.path().join(JOURNAL_FILE).exists());
        assert!(!temp.path().join(JOURNAL_FILE_BACKUP).exists());
    }

    #[test]
    fn test_backup_deleted_when_primary_exists() {
        let temp = TempDir::new().unwrap();
        write_journal(temp.path(), "CLEAN k1 3\n");
        fs::write(temp.path().join(JOURNAL_FILE_BACKUP), "CLEAN stale 9\n").unwrap();

        let journal = Journal::new(temp.path());
        let entries = journal.recover_entries().unwrap();

        assert_eq!(entries.len(), 1);
        assert!(entries.peek("k1").is_some());
        assert!(!temp.path().join(JOURNAL_FILE_BACKUP).exists());
    }

    #[test]
    fn test_corrupted_line_sweeps_directory() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("g1.clean"), "A").unwrap();
        fs::write(temp.path().join("other.tmp"), "B").unwrap();
        write_journal(temp.path(), "CLEAN k1 1\nBOGUS\n");

        let journal = Journal::new(temp.path());
        assert!(journal.recover_entries().is_none());
        assert!(!temp.path().join("g1.clean").exists());
        assert!(!temp.path().join("other.tmp").exists());
    }

    #[test]
    fn test_invalid_length_is_corruption() {
        let temp = TempDir::new().unwrap();
        write_journal(temp.path(), "CLEAN k1 0000x001\n");
        assert!(Journal::new(temp.path()).recover_entries().is_none());
    }

    #[test]
    fn test_too_many_tokens_is_corruption() {
        let temp = TempDir::new().unwrap();
        write_journal(temp.path(), "CLEAN k1 1 1\n");
        assert!(Journal::new(temp.path()).recover_entries().is_none());
    }

    #[test]
    fn test_missing_journal_sweeps_and_returns_none() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("orphan.clean"), "A").unwrap();

        assert!(Journal::new(temp.path()).recover_entries().is_none());
        assert!(!temp.path().join("orphan.clean").exists());
    }

    #[test]
    fn test_append_line_format() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        journal.rebuild(&[]);

        journal.append_dirty("k1");
        journal.append_clean("k1", 12);
        assert_eq!(read_journal(temp.path()), "DIRTY k1\nCLEAN k1 12\n");
    }

    #[test]
    fn test_rebuild_compacts_to_one_line_per_entry() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        journal.rebuild(&[]);
        for _ in 0..5 {
            journal.append_dirty("a");
            journal.append_clean("a", 1);
        }

        journal.rebuild(&[
            JournalRecord { key: "a".to_string(), readable: true, length_in_bytes: 1 },
            JournalRecord { key: "b".to_string(), readable: false, length_in_bytes: 0 },
        ]);

        assert_eq!(read_journal(temp.path()), "CLEAN a 1\nDIRTY b\n");
        assert!(!temp.path().join(JOURNAL_FILE_TMP).exists());
        assert!(!temp.path().join(JOURNAL_FILE_BACKUP).exists());
    }

    #[test]
    fn test_rebuild_threshold_crossing() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        journal.rebuild(&[]);

        for _ in 0..REBUILD_THRESHOLD {
            assert!(!journal.needs_rebuild());
            journal.append_dirty("k");
        }
        assert!(journal.append_dirty("k"));
        assert!(journal.needs_rebuild());
    }

    #[test]
    fn test_append_after_close_is_noop() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        journal.rebuild(&[]);
        journal.close();

        journal.append_clean("k1", 3);
        assert_eq!(read_journal(temp.path()), "");
    }

    #[test]
    fn test_recovered_line_count_carries_into_threshold() {
        let temp = TempDir::new().unwrap();
        let mut contents = String::new();
        for _ in 0..REBUILD_THRESHOLD {
            contents.push_str("CLEAN k1 1\n");
        }
        write_journal(temp.path(), &contents);

        let journal = Journal::new(temp.path());
        journal.recover_entries().unwrap();
        assert!(journal.append_dirty("k1"));
    }
}
