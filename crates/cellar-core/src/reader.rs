//! Read handle over a committed cache entry
//!
//! The clean file is opened at construction, so the handle is a stable
//! snapshot: a later commit renames a new payload over the clean path, which
//! unlinks the old inode but leaves this handle's descriptor valid. Unlike
//! writes, read errors propagate to the caller.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Snapshot of one entry's committed payload.
///
/// Dropping the reader closes the underlying file.
#[derive(Debug)]
pub struct SnapshotReader {
    file: File,
    length_in_bytes: u64,
    path: PathBuf,
}

impl SnapshotReader {
    /// Open the entry's clean file, capturing its committed length.
    pub(crate) fn open(clean_path: &Path, length_in_bytes: u64) -> io::Result<Self> {
        let file = File::open(clean_path)?;
        Ok(Self {
            file,
            length_in_bytes,
            path: clean_path.to_path_buf(),
        })
    }

    /// Committed payload length at the moment this reader was opened.
    pub fn length_in_bytes(&self) -> u64 {
        self.length_in_bytes
    }

    /// Path of the clean file this reader was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_reads_committed_bytes() {
        let temp = TempDir::new().unwrap();
        let clean = temp.path().join("k1.clean");
        fs::write(&clean, "ABC").unwrap();

        let mut reader = SnapshotReader::open(&clean, 3).unwrap();
        assert_eq!(reader.length_in_bytes(), 3);
        assert_eq!(reader.path(), clean.as_path());

        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "ABC");
    }

    #[test]
    fn test_open_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        assert!(SnapshotReader::open(&temp.path().join("absent.clean"), 0).is_err());
    }
}
