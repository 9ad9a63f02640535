//! Write handle over an in-progress cache entry edit
//!
//! Writes land in the entry's dirty file and are silently tolerant: an I/O
//! failure sets an internal error flag instead of surfacing, and `commit`
//! reports it by returning false after discarding the stale entry. The
//! handle must finish with `commit` or `abort`; a leaked handle aborts
//! itself on drop.
//!
//! Identity is tracked by a generation id: each terminal call re-checks that
//! this handle is still the entry's registered writer, and fails with an
//! illegal-state error if another editor holds the slot.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use crate::cache::{self, Shared};
use crate::error::{CellarError, CellarResult};

/// Exclusive editor for one cache entry.
///
/// State machine: open → committed | aborted. Every call after a terminal
/// one fails with an illegal-state error.
pub struct EditorWriter {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    /// Open dirty file; dropped (closed) on the first terminal call
    file: Option<File>,
    has_errors: bool,
    closed: bool,
}

impl EditorWriter {
    pub(crate) fn new(shared: Arc<Shared>, key: String, id: u64, file: File) -> Self {
        Self {
            shared,
            key,
            id,
            file: Some(file),
            has_errors: false,
            closed: false,
        }
    }

    /// Key of the entry under edit.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append bytes to the dirty file.
    ///
    /// I/O failures are absorbed into an internal flag checked at `commit`.
    /// Calling after `commit` or `abort` is an illegal-state error.
    pub fn write(&mut self, buf: &[u8]) -> CellarResult<()> {
        if self.closed {
            return Err(CellarError::StreamClosed);
        }
        if let Some(file) = self.file.as_mut() {
            if file.write_all(buf).is_err() {
                self.has_errors = true;
            }
        }
        Ok(())
    }

    /// Publish the edit.
    ///
    /// Returns false if any write failed, in which case the edit is aborted
    /// and the entry removed. The previous payload is stale.
    pub fn commit(&mut self) -> CellarResult<bool> {
        self.check_active()?;
        drop(self.file.take());
        self.closed = true;
        if self.has_errors {
            cache::abort_edit(&self.shared, &self.key);
            let _ = cache::remove_entry(&self.shared, &self.key);
            Ok(false)
        } else {
            cache::commit_edit(&self.shared, &self.key);
            Ok(true)
        }
    }

    /// Discard the edit, deleting the dirty file.
    pub fn abort(&mut self) -> CellarResult<()> {
        self.check_active()?;
        drop(self.file.take());
        self.closed = true;
        cache::abort_edit(&self.shared, &self.key);
        Ok(())
    }

    /// Abort unless a terminal call already happened. Idempotent; also runs
    /// on drop so an editor can never be leaked in the open state.
    pub fn abort_unless_committed(&mut self) {
        if !self.closed {
            let _ = self.abort();
            self.closed = true;
        }
    }

    fn check_active(&self) -> CellarResult<()> {
        if self.closed {
            return Err(CellarError::StreamClosed);
        }
        if !cache::is_current_writer(&self.shared, &self.key, self.id) {
            return Err(CellarError::ConcurrentEditors { key: self.key.clone() });
        }
        Ok(())
    }
}

impl Drop for EditorWriter {
    fn drop(&mut self) {
        self.abort_unless_committed();
    }
}
