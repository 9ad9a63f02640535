//! Cellar Core — Bounded, Journaled LRU Disk Cache
//!
//! A disk cache mapping short string keys (`[a-z0-9_-]{1,120}`) to opaque
//! byte blobs, one file per entry, with crash-safe recovery and automatic
//! background eviction once byte or entry-count budgets are exceeded.
//!
//! # Architecture
//!
//! - **Read path**: open a stable snapshot of the committed `<key>.clean`
//!   file; concurrent rewrites never disturb an in-progress read
//! - **Write path**: stream into `<key>.tmp` under an exclusive editor,
//!   publish via atomic rename on commit
//! - **Journal**: an append-only log of DIRTY/CLEAN transitions replayed on
//!   open and periodically compacted through a temp-plus-backup swap
//! - **Eviction**: least-recently-used entries are removed in the background
//!   until the cache fits its budgets; entries under edit are never evicted
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use std::sync::Arc;
//! use cellar_core::{CacheConfig, CellarCache, SerialExecutor};
//!
//! let executor = Arc::new(SerialExecutor::new("journal")?);
//! let cache = CellarCache::open(CacheConfig::new("/tmp/cellar"), executor)?;
//!
//! if let Some(mut editor) = cache.edit("thumb_42")? {
//!     editor.write(b"...rendered bytes...")?;
//!     editor.commit()?;
//! }
//! if let Some(mut reader) = cache.get("thumb_42")? {
//!     let mut bytes = Vec::new();
//!     reader.read_to_end(&mut bytes)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod executor;
pub mod journal;
pub mod reader;
pub mod writer;

// Re-export key types for convenience
pub use cache::{CellarCache, UiThreadCheck};
pub use config::{CacheConfig, DEFAULT_MAX_COUNT, DEFAULT_MAX_SIZE_IN_BYTES};
pub use error::{CellarError, CellarResult};
pub use executor::SerialExecutor;
pub use reader::SnapshotReader;
pub use writer::EditorWriter;
