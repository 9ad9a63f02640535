//! Configuration for a cellar cache
//!
//! A configuration with no directory, a zero byte budget, or a zero entry
//! budget produces a stub cache: every read misses, every edit is refused,
//! and nothing is ever written to disk.

use std::path::{Path, PathBuf};

/// Default byte budget: 30 MiB
pub const DEFAULT_MAX_SIZE_IN_BYTES: u64 = 30 * 1024 * 1024;

/// Default entry-count budget
pub const DEFAULT_MAX_COUNT: usize = 1000;

/// Cache configuration: directory plus byte and entry-count budgets
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Exclusive directory for cache files; `None` yields a stub cache
    pub directory: Option<PathBuf>,
    /// Soft limit on the total bytes of committed entries; 0 yields a stub cache
    pub max_size_in_bytes: u64,
    /// Soft limit on the number of entries; 0 yields a stub cache
    pub max_count: usize,
}

impl CacheConfig {
    /// Configuration for a cache rooted at `directory` with default budgets.
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: Some(directory.as_ref().to_path_buf()),
            max_size_in_bytes: DEFAULT_MAX_SIZE_IN_BYTES,
            max_count: DEFAULT_MAX_COUNT,
        }
    }

    /// True if this configuration can never store anything.
    pub fn is_stub(&self) -> bool {
        self.directory.is_none() || self.max_size_in_bytes == 0 || self.max_count == 0
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_size_in_bytes: DEFAULT_MAX_SIZE_IN_BYTES,
            max_count: DEFAULT_MAX_COUNT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uses_defaults() {
        let config = CacheConfig::new("/tmp/cellar");
        assert_eq!(config.max_size_in_bytes, DEFAULT_MAX_SIZE_IN_BYTES);
        assert_eq!(config.max_count, DEFAULT_MAX_COUNT);
        assert!(!config.is_stub());
    }

    #[test]
    fn test_stub_detection() {
        assert!(CacheConfig::default().is_stub());

        let mut config = CacheConfig::new("/tmp/cellar");
        config.max_size_in_bytes = 0;
        assert!(config.is_stub());

        let mut config = CacheConfig::new("/tmp/cellar");
        config.max_count = 0;
        assert!(config.is_stub());
    }
}
