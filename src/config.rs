//! Configuration for pools, readers and writers.

use serde::{Deserialize, Serialize};

/// Default byte block size (32KB).
pub const DEFAULT_BYTE_BLOCK_SIZE: usize = 1 << 15;

/// Default int block size (8K ints).
pub const DEFAULT_INT_BLOCK_SIZE: usize = 1 << 13;

/// Name of the lock guarding index modifications.
pub const WRITE_LOCK_NAME: &str = "write";

/// Configuration for the slab pools used while buffering postings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Size of each byte block.
    pub byte_block_size: usize,

    /// Size of each int block.
    pub int_block_size: usize,

    /// Maximum number of free blocks the recycler keeps around.
    pub max_buffered_blocks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            byte_block_size: DEFAULT_BYTE_BLOCK_SIZE,
            int_block_size: DEFAULT_INT_BLOCK_SIZE,
            max_buffered_blocks: 64,
        }
    }
}

impl PoolConfig {
    /// Set the byte block size.
    pub fn with_byte_block_size(mut self, size: usize) -> Self {
        self.byte_block_size = size;
        self
    }

    /// Set the int block size.
    pub fn with_int_block_size(mut self, size: usize) -> Self {
        self.int_block_size = size;
        self
    }
}

/// Configuration for opening a composite reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Open the reader read-only. Read-only readers never take the write lock.
    pub read_only: bool,

    /// How long `acquire_write_lock` waits for the write lock.
    pub write_lock_timeout_ms: u64,

    /// Return `None` instead of all-ones norms for fields without norms.
    pub disable_fake_norms: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            read_only: true,
            write_lock_timeout_ms: 1000,
            disable_fake_norms: false,
        }
    }
}

impl ReaderConfig {
    /// Configuration for a reader that may delete documents and set norms.
    pub fn writable() -> Self {
        ReaderConfig {
            read_only: false,
            ..Default::default()
        }
    }

    /// Set the read-only flag.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the write lock timeout.
    pub fn with_write_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.write_lock_timeout_ms = timeout_ms;
        self
    }

    /// Disable fake norms.
    pub fn with_disable_fake_norms(mut self, disable: bool) -> Self {
        self.disable_fake_norms = disable;
        self
    }
}

/// Configuration for the index writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Write new segments in compound-file mode.
    pub use_compound_file: bool,

    /// How long the writer waits for the write lock.
    pub write_lock_timeout_ms: u64,

    /// Pool sizes for the in-memory postings buffer.
    pub pool: PoolConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            use_compound_file: true,
            write_lock_timeout_ms: 1000,
            pool: PoolConfig::default(),
        }
    }
}

impl WriterConfig {
    /// Set compound-file mode for new segments.
    pub fn with_compound_file(mut self, use_compound_file: bool) -> Self {
        self.use_compound_file = use_compound_file;
        self
    }

    /// Set the pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.byte_block_size, 32768);
        assert_eq!(pool.int_block_size, 8192);

        let reader = ReaderConfig::default();
        assert!(reader.read_only);
        assert!(!ReaderConfig::writable().read_only);

        let writer = WriterConfig::default();
        assert!(writer.use_compound_file);
    }

    #[test]
    fn test_config_serde() {
        let config = WriterConfig::default()
            .with_compound_file(false)
            .with_pool(PoolConfig::default().with_byte_block_size(1024));
        let json = serde_json::to_string(&config).unwrap();
        let decoded: WriterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
