//! Embedded key/value metadata service.
//!
//! A thin wrapper over `sled`, constructed from the `[services]` block and
//! handed out on the built stack. The core layers do not depend on it; it
//! exists for applications that want durable metadata next to the stack.

use anyhow::{Context, Result};

/// Default on-disk location when the config names none.
const DEFAULT_PATH: &str = ".tamperstack-meta";

/// Durable key/value store for stack applications.
pub struct MetadataService {
    db: sled::Db,
}

impl MetadataService {
    /// Opens (or creates) the store.
    ///
    /// `cache_size` bounds the in-memory page cache; `threads > 1` opts into
    /// the throughput-oriented flush mode.
    ///
    /// # Errors
    ///
    /// Fails if the backing directory cannot be opened.
    pub fn open(cache_size: u64, threads: usize, path: Option<&str>) -> Result<Self> {
        let mode =
            if threads > 1 { sled::Mode::HighThroughput } else { sled::Mode::LowSpace };
        let db = sled::Config::new()
            .path(path.unwrap_or(DEFAULT_PATH))
            .cache_capacity(cache_size)
            .mode(mode)
            .open()
            .context("cannot open metadata store")?;
        Ok(Self { db })
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value).context("metadata put failed")?;
        Ok(())
    }

    /// Fetches the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.db.get(key).context("metadata get failed")?;
        Ok(value.map(|v| v.to_vec()))
    }

    /// Removes `key`; absent keys are fine.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key).context("metadata delete failed")?;
        Ok(())
    }

    /// Flushes buffered writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("metadata flush failed")?;
        Ok(())
    }
}
