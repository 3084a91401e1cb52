//! Purpose: Define the local client that turns a data directory into counters.
//! Exports: `LocalClient`, `ApiResult`.
//! Role: Single place where the CLI and server build a `Registry` over a `FileBackend`.
//! Invariants: Data directory resolution matches the CLI default (`~/.tally/counters`).
//! Invariants: Every registry built here applies the configured I/O timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::backend::FileBackend;
use crate::core::error::Error;
use crate::core::key::normalize;
use crate::core::store::{DEFAULT_IO_TIMEOUT, Registry, StoreLocator};
use crate::data_paths::default_data_dir;

pub type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Debug)]
pub struct LocalClient {
    data_dir: PathBuf,
    io_timeout: Duration,
}

impl LocalClient {
    pub fn new() -> Self {
        Self {
            data_dir: default_data_dir(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Opens the data directory (creating it if needed) and returns a registry over it.
    pub fn registry(&self) -> ApiResult<Registry> {
        let backend = FileBackend::open(&self.data_dir)?;
        Ok(Registry::new(Arc::new(backend)).with_timeout(self.io_timeout))
    }

    pub async fn get(&self, raw_key: &str) -> ApiResult<u64> {
        self.registry()?.locate(&normalize(raw_key)).get().await
    }

    pub async fn hit(&self, raw_key: &str) -> ApiResult<u64> {
        self.registry()?.locate(&normalize(raw_key)).increment().await
    }
}

impl Default for LocalClient {
    fn default() -> Self {
        Self::new()
    }
}
