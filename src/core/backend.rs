// Durable persistence for counter records: the backend seam, the commit gate,
// and the file-per-key implementation with advisory locking.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};
use crate::core::key::CounterKey;
use crate::core::record::Record;
use crate::data_paths::RecordPaths;

/// Durable key-value storage for counter values.
///
/// Implementations must make `increment` atomic per key: either the new value
/// is durably stored and returned, or the previous value is left untouched.
/// Increments of one key must also serialize inside the backend: a caller that
/// gave up releases its in-process key lock while the call may still be running.
/// `gate.enter_commit()` must be called immediately before the commit point and
/// its error returned unchanged if the operation was abandoned.
pub trait Backend: Send + Sync + 'static {
    /// Returns the stored value, or `0` when the key has never been written.
    fn load(&self, key: &CounterKey) -> Result<u64, Error>;

    fn increment(&self, key: &CounterKey, gate: &CommitGate) -> Result<u64, Error>;
}

const GATE_OPEN: u8 = 0;
const GATE_ABANDONED: u8 = 1;
const GATE_COMMITTING: u8 = 2;

/// One-shot race between a backend reaching its commit point and the caller
/// giving up on the operation. Exactly one side wins.
#[derive(Debug)]
pub struct CommitGate {
    state: AtomicU8,
}

impl CommitGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(GATE_OPEN),
        }
    }

    pub fn enter_commit(&self) -> Result<(), Error> {
        match self.state.compare_exchange(
            GATE_OPEN,
            GATE_COMMITTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::new(ErrorKind::Timeout)
                .with_message("operation abandoned before commit")),
        }
    }

    /// Returns true when the commit is now prevented; false when it already started.
    pub fn abandon(&self) -> bool {
        self.state
            .compare_exchange(
                GATE_OPEN,
                GATE_ABANDONED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for CommitGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One record file per key under a data directory.
#[derive(Clone, Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create data directory")
                .with_path(&dir)
                .with_source(err)
        })?;
        Ok(Self { dir })
    }

    fn read_value(&self, key: &CounterKey, paths: &RecordPaths) -> Result<u64, Error> {
        match fs::read(&paths.record) {
            Ok(bytes) => Record::decode(&bytes, key)
                .map(|record| record.value)
                .map_err(|err| err.with_path(&paths.record)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(Error::new(map_io_error_kind(&err))
                .with_message("failed to read counter record")
                .with_key(key.as_str())
                .with_path(&paths.record)
                .with_source(err)),
        }
    }

    fn stage(&self, record: &Record, paths: &RecordPaths) -> Result<(), Error> {
        let io_err = |err: io::Error| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to stage counter record")
                .with_key(record.key.as_str())
                .with_path(&paths.staging)
                .with_source(err)
        };
        let mut file = File::create(&paths.staging).map_err(io_err)?;
        file.write_all(&record.encode()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }
}

impl Backend for FileBackend {
    fn load(&self, key: &CounterKey) -> Result<u64, Error> {
        let paths = RecordPaths::resolve(&self.dir, key);
        self.read_value(key, &paths)
    }

    fn increment(&self, key: &CounterKey, gate: &CommitGate) -> Result<u64, Error> {
        let paths = RecordPaths::resolve(&self.dir, key);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&paths.lock)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to open counter lock")
                    .with_path(&paths.lock)
                    .with_source(err)
            })?;
        let _lock = KeyLock::acquire(&lock_file, &paths.lock)?;

        let current = self.read_value(key, &paths)?;
        let next = current.checked_add(1).ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message("counter overflow")
                .with_key(key.as_str())
        })?;
        self.stage(&Record::new(key.clone(), next), &paths)?;

        if let Err(err) = gate.enter_commit() {
            let _ = fs::remove_file(&paths.staging);
            return Err(err.with_key(key.as_str()));
        }
        if let Err(err) = fs::rename(&paths.staging, &paths.record) {
            let _ = fs::remove_file(&paths.staging);
            return Err(Error::new(map_io_error_kind(&err))
                .with_message("failed to commit counter record")
                .with_key(key.as_str())
                .with_path(&paths.record)
                .with_source(err));
        }
        sync_dir(&self.dir);
        Ok(next)
    }
}

struct KeyLock<'a> {
    file: &'a File,
}

impl<'a> KeyLock<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("failed to lock counter")
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl<'a> Drop for KeyLock<'a> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// The record itself is already synced; a failed directory sync only weakens
// crash durability of the rename, so it is logged rather than reported.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    let result = File::open(dir).and_then(|handle| handle.sync_all());
    if let Err(err) = result {
        tracing::warn!(path = %dir.display(), error = %err, "data directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

pub(crate) fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
