//! Purpose: Shared data-directory and per-key file path resolution helpers.
//! Exports: `default_data_dir`, `RecordPaths`.
//! Role: Keep CLI, server, and backend path semantics aligned from one source.
//! Invariants: Default data directory remains `~/.tally/counters`.
//! Invariants: File names derive only from the key hash, never from raw key text.

use std::path::{Path, PathBuf};

use crate::core::key::CounterKey;
use crate::core::record::file_stem;

pub(crate) fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".tally").join("counters")
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RecordPaths {
    pub record: PathBuf,
    pub lock: PathBuf,
    pub staging: PathBuf,
}

impl RecordPaths {
    pub(crate) fn resolve(dir: &Path, key: &CounterKey) -> Self {
        let stem = file_stem(key);
        Self {
            record: dir.join(format!("{stem}.tally")),
            lock: dir.join(format!("{stem}.lock")),
            staging: dir.join(format!("{stem}.tmp")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordPaths, default_data_dir};
    use crate::core::key::normalize;
    use std::path::PathBuf;

    #[test]
    fn paths_share_one_stem() {
        let dir = PathBuf::from(".scratch/counters");
        let paths = RecordPaths::resolve(&dir, &normalize("a:b"));
        let stem = paths.record.file_stem().expect("stem").to_owned();
        assert_eq!(paths.lock.file_stem().expect("stem"), stem);
        assert_eq!(paths.staging.file_stem().expect("stem"), stem);
        assert!(paths.record.starts_with(&dir));
        assert!(!paths.record.to_string_lossy().contains(':'));
    }

    #[test]
    fn default_dir_is_under_dot_tally() {
        assert!(default_data_dir().to_string_lossy().contains(".tally"));
    }
}
