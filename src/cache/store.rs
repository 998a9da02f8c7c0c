use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use super::CacheKey;
use super::codec::CACHE_VERSION;
use super::key::CACHE_POSTFIX;

const PREPARED_DIR: &str = "prepared";
const DATA_DIR_PREFIX: &str = "data";
const TEMP_PREFIX: &str = "tmp_";

pub(super) fn data_dir(root: &Path) -> PathBuf {
    root.join(format!("{DATA_DIR_PREFIX}{CACHE_VERSION}"))
}

/// Committed entries are the only files the cache ever counts or deletes.
pub(super) fn is_entry_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(CACHE_POSTFIX))
}

/// Removes one committed entry file and returns its size. Paths that do not
/// name an entry file are left untouched, as are missing files.
pub(super) fn remove_entry_file(path: &Path) -> io::Result<Option<u64>> {
    if !is_entry_file(path) {
        return Ok(None);
    }
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    match fs::remove_file(path) {
        Ok(()) => Ok(Some(size)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone)]
pub(super) struct CacheStore {
    root: PathBuf,
    prepared_dir: PathBuf,
    data_dir: PathBuf,
}

impl CacheStore {
    /// Creates the directory layout under `root` and drops staging files
    /// left behind by an earlier run.
    pub(super) fn open(root: &Path) -> io::Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
            prepared_dir: root.join(PREPARED_DIR),
            data_dir: data_dir(root),
        };
        fs::create_dir_all(&store.prepared_dir)?;
        for nibble in 0..16u32 {
            if let Some(digit) = char::from_digit(nibble, 16) {
                fs::create_dir_all(store.data_dir.join(digit.to_string()))?;
            }
        }
        store.remove_temp_files()?;
        Ok(store)
    }

    pub(super) fn root(&self) -> &Path {
        &self.root
    }

    pub(super) fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.data_dir.join(key.relative_path())
    }

    pub(super) fn create_temp_file(&self) -> io::Result<NamedTempFile> {
        match self.temp_file_in_prepared() {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.prepared_dir)?;
                self.temp_file_in_prepared()
            }
            other => other,
        }
    }

    fn temp_file_in_prepared(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.prepared_dir)
    }

    pub(super) fn remove_temp_files(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.prepared_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp && entry.file_type()?.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(error = %err, path = %path.display(), "failed to remove stale temp file");
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Renames a finished temp file into the entry slot for `key`.
    pub(super) fn commit(&self, file: NamedTempFile, key: &CacheKey) -> io::Result<(PathBuf, u64)> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let size = file.as_file().metadata()?.len();
        file.persist(&path).map_err(|err| err.error)?;
        Ok((path, size))
    }
}
