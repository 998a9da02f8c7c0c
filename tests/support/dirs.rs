use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let workspace = temp.path();
        let cache_dir = workspace.join("http_cache");
        let output_dir = workspace.join("out");
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            _temp: temp,
            cache_dir,
            output_dir,
        })
    }

    pub fn write_output_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.output_dir.join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn prepared_dir(&self) -> PathBuf {
        self.cache_dir.join("prepared")
    }
}

pub fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}
