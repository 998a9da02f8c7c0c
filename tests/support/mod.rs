#![allow(dead_code)]

mod dirs;

pub use dirs::*;

use anyhow::{Context, Result};
use url::Url;

use netdiskcache::{
    cache::CacheMetadata,
    cli::{Command, LogFormat},
    run,
    settings::Settings,
};

pub fn url(value: &str) -> Url {
    Url::parse(value).expect("valid test url")
}

pub fn response_metadata(target: &str, content_type: &str, len: usize) -> Result<CacheMetadata> {
    let mut metadata = CacheMetadata::new(url(target));
    metadata.insert_header("content-type", content_type)?;
    metadata.insert_header("content-length", &len.to_string())?;
    Ok(metadata)
}

pub fn default_test_settings(dirs: &TestDirs) -> Settings {
    Settings {
        cache_dir: Some(dirs.cache_dir.clone()),
        maximum_cache_size: 1024 * 1024,
        log: LogFormat::Text,
    }
}

/// Runs a command and returns what it wrote to stdout.
pub fn run_command(settings: &Settings, command: Command) -> Result<String> {
    let mut out = Vec::new();
    run(settings, &command, &mut out)?;
    String::from_utf8(out).context("command output is not UTF-8")
}
