pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod settings;

use std::fs;
use std::io::Write;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow, bail};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::info;
use url::Url;

use crate::cache::{CacheMetadata, DiskCache};
use crate::cli::Command;
use crate::settings::Settings;

/// Runs one maintenance command against the configured cache, writing its
/// result to `out`.
pub fn run(settings: &Settings, command: &Command, out: &mut dyn Write) -> Result<()> {
    let cache_dir = settings
        .cache_dir
        .as_ref()
        .ok_or_else(|| anyhow!("cache_dir is not configured"))?;
    let mut cache = DiskCache::with_directory(cache_dir, settings.maximum_cache_size)
        .with_context(|| format!("failed to open cache at {}", cache_dir.display()))?;

    match command {
        Command::Size => {
            writeln!(out, "{}", cache.cache_size())?;
        }
        Command::Expire => {
            let size = cache.expire();
            info!(size, "cache expired");
            writeln!(out, "{size}")?;
        }
        Command::Clear => {
            cache.clear();
            info!(path = %cache_dir.display(), "cache cleared");
        }
        Command::Path { url } => {
            let url = parse_url(url)?;
            let path = cache
                .entry_path(&url)
                .ok_or_else(|| anyhow!("cache directory is not set"))?;
            writeln!(out, "{}", path.display())?;
        }
        Command::Get { url, output } => {
            let url = parse_url(url)?;
            let Some(data) = cache.data(&url) else {
                bail!("no cached entry for {url}");
            };
            match output {
                Some(path) => fs::write(path, data.as_slice())
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => out.write_all(data.as_slice())?,
            }
        }
        Command::Put {
            url,
            file,
            content_type,
        } => {
            let url = parse_url(url)?;
            let body =
                fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
            let metadata = put_metadata(&url, body.len(), content_type.as_deref())?;
            cache
                .store(&metadata, &body)
                .with_context(|| format!("failed to cache {url}"))?;
            info!(url = %url, size = body.len(), "entry stored");
        }
        Command::Remove { url } => {
            let url = parse_url(url)?;
            let removed = cache.remove(&url);
            writeln!(out, "{}", if removed { "removed" } else { "not cached" })?;
        }
        Command::Inspect { file } => {
            let Some(metadata) = cache.file_metadata(file) else {
                bail!("{} is not a readable cache entry", file.display());
            };
            let summary = describe(&metadata);
            serde_json::to_writer_pretty(&mut *out, &summary)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn parse_url(value: &str) -> Result<Url> {
    Url::parse(value).with_context(|| format!("invalid url {value:?}"))
}

fn put_metadata(url: &Url, len: usize, content_type: Option<&str>) -> Result<CacheMetadata> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    if let Some(content_type) = content_type {
        let value = HeaderValue::from_str(content_type)
            .with_context(|| format!("invalid content type {content_type:?}"))?;
        headers.insert(CONTENT_TYPE, value);
    }
    Ok(cache::metadata_from_response(
        &Method::GET,
        url,
        StatusCode::OK,
        &headers,
        None,
    ))
}

fn describe(metadata: &CacheMetadata) -> serde_json::Value {
    let headers: Vec<(String, String)> = metadata
        .raw_headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    serde_json::json!({
        "url": metadata.url().map(Url::as_str),
        "save_to_disk": metadata.save_to_disk(),
        "headers": headers,
        "last_modified": metadata.last_modified().map(format_time),
        "expiration_date": metadata.expiration_date().map(format_time),
        "attributes": metadata.attributes(),
    })
}

fn format_time(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}
