mod support;

use std::io::Write;
use std::thread::sleep;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use netdiskcache::cache::{
    CACHE_MAGIC, DiskCache, HTTP_STATUS_CODE_ATTRIBUTE, metadata_from_response,
};

use support::*;

#[test]
fn entries_survive_reopening_the_cache() -> Result<()> {
    let dirs = TestDirs::new()?;
    let page = url("http://example.com/index.html");
    let body = b"<html><body>persisted</body></html>".repeat(20);

    {
        let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024 * 1024)?;
        let metadata = response_metadata(page.as_str(), "text/html", body.len())?;
        cache.store(&metadata, &body)?;
    }

    let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024 * 1024)?;
    let metadata = cache.metadata(&page).expect("entry after reopen");
    assert_eq!(metadata.url(), Some(&page));
    assert_eq!(metadata.content_type(), Some("text/html"));
    let data = cache.data(&page).expect("data after reopen");
    assert_eq!(data.as_slice(), &body[..]);

    let path = cache.entry_path(&page).expect("configured");
    let raw = std::fs::read(&path)?;
    assert_eq!(raw[..4], CACHE_MAGIC.to_le_bytes());
    assert_eq!(cache.cache_size(), raw.len() as u64);
    Ok(())
}

#[test]
fn reopening_removes_abandoned_staging_files() -> Result<()> {
    let dirs = TestDirs::new()?;
    let target = url("http://example.com/large.bin");

    {
        let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024 * 1024)?;
        let metadata = response_metadata(target.as_str(), "application/octet-stream", 4096)?;
        let id = cache.prepare(&metadata).expect("cacheable");
        cache.sink(id).expect("in flight").write_all(&[7u8; 1024])?;
        std::mem::forget(cache);
    }
    assert!(count_files(&dirs.prepared_dir()) >= 1);

    let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024 * 1024)?;
    assert_eq!(count_files(&dirs.prepared_dir()), 0);
    assert!(cache.metadata(&target).is_none());
    assert_eq!(cache.cache_size(), 0);
    Ok(())
}

#[test]
fn response_headers_drive_admission() -> Result<()> {
    let dirs = TestDirs::new()?;
    let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024 * 1024)?;
    let script = url("http://example.com/app.js");
    let body = b"console.log('cached');".repeat(8);

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/javascript"));
    headers.insert("content-length", HeaderValue::from(body.len()));
    headers.insert("cache-control", HeaderValue::from_static("max-age=60"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));

    let before = SystemTime::now();
    let metadata =
        metadata_from_response(&Method::GET, &script, StatusCode::OK, &headers, None);
    cache.store(&metadata, &body)?;

    let stored = cache.metadata(&script).expect("stored");
    assert!(stored.header("connection").is_none());
    assert_eq!(
        stored.attributes().get(HTTP_STATUS_CODE_ATTRIBUTE).map(String::as_str),
        Some("200")
    );
    let expires = stored.expiration_date().expect("max-age sets an expiry");
    assert!(expires >= before + Duration::from_secs(59));

    let mut no_store = HeaderMap::new();
    no_store.insert("content-type", HeaderValue::from_static("text/plain"));
    no_store.insert("cache-control", HeaderValue::from_static("no-store"));
    let private = url("http://example.com/private.txt");
    let metadata =
        metadata_from_response(&Method::GET, &private, StatusCode::OK, &no_store, None);
    assert!(cache.prepare(&metadata).is_none());
    assert!(cache.store(&metadata, b"secret").is_err());
    assert!(cache.metadata(&private).is_none());
    Ok(())
}

#[test]
fn eviction_accounts_for_entries_from_earlier_runs() -> Result<()> {
    let dirs = TestDirs::new()?;
    let body = vec![0x5a; 300];
    let targets: Vec<_> = (0..3)
        .map(|i| url(&format!("http://example.com/img{i}.png")))
        .collect();

    {
        let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024 * 1024)?;
        for target in &targets {
            let metadata = response_metadata(target.as_str(), "image/png", body.len())?;
            cache.store(&metadata, &body)?;
            sleep(Duration::from_millis(20));
        }
    }

    let mut cache = DiskCache::with_directory(&dirs.cache_dir, 1024)?;
    let size = cache.expire();
    assert!(size <= 1024 * 9 / 10, "size {size} above goal");
    assert!(cache.metadata(&targets[0]).is_none());
    assert!(cache.metadata(&targets[2]).is_some());
    assert_eq!(cache.cache_size(), size);
    Ok(())
}
