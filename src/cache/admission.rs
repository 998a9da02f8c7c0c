use std::time::{Duration, SystemTime};

use http::header::{CACHE_CONTROL, EXPIRES, LAST_MODIFIED, PRAGMA, WARNING};
use http::{HeaderMap, HeaderName, Method, StatusCode};
use url::Url;

use super::metadata::{HTTP_REASON_PHRASE_ATTRIBUTE, HTTP_STATUS_CODE_ATTRIBUTE};
use super::{Attributes, CacheMetadata};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers a revalidation response must not overwrite once stored.
const STICKY: &[&str] = &[
    "content-encoding",
    "content-range",
    "content-type",
    "content-length",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                let (name, arg) = match part.split_once('=') {
                    Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                    None => (part, None),
                };
                if name.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if name.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if name.eq_ignore_ascii_case("max-age")
                    && let Some(secs) = arg.and_then(|arg| arg.parse::<u64>().ok())
                {
                    cc.max_age = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    cc
}

/// Builds the metadata to store for a response.
///
/// `previous` is the metadata already cached for the URL, if any; on a
/// revalidation its body-describing headers and, for 304, its attributes
/// are kept.
pub fn metadata_from_response(
    method: &Method,
    url: &Url,
    status: StatusCode,
    headers: &HeaderMap,
    previous: Option<&CacheMetadata>,
) -> CacheMetadata {
    let mut metadata = previous
        .cloned()
        .unwrap_or_else(|| CacheMetadata::new(url.clone()));
    if !metadata.is_valid() {
        metadata.set_url(Some(url.clone()));
    }

    let merged = merge_headers(metadata.raw_headers(), headers);
    let cc = parse_cache_control(&merged);
    let expiration = match cc.max_age {
        Some(max_age) => SystemTime::now().checked_add(max_age),
        None => http_date(&merged, &EXPIRES),
    };
    let last_modified = http_date(&merged, &LAST_MODIFIED);
    let save = status != StatusCode::PARTIAL_CONTENT && is_saveable(method, &merged, &cc);

    metadata.set_raw_headers(merged);
    if expiration.is_some() {
        metadata.set_expiration_date(expiration);
    }
    if last_modified.is_some() {
        metadata.set_last_modified(last_modified);
    }
    metadata.set_save_to_disk(save);

    if status != StatusCode::NOT_MODIFIED {
        let mut attributes = Attributes::new();
        attributes.insert(
            HTTP_STATUS_CODE_ATTRIBUTE.to_string(),
            status.as_u16().to_string(),
        );
        attributes.insert(
            HTTP_REASON_PHRASE_ATTRIBUTE.to_string(),
            status.canonical_reason().unwrap_or_default().to_string(),
        );
        metadata.set_attributes(attributes);
    }
    metadata
}

fn merge_headers(stored: &HeaderMap, response: &HeaderMap) -> HeaderMap {
    let mut merged = stored.clone();
    for name in response.keys() {
        if is_hop_by_hop(name) || is_informational_warning(name, response) {
            continue;
        }
        if stored.contains_key(name) && STICKY.contains(&name.as_str()) {
            continue;
        }
        merged.remove(name);
        for value in response.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// `Warning: 1xx` only applies to the response that carried it.
fn is_informational_warning(name: &HeaderName, headers: &HeaderMap) -> bool {
    if name != WARNING {
        return false;
    }
    headers
        .get(WARNING)
        .map(|value| {
            let bytes = value.as_bytes();
            bytes.len() == 3 && bytes[0] == b'1' && bytes[1..].iter().all(u8::is_ascii_digit)
        })
        .unwrap_or(false)
}

fn is_saveable(method: &Method, headers: &HeaderMap, cc: &CacheControl) -> bool {
    if method == Method::GET {
        let pragma_no_cache = headers
            .get(PRAGMA)
            .is_some_and(|value| value.as_bytes() == b"no-cache");
        !(pragma_no_cache || cc.no_cache || cc.no_store)
    } else if method == Method::POST {
        cc.max_age.is_some()
    } else {
        false
    }
}

fn http_date(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value.trim()).ok())
}
