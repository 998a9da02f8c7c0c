use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

pub const HTTP_STATUS_CODE_ATTRIBUTE: &str = "http-status-code";
pub const HTTP_REASON_PHRASE_ATTRIBUTE: &str = "http-reason-phrase";
pub const REDIRECTION_TARGET_ATTRIBUTE: &str = "redirection-target";

pub type Attributes = BTreeMap<String, String>;

/// Everything the cache stores about a response besides its body.
///
/// Metadata is valid once it carries a URL. Timestamps are kept at whole
/// second precision, which is what the entry file can represent.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMetadata {
    url: Option<Url>,
    save_to_disk: bool,
    raw_headers: HeaderMap,
    last_modified: Option<SystemTime>,
    expiration_date: Option<SystemTime>,
    attributes: Attributes,
}

impl Default for CacheMetadata {
    fn default() -> Self {
        Self {
            url: None,
            save_to_disk: true,
            raw_headers: HeaderMap::new(),
            last_modified: None,
            expiration_date: None,
            attributes: Attributes::new(),
        }
    }
}

impl CacheMetadata {
    pub fn new(url: Url) -> Self {
        Self {
            url: Some(url),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.url.is_some()
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn set_url(&mut self, url: Option<Url>) {
        self.url = url;
    }

    pub fn save_to_disk(&self) -> bool {
        self.save_to_disk
    }

    pub fn set_save_to_disk(&mut self, save: bool) {
        self.save_to_disk = save;
    }

    pub fn raw_headers(&self) -> &HeaderMap {
        &self.raw_headers
    }

    pub fn raw_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.raw_headers
    }

    pub fn set_raw_headers(&mut self, headers: HeaderMap) {
        self.raw_headers = headers;
    }

    /// Replaces every value of `name` with `value`.
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<(), http::Error> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.raw_headers.insert(name, value);
        Ok(())
    }

    /// First value of `name` if it is valid visible ASCII. Lookup ignores case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.raw_headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Declared body length; unparsable values count as absent.
    pub fn content_length(&self) -> Option<u64> {
        self.raw_headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.raw_headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn set_last_modified(&mut self, time: Option<SystemTime>) {
        self.last_modified = time.map(truncate_to_secs);
    }

    pub fn expiration_date(&self) -> Option<SystemTime> {
        self.expiration_date
    }

    pub fn set_expiration_date(&mut self, time: Option<SystemTime>) {
        self.expiration_date = time.map(truncate_to_secs);
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn set_attributes(&mut self, attributes: Attributes) {
        self.attributes = attributes;
    }

    pub(crate) fn to_persisted(&self) -> Option<PersistedMetadata> {
        let url = self.url.as_ref()?;
        Some(PersistedMetadata {
            url: url.as_str().to_string(),
            save_to_disk: self.save_to_disk,
            headers: headermap_to_vec(&self.raw_headers),
            last_modified: self.last_modified.map(to_unix_secs),
            expiration_date: self.expiration_date.map(to_unix_secs),
            attributes: self.attributes.clone(),
        })
    }

    pub(crate) fn from_persisted(persisted: PersistedMetadata) -> Result<Self, url::ParseError> {
        let url = Url::parse(&persisted.url)?;
        Ok(Self {
            url: Some(url),
            save_to_disk: persisted.save_to_disk,
            raw_headers: to_headermap(&persisted.headers),
            last_modified: persisted.last_modified.map(from_unix_secs),
            expiration_date: persisted.expiration_date.map(from_unix_secs),
            attributes: persisted.attributes,
        })
    }
}

/// Serialized form of [`CacheMetadata`] inside an entry file.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedMetadata {
    pub url: String,
    pub save_to_disk: bool,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<u64>,
    #[serde(default)]
    pub attributes: Attributes,
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

fn to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn from_unix_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn truncate_to_secs(time: SystemTime) -> SystemTime {
    from_unix_secs(to_unix_secs(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn metadata_without_url_is_invalid() {
        let metadata = CacheMetadata::default();
        assert!(!metadata.is_valid());
        assert!(metadata.save_to_disk());
        assert!(metadata.to_persisted().is_none());
    }

    #[test]
    fn header_lookup_ignores_case() -> Result<()> {
        let mut metadata = CacheMetadata::new(Url::parse("http://example.com/")?);
        metadata.insert_header("Content-Type", "text/html; charset=utf-8")?;
        metadata.insert_header("CONTENT-LENGTH", " 42 ")?;
        assert_eq!(
            metadata.header("content-type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(metadata.content_type(), Some("text/html; charset=utf-8"));
        assert_eq!(metadata.content_length(), Some(42));
        Ok(())
    }

    #[test]
    fn persisted_round_trip_keeps_all_fields() -> Result<()> {
        let mut metadata = CacheMetadata::new(Url::parse("https://example.com/a?b=c")?);
        metadata.insert_header("content-type", "text/plain")?;
        metadata
            .raw_headers_mut()
            .append("set-cookie", HeaderValue::from_static("a=1"));
        metadata
            .raw_headers_mut()
            .append("set-cookie", HeaderValue::from_static("b=2"));
        metadata.set_save_to_disk(false);
        metadata.set_last_modified(Some(SystemTime::now()));
        metadata.set_expiration_date(Some(SystemTime::now() + Duration::from_secs(60)));
        metadata
            .attributes_mut()
            .insert(HTTP_STATUS_CODE_ATTRIBUTE.to_string(), "200".to_string());

        let persisted = metadata.to_persisted().expect("metadata has a url");
        let json = serde_json::to_vec(&persisted)?;
        let restored = CacheMetadata::from_persisted(serde_json::from_slice(&json)?)?;
        assert_eq!(restored, metadata);
        assert_eq!(restored.raw_headers().get_all("set-cookie").iter().count(), 2);
        Ok(())
    }

    #[test]
    fn timestamps_are_truncated_to_seconds() {
        let mut metadata = CacheMetadata::default();
        let time = SystemTime::UNIX_EPOCH + Duration::from_millis(1_500);
        metadata.set_last_modified(Some(time));
        assert_eq!(
            metadata.last_modified(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1))
        );
    }
}
