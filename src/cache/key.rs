use std::path::PathBuf;

use url::Url;

/// Suffix carried by every committed cache entry file.
pub const CACHE_POSTFIX: &str = ".d";

const ENTRY_ID_LEN: usize = 8;
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identity of one cache entry: the normalized URL that was hashed and the
/// short base-36 id derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key_base: String,
    entry_id: String,
}

impl CacheKey {
    pub fn new(url: &Url) -> Self {
        Self::from_key_base(normalized_key(url))
    }

    pub(super) fn from_key_base(key_base: String) -> Self {
        let entry_id = Self::entry_id_for_key(&key_base);
        Self { key_base, entry_id }
    }

    pub fn key_base(&self) -> &str {
        &self.key_base
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// `<nibble>/<entry id>.d`, relative to the data directory.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(fan_out_dir(&self.entry_id).to_string())
            .join(format!("{}{CACHE_POSTFIX}", self.entry_id))
    }

    pub(super) fn entry_id_for_key(key_base: &str) -> String {
        let hash = blake3::hash(key_base.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        let mut id = to_base36(u64::from_le_bytes(prefix));
        id.truncate(ENTRY_ID_LEN);
        id
    }
}

/// Relative entry path for `url`. Credentials and fragment do not take part,
/// so `http://u:p@host/x#a` and `http://host/x#b` share one entry.
pub fn unique_file_name(url: &Url) -> PathBuf {
    CacheKey::new(url).relative_path()
}

fn normalized_key(url: &Url) -> String {
    let mut clean = url.clone();
    // Both setters refuse URLs that cannot carry credentials, which is fine.
    let _ = clean.set_password(None);
    let _ = clean.set_username("");
    clean.set_fragment(None);
    clean.into()
}

fn fan_out_dir(entry_id: &str) -> char {
    let last = entry_id.as_bytes().last().copied().unwrap_or(b'0');
    char::from_digit(u32::from(last % 16), 16).unwrap_or('0')
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(13);
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.iter().rev().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).expect("parse test url")
    }

    #[test]
    fn base36_matches_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u64::MAX), "3w5e11264sgsf");
    }

    #[test]
    fn credentials_and_fragment_are_ignored() {
        let with_creds = CacheKey::new(&url("http://u:p@host/x#frag1"));
        let plain = CacheKey::new(&url("http://host/x#frag2"));
        assert_eq!(with_creds, plain);
        assert_eq!(plain.key_base(), "http://host/x");
        assert_eq!(
            unique_file_name(&url("http://u:p@host/x#frag1")),
            unique_file_name(&url("http://host/x"))
        );
    }

    #[test]
    fn query_still_distinguishes_entries() {
        let a = CacheKey::new(&url("http://host/x?a=1"));
        let b = CacheKey::new(&url("http://host/x?a=2"));
        assert_ne!(a.entry_id(), b.entry_id());
    }

    #[test]
    fn relative_path_has_fan_out_layout() {
        let key = CacheKey::new(&url("http://example.com/a.txt"));
        let id = key.entry_id();
        assert!(!id.is_empty() && id.len() <= ENTRY_ID_LEN);
        assert!(id.bytes().all(|b| BASE36_DIGITS.contains(&b)));

        let path = key.relative_path();
        let components: Vec<_> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert_eq!(components.len(), 2);
        let expected_nibble = format!("{:x}", id.as_bytes()[id.len() - 1] % 16);
        assert_eq!(components[0], expected_nibble);
        assert_eq!(components[1], format!("{id}.d"));
    }

    #[test]
    fn naming_is_deterministic() {
        let first = unique_file_name(&url("https://example.com/style.css"));
        let second = unique_file_name(&url("https://example.com/style.css"));
        assert_eq!(first, second);
        assert_eq!(
            CacheKey::from_key_base("https://example.com/style.css".to_string()),
            CacheKey::new(&url("https://example.com/style.css"))
        );
    }
}
