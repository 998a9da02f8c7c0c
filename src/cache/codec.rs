//! Entry file format.
//!
//! All integers are little-endian:
//!
//! ```text
//! u32 magic | u32 version | u32 meta_len | meta JSON | u8 compressed
//!   | [u32 zlen | zlib payload]      (compressed)
//!   | [payload bytes up to EOF]      (uncompressed)
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use memmap2::Mmap;
use thiserror::Error;

use super::metadata::{CacheMetadata, PersistedMetadata};
use super::{CacheData, CacheKey};

pub const CACHE_MAGIC: u32 = 0xe8;
/// Bumping this also renames the data directory (`data<version>`).
pub const CACHE_VERSION: u32 = 1;
/// Declared bodies above this size are stored uncompressed.
pub const MAX_COMPRESSION_SIZE: u64 = 3 * 1024 * 1024;

const MAX_METADATA_LEN: u32 = 16 * 1024 * 1024;
const MAX_INFLATED_LEN: u64 = 256 * 1024 * 1024;
const FIXED_HEADER_LEN: u64 = 4 + 4 + 4 + 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("not a cache file (magic {found:#x})")]
    NotCacheFile { found: u32 },
    #[error("cache file format version {found} does not match {CACHE_VERSION}")]
    StaleVersion { found: u32 },
    #[error("corrupt cache file: {0}")]
    Corrupt(String),
    #[error("cache metadata has no url")]
    MissingUrl,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the offending file should be deleted. Files that are not
    /// cache files at all are left alone.
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::StaleVersion { .. } | Self::Corrupt(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }

    fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt(detail.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Stop after the compression flag.
    MetadataOnly,
    /// Also expose the payload.
    WithData,
}

#[derive(Debug)]
pub(super) struct Header {
    pub metadata: CacheMetadata,
    pub compressed: bool,
    pub len: u64,
}

#[derive(Debug)]
pub(super) struct DecodedEntry {
    pub key: CacheKey,
    pub metadata: CacheMetadata,
    pub compressed: bool,
    pub data: Option<CacheData>,
}

/// Textual bodies of known, moderate size are compressed; everything else is
/// stored as-is. Both `content-length` and `content-type` must be present.
pub fn can_compress(metadata: &CacheMetadata) -> bool {
    let size_ok = metadata
        .content_length()
        .is_some_and(|len| len <= MAX_COMPRESSION_SIZE);
    let type_ok = metadata.content_type().is_some_and(is_textual_type);
    size_ok && type_ok
}

fn is_textual_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type.starts_with("text/")
        || (media_type.starts_with("application/")
            && (media_type.ends_with("javascript") || media_type.ends_with("ecmascript")))
}

pub(super) fn encode_header(
    metadata: &CacheMetadata,
    compressed: bool,
) -> Result<Vec<u8>, CodecError> {
    let persisted = metadata.to_persisted().ok_or(CodecError::MissingUrl)?;
    let meta = serde_json::to_vec(&persisted).map_err(io::Error::other)?;
    let meta_len = u32::try_from(meta.len())
        .ok()
        .filter(|len| *len <= MAX_METADATA_LEN)
        .ok_or_else(|| CodecError::corrupt("metadata too large"))?;

    let mut out = Vec::with_capacity(FIXED_HEADER_LEN as usize + meta.len());
    out.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
    out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
    out.extend_from_slice(&meta_len.to_le_bytes());
    out.extend_from_slice(&meta);
    out.push(u8::from(compressed));
    Ok(out)
}

/// Appends `u32 zlen | zlib(payload)` to `out`.
pub(super) fn append_compressed(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;
    let len = u32::try_from(compressed.len())
        .map_err(|_| CodecError::corrupt("compressed payload exceeds 4 GiB"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(())
}

pub(super) fn decode_header<R: Read>(reader: &mut R) -> Result<Header, CodecError> {
    let magic = read_u32(reader)?;
    if magic != CACHE_MAGIC {
        return Err(CodecError::NotCacheFile { found: magic });
    }
    let version = read_u32(reader)?;
    if version != CACHE_VERSION {
        return Err(CodecError::StaleVersion { found: version });
    }
    let meta_len = read_u32(reader)?;
    if meta_len > MAX_METADATA_LEN {
        return Err(CodecError::corrupt(format!(
            "metadata length {meta_len} out of range"
        )));
    }
    let mut meta = vec![0u8; meta_len as usize];
    read_exact(reader, &mut meta)?;
    let persisted: PersistedMetadata = serde_json::from_slice(&meta)
        .map_err(|err| CodecError::corrupt(format!("invalid metadata: {err}")))?;
    let metadata = CacheMetadata::from_persisted(persisted)
        .map_err(|err| CodecError::corrupt(format!("invalid url: {err}")))?;

    let mut flag = [0u8; 1];
    read_exact(reader, &mut flag)?;
    let compressed = match flag[0] {
        0 => false,
        1 => true,
        other => {
            return Err(CodecError::corrupt(format!(
                "invalid compression flag {other}"
            )));
        }
    };

    Ok(Header {
        metadata,
        compressed,
        len: FIXED_HEADER_LEN + u64::from(meta_len),
    })
}

/// Decodes the compressed block that follows a header.
pub(super) fn inflate_block(block: &[u8]) -> Result<Bytes, CodecError> {
    let mut cursor = block;
    let len = read_u32(&mut cursor)? as usize;
    if cursor.len() < len {
        return Err(CodecError::corrupt("truncated compressed payload"));
    }
    let mut decoder = ZlibDecoder::new(&cursor[..len]).take(MAX_INFLATED_LEN + 1);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|err| CodecError::corrupt(format!("inflate failed: {err}")))?;
    if inflated.len() as u64 > MAX_INFLATED_LEN {
        return Err(CodecError::corrupt("inflated payload too large"));
    }
    Ok(Bytes::from(inflated))
}

/// Reads the entry at `path` and checks that its name matches the URL stored
/// inside it.
pub(super) fn read_entry(path: &Path, mode: ReadMode) -> Result<DecodedEntry, CodecError> {
    let file = File::open(path)?;
    match mode {
        ReadMode::MetadataOnly => {
            let header = decode_header(&mut BufReader::new(file))?;
            let key = verify_path(path, &header.metadata)?;
            Ok(DecodedEntry {
                key,
                metadata: header.metadata,
                compressed: header.compressed,
                data: None,
            })
        }
        ReadMode::WithData => {
            let backing = map_file(&file)?;
            let bytes = backing.as_slice();
            let header = decode_header(&mut &bytes[..])?;
            let key = verify_path(path, &header.metadata)?;
            let offset = usize::try_from(header.len)
                .map_err(|_| CodecError::corrupt("header length out of range"))?;
            let body = bytes
                .get(offset..)
                .ok_or_else(|| CodecError::corrupt("truncated header"))?;
            let data = if header.compressed {
                CacheData::from_bytes(inflate_block(body)?)
            } else {
                backing.into_data(offset)
            };
            Ok(DecodedEntry {
                key,
                metadata: header.metadata,
                compressed: header.compressed,
                data: Some(data),
            })
        }
    }
}

fn verify_path(path: &Path, metadata: &CacheMetadata) -> Result<CacheKey, CodecError> {
    let url = metadata.url().ok_or(CodecError::MissingUrl)?;
    let key = CacheKey::new(url);
    if !path.ends_with(key.relative_path()) {
        return Err(CodecError::corrupt(format!(
            "file name does not match url {url}"
        )));
    }
    Ok(key)
}

enum Backing {
    Mapped(Arc<Mmap>),
    Read(Bytes),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => &map[..],
            Backing::Read(bytes) => &bytes[..],
        }
    }

    fn into_data(self, offset: usize) -> CacheData {
        match self {
            Backing::Mapped(map) => CacheData::mapped(map, offset),
            Backing::Read(bytes) => CacheData::from_bytes(bytes.slice(offset..)),
        }
    }
}

fn map_file(file: &File) -> Result<Backing, CodecError> {
    // SAFETY: entry files are only ever replaced by rename or unlinked, never
    // truncated or rewritten in place, so the mapped pages stay valid.
    match unsafe { Mmap::map(file) } {
        Ok(map) => Ok(Backing::Mapped(Arc::new(map))),
        Err(_) => {
            let mut buf = Vec::new();
            (&*file).read_to_end(&mut buf)?;
            Ok(Backing::Read(Bytes::from(buf)))
        }
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, CodecError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::corrupt("truncated header")
        } else {
            CodecError::Io(err)
        }
    })
}

/// Decoding entry points for fuzzing and tests that work on raw bytes.
pub mod fuzzing {
    use super::*;

    /// Decodes a whole entry image: header, then either the compressed block
    /// or the raw tail.
    pub fn decode_entry(bytes: &[u8]) -> Result<(CacheMetadata, Vec<u8>), CodecError> {
        let mut cursor = bytes;
        let header = decode_header(&mut cursor)?;
        let payload = if header.compressed {
            inflate_block(cursor)?.to_vec()
        } else {
            cursor.to_vec()
        };
        Ok((header.metadata, payload))
    }
}
