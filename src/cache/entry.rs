use std::fmt;
use std::io::{self, BufWriter, Write};

use tempfile::NamedTempFile;

use super::codec;
use super::store::CacheStore;
use super::{CacheError, CacheKey, CacheMetadata};

/// Opaque handle for an entry between `prepare` and `insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    pub(super) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

pub(super) enum Payload {
    /// Body is compressed when the item is committed.
    InMemory(Vec<u8>),
    /// Header already written; body bytes stream straight to the file.
    Staged(StagedFile),
}

pub(super) struct StagedFile {
    writer: BufWriter<NamedTempFile>,
    payload_len: u64,
}

impl StagedFile {
    fn finish(self) -> io::Result<NamedTempFile> {
        self.writer.into_inner().map_err(|err| err.into_error())
    }
}

/// An entry being written. Bytes go in through [`Write`]; nothing becomes
/// visible to readers until the owning cache inserts it. Dropping a staged
/// item deletes its temp file.
pub struct CacheItem {
    key: CacheKey,
    metadata: CacheMetadata,
    payload: Payload,
}

/// A fully written temp file ready to be renamed into place.
pub(super) struct FinishedItem {
    pub key: CacheKey,
    pub file: NamedTempFile,
    pub compressed: bool,
}

impl CacheItem {
    pub(super) fn in_memory(key: CacheKey, metadata: CacheMetadata) -> Self {
        Self {
            key,
            metadata,
            payload: Payload::InMemory(Vec::new()),
        }
    }

    pub(super) fn staged(
        key: CacheKey,
        metadata: CacheMetadata,
        file: NamedTempFile,
    ) -> Result<Self, CacheError> {
        let header = codec::encode_header(&metadata, false)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header)?;
        Ok(Self {
            key,
            metadata,
            payload: Payload::Staged(StagedFile {
                writer,
                payload_len: 0,
            }),
        })
    }

    pub fn metadata(&self) -> &CacheMetadata {
        &self.metadata
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Body bytes written so far.
    pub fn size(&self) -> u64 {
        match &self.payload {
            Payload::InMemory(buf) => buf.len() as u64,
            Payload::Staged(staged) => staged.payload_len,
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self.payload, Payload::Staged(_))
    }

    pub(super) fn temp_path(&self) -> Option<&std::path::Path> {
        match &self.payload {
            Payload::InMemory(_) => None,
            Payload::Staged(staged) => Some(staged.writer.get_ref().path()),
        }
    }

    /// Produces the complete entry file. In-memory bodies are written to a
    /// fresh temp file here, compressed when the metadata allows it.
    pub(super) fn finish(self, store: &CacheStore) -> Result<FinishedItem, CacheError> {
        let Self {
            key,
            metadata,
            payload,
        } = self;
        let (file, compressed) = match payload {
            Payload::InMemory(buf) => {
                let compressed = codec::can_compress(&metadata);
                let mut image = codec::encode_header(&metadata, compressed)?;
                if compressed {
                    codec::append_compressed(&mut image, &buf)?;
                } else {
                    image.extend_from_slice(&buf);
                }
                let mut file = store.create_temp_file()?;
                file.write_all(&image)?;
                file.flush()?;
                (file, compressed)
            }
            Payload::Staged(staged) => (staged.finish()?, false),
        };
        Ok(FinishedItem {
            key,
            file,
            compressed,
        })
    }
}

impl fmt::Debug for CacheItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItem")
            .field("key", &self.key)
            .field("staged", &self.is_staged())
            .field("size", &self.size())
            .finish()
    }
}

impl Write for CacheItem {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.payload {
            Payload::InMemory(data) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            Payload::Staged(staged) => {
                let written = staged.writer.write(buf)?;
                staged.payload_len += written as u64;
                Ok(written)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.payload {
            Payload::InMemory(_) => Ok(()),
            Payload::Staged(staged) => staged.writer.flush(),
        }
    }
}
