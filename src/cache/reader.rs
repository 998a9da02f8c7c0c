use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;

/// Read-only view of a cached payload.
///
/// Compressed entries are inflated into a shared buffer. Uncompressed entries
/// map the entry file and expose the bytes after the header without copying
/// them. Clones share the backing storage and start reading from the front.
#[derive(Debug)]
pub struct CacheData {
    source: DataSource,
    pos: usize,
}

#[derive(Debug, Clone)]
enum DataSource {
    Buffer(Bytes),
    Mapped { map: Arc<Mmap>, offset: usize },
}

impl CacheData {
    pub(super) fn from_bytes(bytes: Bytes) -> Self {
        Self {
            source: DataSource::Buffer(bytes),
            pos: 0,
        }
    }

    pub(super) fn mapped(map: Arc<Mmap>, offset: usize) -> Self {
        let offset = offset.min(map.len());
        Self {
            source: DataSource::Mapped { map, offset },
            pos: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.source {
            DataSource::Buffer(bytes) => &bytes[..],
            DataSource::Mapped { map, offset } => &map[*offset..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.source, DataSource::Mapped { .. })
    }

    fn remaining(&self) -> &[u8] {
        let slice = self.as_slice();
        &slice[self.pos.min(slice.len())..]
    }
}

impl Clone for CacheData {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            pos: 0,
        }
    }
}

impl AsRef<[u8]> for CacheData {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Read for CacheData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for CacheData {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => len + i128::from(delta),
            SeekFrom::Current(delta) => self.pos as i128 + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of cache data",
            ));
        }
        self.pos = usize::try_from(target).unwrap_or(usize::MAX);
        Ok(self.pos as u64)
    }
}
