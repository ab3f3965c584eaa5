//! Random-access byte sources backing a [`MediaRef`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use recast_common::error::{RecastError, RecastResult};
use recast_project_model::MediaRef;

/// Positional reads over a media container.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> RecastResult<Bytes>;
}

/// Open the bytes behind a media reference.
pub fn open_media(media: &MediaRef) -> RecastResult<Arc<dyn ByteSource>> {
    match media {
        MediaRef::File { path } => {
            if !path.exists() {
                return Err(RecastError::FileNotFound { path: path.clone() });
            }
            Ok(Arc::new(FileSource::open(path)?))
        }
        MediaRef::Memory { data, .. } => Ok(Arc::new(MemorySource::new(data.clone()))),
    }
}

/// In-memory container.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> RecastResult<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|_| RecastError::demux(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                RecastError::demux(format!(
                    "read of {len} bytes at {offset} past end of {} byte source",
                    self.data.len()
                ))
            })?;
        Ok(self.data.slice(start..end))
    }
}

/// Container file on disk.
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: &std::path::Path) -> RecastResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, len: usize) -> RecastResult<Bytes> {
        if offset.saturating_add(len as u64) > self.len {
            return Err(RecastError::demux(format!(
                "read of {len} bytes at {offset} past end of {} byte file",
                self.len
            )));
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| RecastError::demux("file handle poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}
