//! Cyclic byte source feeding every connection.

use std::io;
use std::path::Path;
use std::sync::Arc;
use crate::error::TarpitError;
use crate::options::ResponseSource;

/// Immutable, non-empty byte sequence read with wraparound.
/// Shared by all connections; each reader keeps its own cursor.
#[derive(Debug, Clone)]
pub struct ByteSource {
    data: Arc<[u8]>,
}

impl ByteSource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Result<Self, TarpitError> {
        let data = data.into();
        if data.is_empty() {
            return Err(TarpitError::EmptySource);
        }
        Ok(Self { data })
    }

    /// Build the source a service was configured with.
    pub fn load(response: &ResponseSource, fs: &dyn FileSystem) -> Result<Self, TarpitError> {
        match response {
            ResponseSource::Payload(bytes) => Self::new(bytes.as_slice()),
            ResponseSource::File(path) => {
                let bytes = fs.read(path).map_err(|source| TarpitError::ResponseFile {
                    path: path.clone(),
                    source,
                })?;
                Self::new(bytes)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Fill `buf` starting at `cursor`, wrapping to the start as often as
    /// needed. Returns the cursor just past the last byte written (0 when
    /// that lands on the end of the data).
    pub fn read(&self, buf: &mut [u8], cursor: usize) -> usize {
        let len = self.data.len();
        let mut pos = cursor % len;
        let mut written = 0;

        while written < buf.len() {
            let n = (len - pos).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&self.data[pos..pos + n]);
            written += n;
            pos += n;
            if pos == len {
                pos = 0;
            }
        }

        pos
    }
}

/// Sequential reader over a [`ByteSource`] that remembers its cursor.
/// Not meant to be shared; give each consumer its own.
#[derive(Debug, Clone)]
pub struct CyclicReader {
    source: Arc<ByteSource>,
    cursor: usize,
}

impl CyclicReader {
    pub fn new(source: Arc<ByteSource>) -> Self {
        Self { source, cursor: 0 }
    }

    pub fn read(&mut self, buf: &mut [u8]) {
        self.cursor = self.source.read(buf, self.cursor);
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Read access to response payload files.
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}
