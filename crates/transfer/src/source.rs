use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::TransferError;
use crate::chunker::ChunkSlice;

/// Read-only random access to the bytes of a file being uploaded.
///
/// Implementations must be safe to read from several threads at once: the
/// hasher and concurrent upload tasks read different ranges in parallel.
pub trait ChunkSource: Send + Sync {
    /// File name reported to the server.
    fn name(&self) -> &str;

    /// Total size in bytes.
    fn len(&self) -> u64;

    /// Reads `len` bytes starting at `offset`.
    fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransferError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the bytes covered by `slice`.
    fn read_slice(&self, slice: &ChunkSlice) -> Result<Bytes, TransferError> {
        self.read_range(slice.offset, slice.size as usize)
    }
}

fn check_range(offset: u64, len: usize, source_len: u64) -> Result<(), TransferError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= source_len => Ok(()),
        _ => Err(TransferError::OutOfRange {
            offset,
            len,
            source_len,
        }),
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A file on disk, read range by range on demand.
///
/// Each read opens its own handle, so concurrent readers never share a
/// cursor and the whole file is never held in memory.
pub struct FileSource {
    path: PathBuf,
    name: String,
    len: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        Ok(Self {
            path: path.to_path_buf(),
            name,
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransferError> {
        check_range(offset, len, self.len)?;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// An in-memory buffer. Reads are zero-copy slices.
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl ChunkSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransferError> {
        check_range(offset, len, self.len())?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }
}

// ---------------------------------------------------------------------------
// UploadFile
// ---------------------------------------------------------------------------

/// Shared handle to the file being uploaded.
///
/// Cheap to clone; every chunk, the hasher and each upload task hold one.
#[derive(Clone)]
pub struct UploadFile {
    source: Arc<dyn ChunkSource>,
}

impl UploadFile {
    pub fn new(source: Arc<dyn ChunkSource>) -> Self {
        Self { source }
    }

    /// Opens a file on disk.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        Ok(Self::new(Arc::new(FileSource::open(path)?)))
    }

    /// Wraps an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(Arc::new(MemorySource::new(name, data)))
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn len(&self) -> u64 {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn read_slice(&self, slice: &ChunkSlice) -> Result<Bytes, TransferError> {
        self.source.read_slice(slice)
    }

    /// Reads a slice on the blocking thread pool.
    pub async fn read_slice_async(&self, slice: ChunkSlice) -> Result<Bytes, TransferError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.read_slice(&slice))
            .await
            .map_err(|e| TransferError::WorkerStopped(format!("read task join error: {e}")))?
    }

    pub(crate) fn source(&self) -> Arc<dyn ChunkSource> {
        Arc::clone(&self.source)
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name())
            .field("len", &self.len())
            .finish()
    }
}
