use crate::TransferError;

/// Byte range of one chunk within the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSlice {
    /// Position of the chunk in the file; the chunk's durable identity.
    pub index: usize,
    /// Byte offset within the file.
    pub offset: u64,
    /// Size of this chunk in bytes.
    pub size: u64,
}

impl ChunkSlice {
    /// Offset one past the last byte of the slice.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Splits a file of `file_len` bytes into `ceil(file_len / chunk_size)` slices.
///
/// Slices are contiguous and in index order; only the last may be shorter
/// than `chunk_size`. An empty file yields no slices.
pub fn create_chunks(file_len: u64, chunk_size: u64) -> Result<Vec<ChunkSlice>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }

    let count = file_len.div_ceil(chunk_size) as usize;
    let mut slices = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < file_len {
        let size = chunk_size.min(file_len - offset);
        slices.push(ChunkSlice {
            index: slices.len(),
            offset,
            size,
        });
        offset += size;
    }
    Ok(slices)
}
