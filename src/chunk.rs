// Chunk planning for multipart uploads. Pure arithmetic, no I/O.

use crate::error::ValidationError;

/// Part size fixed by the object store (4 MiB).
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum parts per upload accepted by the service.
pub const MAX_PARTS: u64 = 50;

/// Largest file that fits into `MAX_PARTS` parts.
pub const MAX_FILE_SIZE: u64 = CHUNK_SIZE * MAX_PARTS;

/// One contiguous byte range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based part number.
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

/// Ordered, gap-free cover of a file by parts `1..=N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    pub fn part_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk(&self, part_number: u32) -> Option<&Chunk> {
        part_number
            .checked_sub(1)
            .and_then(|idx| self.chunks.get(idx as usize))
    }
}

/// `max(1, ceil(size / CHUNK_SIZE))`; a zero-byte file still has one part.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE).max(1)
}

/// Plan the parts for a file of `size` bytes, rejecting files that need
/// more than `MAX_PARTS` parts.
pub fn plan_chunks(size: u64) -> Result<ChunkPlan, ValidationError> {
    let parts = chunk_count(size);
    if parts > MAX_PARTS {
        return Err(ValidationError::FileTooLarge {
            size,
            parts,
            max_parts: MAX_PARTS,
        });
    }

    let chunks = (0..parts)
        .map(|idx| {
            let offset = idx * CHUNK_SIZE;
            Chunk {
                part_number: idx as u32 + 1,
                offset,
                length: CHUNK_SIZE.min(size - offset.min(size)),
            }
        })
        .collect();

    Ok(ChunkPlan {
        file_size: size,
        chunks,
    })
}
