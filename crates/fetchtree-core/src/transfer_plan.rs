use eyre::{eyre, Result};

/// One byte range of one file; the unit of parallel transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub remote_path: String,
    /// 1-based, contiguous within a file.
    pub part_number: u32,
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Acknowledgment for one successfully delivered chunk.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FinishedPart {
    pub part_number: u32,
    pub entity_tag: String,
}

/// Split `size` bytes into contiguous `chunk_size` spans numbered from 1.
///
/// The last span is clamped to `size`; an empty file yields one empty chunk
/// `[0, 0)` so the sink still sees exactly one part. Fails when the part
/// count does not fit a `u32` part number.
pub fn plan_chunks(remote_path: &str, size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    let count = expected_parts(size, chunk_size)?;
    if size == 0 {
        return Ok(vec![Chunk {
            remote_path: remote_path.to_string(),
            part_number: 1,
            start: 0,
            end: 0,
        }]);
    }

    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for part_number in 1..=count {
        let end = start.saturating_add(chunk_size).min(size);
        chunks.push(Chunk {
            remote_path: remote_path.to_string(),
            part_number,
            start,
            end,
        });
        start = end;
    }
    Ok(chunks)
}

/// Number of chunks `plan_chunks` produces for `size`.
pub fn expected_parts(size: u64, chunk_size: u64) -> Result<u32> {
    if size == 0 {
        return Ok(1);
    }
    let chunk_size = chunk_size.max(1);
    let count = size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| {
        eyre!(
            "{size} bytes in {chunk_size}-byte chunks needs {count} parts, more than {} part numbers",
            u32::MAX
        )
    })
}

/// Sort parts by part number regardless of arrival order.
pub fn order_parts(mut parts: Vec<FinishedPart>) -> Vec<FinishedPart> {
    parts.sort_by_key(|p| p.part_number);
    parts
}

/// Part numbers in `1..=expected` that are absent from `parts`.
pub fn missing_parts(parts: &[FinishedPart], expected: u32) -> Vec<u32> {
    let mut present = vec![false; expected as usize + 1];
    for part in parts {
        if let Some(slot) = present.get_mut(part.part_number as usize) {
            *slot = true;
        }
    }
    (1..=expected).filter(|n| !present[*n as usize]).collect()
}
