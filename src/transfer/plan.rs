//! Chunk planning
//!
//! Chunks start small so the first bytes arrive quickly, then grow
//! geometrically up to a ceiling. Every size is a multiple of the MAC block
//! size, which keeps chunk boundaries on block boundaries.

use std::ops::Range;

use crate::config::ChunkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlannedChunk {
    pub offset: u64,
    pub size: u64,
}

impl PlannedChunk {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

/// Plan a download. An empty file has no chunks.
pub fn plan_chunks(size: u64, config: &ChunkConfig) -> Vec<PlannedChunk> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut next = config.initial_size.max(1);

    while offset < size {
        let len = next.min(size - offset);
        chunks.push(PlannedChunk { offset, size: len });
        offset += len;
        next = next
            .saturating_mul(config.growth_factor.max(1))
            .min(config.max_size.max(config.initial_size));
    }
    chunks
}

/// Plan an upload. An empty file still posts one empty chunk so the
/// backend issues a completion token.
pub fn plan_upload(size: u64, config: &ChunkConfig) -> Vec<PlannedChunk> {
    if size == 0 {
        return vec![PlannedChunk { offset: 0, size: 0 }];
    }
    plan_chunks(size, config)
}

/// Largest chunk boundary at or below `offset`.
pub fn resume_point(plan: &[PlannedChunk], offset: u64) -> u64 {
    plan.iter()
        .map(|c| c.offset)
        .chain(plan.last().map(|c| c.end()))
        .filter(|&boundary| boundary <= offset)
        .max()
        .unwrap_or(0)
}

/// Drop chunks that end at or before `offset`.
pub fn skip_completed(plan: Vec<PlannedChunk>, offset: u64) -> Vec<PlannedChunk> {
    plan.into_iter().filter(|c| c.end() > offset).collect()
}
