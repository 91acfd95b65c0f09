//! Cumulus Core RAID: pure-logic CloudRAID layout
//!
//! # Overview
//!
//! A CloudRAID file is striped over six storage servers. The file is cut
//! into 80-byte *raid lines*, each made of five 16-byte *sectors*:
//!
//! ```text
//!            line 0                    line 1
//! file:   | s0 | s1 | s2 | s3 | s4 | s0 | s1 | s2 | s3 | s4 | ...
//!
//! part 0: | s0^s1^s2^s3^s4 | s0^s1^s2^s3^s4 | ...   (parity)
//! part 1: | s0             | s0             | ...
//! part 2: | s1             | s1             | ...
//! ...
//! part 5: | s4             | s4             | ...
//! ```
//!
//! Any five of the six parts rebuild every line: a missing data sector is
//! the XOR of the parity sector and the four remaining data sectors. The
//! last line may be short; missing bytes are treated as zeros on every part,
//! so part sizes differ by at most one sector.
//!
//! This crate computes part sizes and byte ranges ([`RaidGeometry`]),
//! reassembles fetched part bytes into file bytes ([`LineAssembler`]) and
//! encodes test fixtures ([`encode_parts`]). It performs no I/O.

pub mod assembler;

pub use assembler::LineAssembler;

use std::ops::Range;
use thiserror::Error;

/// Number of parts a CloudRAID file is striped over
pub const RAID_PARTS: usize = 6;

/// Number of data parts (part 0 carries parity)
pub const RAID_DATA_PARTS: usize = 5;

/// Bytes per sector
pub const RAID_SECTOR: u64 = 16;

/// Bytes per raid line (five data sectors)
pub const RAID_LINE: u64 = RAID_SECTOR * RAID_DATA_PARTS as u64;

/// Index of the parity part
pub const PARITY_PART: usize = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaidError {
    #[error("part index {0} out of range")]
    InvalidPart(usize),

    #[error("range {start}..{end} outside file of {size} bytes")]
    RangeOutOfBounds { start: u64, end: u64, size: u64 },

    #[error("part {part} delivered {extra} bytes past its expected range")]
    UnexpectedData { part: usize, extra: u64 },

    #[error("part {0} is not being fetched")]
    PartNotActive(usize),

    #[error("more than one part is unavailable")]
    TooManyMissing,
}

/// Byte layout of one CloudRAID file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidGeometry {
    file_size: u64,
}

/// A file byte range widened to whole raid lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpan {
    /// Requested file range
    pub bytes: Range<u64>,
    /// Covering raid lines (absolute line indices)
    pub lines: Range<u64>,
}

impl LineSpan {
    /// Number of raid lines covered
    pub fn line_count(&self) -> u64 {
        self.lines.end - self.lines.start
    }

    /// Bytes to drop from the front of the reassembled lines
    pub fn head_trim(&self) -> u64 {
        self.bytes.start - self.lines.start * RAID_LINE
    }
}

impl RaidGeometry {
    pub fn new(file_size: u64) -> Self {
        Self { file_size }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Total number of raid lines, counting a trailing short line
    pub fn line_count(&self) -> u64 {
        self.file_size.div_ceil(RAID_LINE)
    }

    /// Size in bytes of the stream stored on `part`
    pub fn part_size(&self, part: usize) -> Result<u64, RaidError> {
        if part >= RAID_PARTS {
            return Err(RaidError::InvalidPart(part));
        }

        let full_lines = self.file_size / RAID_LINE;
        let remainder = self.file_size % RAID_LINE;

        // Parity is as long as the longest data part
        let sector_start = if part == PARITY_PART {
            0
        } else {
            (part as u64 - 1) * RAID_SECTOR
        };
        let tail = remainder.saturating_sub(sector_start).min(RAID_SECTOR);

        Ok(full_lines * RAID_SECTOR + tail)
    }

    /// Widen a file byte range to the raid lines that contain it
    pub fn span(&self, bytes: Range<u64>) -> Result<LineSpan, RaidError> {
        if bytes.start > bytes.end || bytes.end > self.file_size {
            return Err(RaidError::RangeOutOfBounds {
                start: bytes.start,
                end: bytes.end,
                size: self.file_size,
            });
        }

        let first = bytes.start / RAID_LINE;
        let end = if bytes.is_empty() {
            first
        } else {
            bytes.end.div_ceil(RAID_LINE)
        };
        Ok(LineSpan {
            bytes,
            lines: first..end,
        })
    }

    /// Part-relative byte range holding `lines` on `part`.
    ///
    /// The range is clipped to the part size and may be empty for trailing
    /// parts whose last sector does not exist.
    pub fn part_range(&self, part: usize, lines: &Range<u64>) -> Result<Range<u64>, RaidError> {
        let size = self.part_size(part)?;
        let start = (lines.start * RAID_SECTOR).min(size);
        let end = (lines.end * RAID_SECTOR).min(size);
        Ok(start..end)
    }
}

/// Split `data` into the six CloudRAID part streams.
///
/// Used to build fixtures and by anything that must serve RAID parts from a
/// plain byte buffer.
pub fn encode_parts(data: &[u8]) -> [Vec<u8>; RAID_PARTS] {
    let geometry = RaidGeometry::new(data.len() as u64);
    let mut parts: [Vec<u8>; RAID_PARTS] = Default::default();
    for (index, part) in parts.iter_mut().enumerate() {
        // part_size only fails for an index >= RAID_PARTS
        let size = geometry.part_size(index).unwrap_or(0);
        part.reserve(size as usize);
    }

    let sector = RAID_SECTOR as usize;
    for line in data.chunks(RAID_LINE as usize) {
        let mut parity = [0u8; RAID_SECTOR as usize];
        let mut parity_len = 0;
        for (column, bytes) in line.chunks(sector).enumerate() {
            parts[column + 1].extend_from_slice(bytes);
            for (p, b) in parity.iter_mut().zip(bytes) {
                *p ^= *b;
            }
            parity_len = parity_len.max(bytes.len());
        }
        parts[PARITY_PART].extend_from_slice(&parity[..parity_len]);
    }

    parts
}
