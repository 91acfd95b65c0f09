//! Line reassembly from part streams
//!
//! The assembler receives part bytes in whatever order the network delivers
//! them, and emits file bytes once every active part has delivered the
//! sectors of the next line. One part may be *skipped*: its sectors are
//! rebuilt from the other five.
//!
//! Parts can be swapped mid-stream with [`LineAssembler::fail_part`]: the
//! failing part becomes the skipped one and the previously skipped part
//! restarts at the current line boundary, reported by
//! [`LineAssembler::resume_range`].

use std::ops::Range;

use crate::{LineSpan, RaidError, RaidGeometry, PARITY_PART, RAID_LINE, RAID_PARTS, RAID_SECTOR};

const SECTOR: usize = RAID_SECTOR as usize;

#[derive(Debug, Clone, Default)]
struct PartBuffer {
    /// Part-relative range this part must deliver for the span
    range: Range<u64>,
    /// Part-relative offset of `pending[0]`
    base: u64,
    /// Bytes received but not yet consumed by a line
    pending: Vec<u8>,
}

impl PartBuffer {
    fn received_end(&self) -> u64 {
        self.base + self.pending.len() as u64
    }

    fn is_complete(&self) -> bool {
        self.received_end() >= self.range.end
    }

    /// Sector bytes for absolute line `line`, zero padded
    fn sector(&self, line: u64) -> [u8; SECTOR] {
        let mut out = [0u8; SECTOR];
        let start = line * RAID_SECTOR;
        let end = (start + RAID_SECTOR).min(self.range.end);
        if end > start && start >= self.base {
            let from = (start - self.base) as usize;
            let to = ((end - self.base) as usize).min(self.pending.len());
            if to > from {
                out[..to - from].copy_from_slice(&self.pending[from..to]);
            }
        }
        out
    }

    /// Drop received bytes before absolute line `line`
    fn consume_until(&mut self, line: u64) {
        let target = (line * RAID_SECTOR).min(self.received_end()).max(self.base);
        let drop = (target - self.base) as usize;
        self.pending.drain(..drop);
        self.base = target;
    }

    /// Restart delivery at absolute line `line`
    fn restart_at(&mut self, line: u64) {
        self.pending.clear();
        self.base = (line * RAID_SECTOR).clamp(self.range.start, self.range.end);
    }
}

/// Rebuilds a file byte range from CloudRAID part data
#[derive(Debug, Clone)]
pub struct LineAssembler {
    span: LineSpan,
    parts: [PartBuffer; RAID_PARTS],
    skipped: Option<usize>,
    /// Next absolute line to emit
    next_line: u64,
    /// File bytes still to drop from the front
    head_remaining: u64,
    /// File bytes still to deliver
    wanted: u64,
    output: Vec<u8>,
}

impl LineAssembler {
    /// Prepare reassembly of `bytes` from a file laid out by `geometry`
    pub fn new(geometry: &RaidGeometry, bytes: Range<u64>) -> Result<Self, RaidError> {
        let span = geometry.span(bytes)?;
        let mut parts: [PartBuffer; RAID_PARTS] = Default::default();
        for (index, part) in parts.iter_mut().enumerate() {
            let range = geometry.part_range(index, &span.lines)?;
            part.base = range.start;
            part.range = range;
        }

        Ok(Self {
            head_remaining: span.head_trim(),
            wanted: span.bytes.end - span.bytes.start,
            next_line: span.lines.start,
            output: Vec::with_capacity((span.bytes.end - span.bytes.start) as usize),
            span,
            parts,
            skipped: None,
        })
    }

    /// Line span being reassembled
    pub fn span(&self) -> &LineSpan {
        &self.span
    }

    /// Part-relative range `part` must deliver from the start
    pub fn part_range(&self, part: usize) -> Result<Range<u64>, RaidError> {
        self.parts
            .get(part)
            .map(|p| p.range.clone())
            .ok_or(RaidError::InvalidPart(part))
    }

    /// Part-relative range still missing for `part` (where a fresh request
    /// for it must start)
    pub fn resume_range(&self, part: usize) -> Result<Range<u64>, RaidError> {
        let buffer = self.parts.get(part).ok_or(RaidError::InvalidPart(part))?;
        Ok(buffer.received_end().min(buffer.range.end)..buffer.range.end)
    }

    /// The part currently being rebuilt instead of fetched
    pub fn skipped(&self) -> Option<usize> {
        self.skipped
    }

    /// Stop using `part`; its sectors are rebuilt from parity from now on
    pub fn skip(&mut self, part: usize) -> Result<(), RaidError> {
        if part >= RAID_PARTS {
            return Err(RaidError::InvalidPart(part));
        }
        match self.skipped {
            Some(current) if current != part => Err(RaidError::TooManyMissing),
            _ => {
                self.skipped = Some(part);
                self.parts[part].restart_at(self.next_line);
                Ok(())
            }
        }
    }

    /// Swap a failing part with the skipped one.
    ///
    /// Returns the part that must now be fetched again (starting at
    /// [`resume_range`](Self::resume_range)), or `None` when nothing was
    /// skipped and the failing part simply becomes the skipped one.
    pub fn fail_part(&mut self, part: usize) -> Result<Option<usize>, RaidError> {
        if part >= RAID_PARTS {
            return Err(RaidError::InvalidPart(part));
        }
        if self.skipped == Some(part) {
            return Err(RaidError::PartNotActive(part));
        }

        let promoted = self.skipped.take();
        if let Some(promoted) = promoted {
            self.parts[promoted].restart_at(self.next_line);
        }
        self.skipped = Some(part);
        self.parts[part].restart_at(self.next_line);
        Ok(promoted)
    }

    /// Feed bytes received from `part`, then emit every line that became
    /// complete. Returns the number of file bytes made available.
    pub fn push(&mut self, part: usize, data: &[u8]) -> Result<usize, RaidError> {
        if part >= RAID_PARTS {
            return Err(RaidError::InvalidPart(part));
        }
        if self.skipped == Some(part) {
            return Err(RaidError::PartNotActive(part));
        }

        let buffer = &mut self.parts[part];
        let room = buffer.range.end.saturating_sub(buffer.received_end());
        if data.len() as u64 > room {
            return Err(RaidError::UnexpectedData {
                part,
                extra: data.len() as u64 - room,
            });
        }
        buffer.pending.extend_from_slice(data);

        Ok(self.advance())
    }

    /// Whether `part` has delivered everything the span needs
    pub fn part_complete(&self, part: usize) -> bool {
        self.parts.get(part).is_some_and(|p| p.is_complete())
    }

    /// Whether every requested byte has been produced
    pub fn is_complete(&self) -> bool {
        self.wanted == 0
    }

    /// File bytes still to produce
    pub fn remaining(&self) -> u64 {
        self.wanted
    }

    /// Take the reassembled bytes produced so far
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Emit all lines every active part can serve. Also used after a part
    /// swap, and for spans whose parts are all empty.
    pub fn advance(&mut self) -> usize {
        let ready_until = self.ready_until();
        let before = self.output.len();

        while self.next_line < ready_until && self.wanted > 0 {
            let line = self.assemble_line(self.next_line);
            self.next_line += 1;

            let mut bytes: &[u8] = &line;
            let head = self.head_remaining.min(bytes.len() as u64) as usize;
            self.head_remaining -= head as u64;
            bytes = &bytes[head..];

            let take = (self.wanted.min(bytes.len() as u64)) as usize;
            self.output.extend_from_slice(&bytes[..take]);
            self.wanted -= take as u64;
        }

        let next_line = self.next_line;
        for (index, part) in self.parts.iter_mut().enumerate() {
            if Some(index) != self.skipped {
                part.consume_until(next_line);
            }
        }

        self.output.len() - before
    }

    /// First line (exclusive) for which every active part has its sector
    fn ready_until(&self) -> u64 {
        let mut ready = self.span.lines.end;
        for (index, part) in self.parts.iter().enumerate() {
            if Some(index) == self.skipped {
                continue;
            }
            // Parity is only needed when a data part is being rebuilt
            if index == PARITY_PART && self.skipped.is_none() {
                continue;
            }
            let lines = if part.is_complete() {
                self.span.lines.end
            } else {
                part.received_end() / RAID_SECTOR
            };
            ready = ready.min(lines);
        }
        ready
    }

    fn assemble_line(&self, line: u64) -> [u8; RAID_LINE as usize] {
        let mut out = [0u8; RAID_LINE as usize];
        let rebuilt = match self.skipped {
            Some(part) if part != PARITY_PART => Some(part),
            _ => None,
        };

        let mut parity = self.parts[PARITY_PART].sector(line);
        for data_part in 1..RAID_PARTS {
            if Some(data_part) == rebuilt {
                continue;
            }
            let sector = self.parts[data_part].sector(line);
            let at = (data_part - 1) * SECTOR;
            out[at..at + SECTOR].copy_from_slice(&sector);
            if rebuilt.is_some() {
                for (p, b) in parity.iter_mut().zip(sector.iter()) {
                    *p ^= *b;
                }
            }
        }

        if let Some(part) = rebuilt {
            let at = (part - 1) * SECTOR;
            out[at..at + SECTOR].copy_from_slice(&parity);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode_parts;
    use proptest::prelude::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Feed every active part in small interleaved pieces
    fn reassemble(
        data: &[u8],
        range: Range<u64>,
        skipped: Option<usize>,
        piece: usize,
    ) -> Vec<u8> {
        let geometry = RaidGeometry::new(data.len() as u64);
        let parts = encode_parts(data);
        let mut assembler = LineAssembler::new(&geometry, range).unwrap();
        if let Some(part) = skipped {
            assembler.skip(part).unwrap();
        }

        let mut cursors: Vec<u64> = (0..RAID_PARTS)
            .map(|p| assembler.part_range(p).unwrap().start)
            .collect();
        let mut out = Vec::new();
        loop {
            let mut progressed = false;
            for p in 0..RAID_PARTS {
                if Some(p) == skipped {
                    continue;
                }
                let end = assembler.part_range(p).unwrap().end;
                if cursors[p] < end {
                    let to = (cursors[p] + piece as u64).min(end);
                    assembler
                        .push(p, &parts[p][cursors[p] as usize..to as usize])
                        .unwrap();
                    cursors[p] = to;
                    progressed = true;
                }
            }
            out.extend(assembler.take_output());
            if !progressed {
                break;
            }
        }
        assembler.advance();
        out.extend(assembler.take_output());
        assert!(assembler.is_complete());
        out
    }

    #[test]
    fn test_all_parts_present() {
        let data = sample(1000);
        assert_eq!(reassemble(&data, 0..1000, None, 7), data);
    }

    #[test]
    fn test_each_skipped_part_rebuilds() {
        let data = sample(997);
        for skipped in 0..RAID_PARTS {
            assert_eq!(
                reassemble(&data, 0..997, Some(skipped), 13),
                data,
                "skipped part {skipped}"
            );
        }
    }

    #[test]
    fn test_unaligned_range_is_trimmed() {
        let data = sample(1000);
        let out = reassemble(&data, 85..913, Some(3), 5);
        assert_eq!(out, &data[85..913]);
    }

    #[test]
    fn test_empty_range_completes_immediately() {
        let geometry = RaidGeometry::new(100);
        let mut assembler = LineAssembler::new(&geometry, 40..40).unwrap();
        assert_eq!(assembler.span().line_count(), 0);
        assembler.advance();
        assert!(assembler.is_complete());
        assert!(assembler.take_output().is_empty());
    }

    #[test]
    fn test_fail_part_mid_stream_swaps_channels() {
        let data = sample(1600);
        let geometry = RaidGeometry::new(1600);
        let parts = encode_parts(&data);
        let mut assembler = LineAssembler::new(&geometry, 0..1600).unwrap();
        assembler.skip(0).unwrap();

        // Deliver the first 5 lines from all data parts
        for p in 1..RAID_PARTS {
            assembler.push(p, &parts[p][..80]).unwrap();
        }
        // Part 2 gets a little further before failing
        assembler.push(2, &parts[2][80..88]).unwrap();

        let promoted = assembler.fail_part(2).unwrap();
        assert_eq!(promoted, Some(0));
        assert_eq!(assembler.skipped(), Some(2));
        // Parity restarts at the current line boundary
        assert_eq!(assembler.resume_range(0).unwrap(), 80..320);

        assembler.push(0, &parts[0][80..]).unwrap();
        for p in [1, 3, 4, 5] {
            assembler.push(p, &parts[p][80..]).unwrap();
        }
        assert!(assembler.is_complete());
        assert_eq!(assembler.take_output(), data);
    }

    #[test]
    fn test_skipping_two_parts_is_rejected() {
        let geometry = RaidGeometry::new(800);
        let mut assembler = LineAssembler::new(&geometry, 0..800).unwrap();
        assembler.skip(1).unwrap();
        assert_eq!(assembler.skip(4), Err(RaidError::TooManyMissing));
        assert_eq!(assembler.push(1, &[0; 16]), Err(RaidError::PartNotActive(1)));
    }

    #[test]
    fn test_overlong_part_data_is_rejected() {
        let geometry = RaidGeometry::new(80);
        let mut assembler = LineAssembler::new(&geometry, 0..80).unwrap();
        assert!(matches!(
            assembler.push(1, &[0; 17]),
            Err(RaidError::UnexpectedData { part: 1, extra: 1 })
        ));
    }

    proptest! {
        #[test]
        fn prop_reconstruction_ignores_missing_channel(
            len in 0usize..2000,
            start_frac in 0.0f64..1.0,
            end_frac in 0.0f64..1.0,
            skipped in 0usize..RAID_PARTS,
            piece in 1usize..64,
        ) {
            let data = sample(len);
            let a = (len as f64 * start_frac.min(end_frac)) as u64;
            let b = (len as f64 * start_frac.max(end_frac)) as u64;

            let baseline = reassemble(&data, a..b, None, piece);
            let degraded = reassemble(&data, a..b, Some(skipped), piece);
            prop_assert_eq!(&baseline, &degraded);
            prop_assert_eq!(&baseline[..], &data[a as usize..b as usize]);
        }
    }
}
