//! Whole-file MAC verification with gap recovery
//!
//! Block MACs are folded in ascending offset order and compared against the
//! meta-MAC carried by the file key. When that fails, a bounded search
//! excludes short runs of blocks near the tail, where racing chunks may
//! have left stray entries, and checks again.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::config::IntegrityConfig;
use crate::crypto::{BlockMac, ChunkCipher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The full fold matched
    Match,
    /// Matched once the given run of entries was left out
    Recovered { excluded: Range<usize> },
    Mismatch,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Verification::Mismatch)
    }
}

pub fn verify_macs(
    cipher: &ChunkCipher,
    macs: &BTreeMap<u64, BlockMac>,
    expected: [u32; 2],
    config: &IntegrityConfig,
) -> Verification {
    let ordered: Vec<&BlockMac> = macs.values().collect();
    if cipher.meta_mac(ordered.iter().copied()) == expected {
        return Verification::Match;
    }

    let n = ordered.len();
    let depth = config.gap_search_depth.min(n);
    for window in 1..=config.gap_max_window.min(depth) {
        for start in (n - depth..=n - window).rev() {
            let candidate = ordered[..start]
                .iter()
                .chain(&ordered[start + window..])
                .copied();
            if cipher.meta_mac(candidate) == expected {
                return Verification::Recovered {
                    excluded: start..start + window,
                };
            }
        }
    }
    Verification::Mismatch
}
