//! Per-block CBC-MACs and their condensation

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use super::{bytes_to_words, words_to_bytes, BlockCipher};

/// Span covered by one block MAC. Chunk sizes are multiples of this, so
/// chunk boundaries are always block boundaries.
pub const MAC_BLOCK_SIZE: u64 = 128 * 1024;

/// 128-bit MAC as four big-endian words
pub type BlockMac = [u32; 4];

/// Block MACs keyed by the block's starting offset
pub type MacList = Vec<(u64, BlockMac)>;

/// CBC-MAC one block of plaintext, seeded with the nonce twice.
pub fn block_mac(cipher: &BlockCipher, nonce: [u32; 2], data: &[u8]) -> BlockMac {
    let mut state = words_to_bytes(&[nonce[0], nonce[1], nonce[0], nonce[1]]);
    for sector in data.chunks(16) {
        for (s, b) in state.iter_mut().zip(sector) {
            *s ^= b;
        }
        state = cipher.encrypt(state);
    }
    bytes_to_words(&state)
}

/// MAC every block of a chunk starting at `base_offset`.
pub fn block_macs(cipher: &BlockCipher, nonce: [u32; 2], base_offset: u64, data: &[u8]) -> MacList {
    data.chunks(MAC_BLOCK_SIZE as usize)
        .enumerate()
        .map(|(i, block)| {
            (
                base_offset + i as u64 * MAC_BLOCK_SIZE,
                block_mac(cipher, nonce, block),
            )
        })
        .collect()
}

/// Fold block MACs, in ascending offset order, into one 128-bit value.
pub fn condense<'a>(cipher: &BlockCipher, macs: impl IntoIterator<Item = &'a BlockMac>) -> BlockMac {
    let mut state = [0u8; 16];
    for mac in macs {
        for (s, b) in state.iter_mut().zip(words_to_bytes(mac)) {
            *s ^= b;
        }
        state = cipher.encrypt(state);
    }
    bytes_to_words(&state)
}

pub fn meta_mac(condensed: &BlockMac) -> [u32; 2] {
    [condensed[0] ^ condensed[1], condensed[2] ^ condensed[3]]
}

/// 12-byte XOR fold of an upload body, sent alongside the chunk.
pub fn upload_checksum(data: &[u8]) -> String {
    let mut sum = [0u8; 12];
    for (i, byte) in data.iter().enumerate() {
        sum[i % 12] ^= byte;
    }
    URL_SAFE_NO_PAD.encode(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> BlockCipher {
        BlockCipher::new([0x42; 16])
    }

    #[test]
    fn test_empty_file_meta_mac() {
        let condensed = condense(&cipher(), std::iter::empty());
        assert_eq!(condensed, [0, 0, 0, 0]);
        assert_eq!(meta_mac(&condensed), [0, 0]);
    }

    #[test]
    fn test_block_mac_detects_bit_flip() {
        let cipher = cipher();
        let mut data = vec![0x5Au8; 4096];
        let before = block_mac(&cipher, [1, 2], &data);
        data[2048] ^= 1;
        assert_ne!(before, block_mac(&cipher, [1, 2], &data));
    }

    #[test]
    fn test_trailing_sector_zero_padded() {
        let cipher = cipher();
        let short = vec![1u8, 2, 3];
        let padded = vec![1u8, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            block_mac(&cipher, [0, 0], &short),
            block_mac(&cipher, [0, 0], &padded)
        );
    }

    #[test]
    fn test_block_macs_offsets() {
        let cipher = cipher();
        let data = vec![0u8; (MAC_BLOCK_SIZE * 2 + 10) as usize];
        let macs = block_macs(&cipher, [0, 0], MAC_BLOCK_SIZE * 4, &data);
        let offsets: Vec<u64> = macs.iter().map(|(o, _)| *o).collect();
        assert_eq!(
            offsets,
            vec![MAC_BLOCK_SIZE * 4, MAC_BLOCK_SIZE * 5, MAC_BLOCK_SIZE * 6]
        );
    }

    #[test]
    fn test_condense_is_order_sensitive() {
        let cipher = cipher();
        let a = [1, 2, 3, 4];
        let b = [5, 6, 7, 8];
        assert_ne!(condense(&cipher, [&a, &b]), condense(&cipher, [&b, &a]));
    }

    #[test]
    fn test_upload_checksum() {
        let data: Vec<u8> = (0..12).collect();
        assert_eq!(upload_checksum(&data), "AAECAwQFBgcICQoL");

        let data: Vec<u8> = (0..13).collect();
        assert_eq!(upload_checksum(&data), "DAECAwQFBgcICQoL");

        assert_eq!(upload_checksum(&[]), "AAAAAAAAAAAAAAAA");
    }
}
