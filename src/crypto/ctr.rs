//! AES-CTR keystream addressed by absolute file offset

use super::BlockCipher;

/// XOR the keystream for `[offset, offset + data.len())` into `data`.
///
/// The counter block is the 64-bit nonce followed by the big-endian
/// sector index `offset / 16`, so any range can be transformed
/// independently of the others.
pub fn apply_keystream(cipher: &BlockCipher, nonce: [u32; 2], offset: u64, data: &mut [u8]) {
    let mut counter = offset / 16;
    let mut skip = (offset % 16) as usize;
    let mut pos = 0;

    while pos < data.len() {
        let keystream = cipher.encrypt(counter_block(nonce, counter));
        let take = (16 - skip).min(data.len() - pos);
        for (byte, key) in data[pos..pos + take]
            .iter_mut()
            .zip(&keystream[skip..skip + take])
        {
            *byte ^= key;
        }
        pos += take;
        skip = 0;
        counter += 1;
    }
}

fn counter_block(nonce: [u32; 2], counter: u64) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&nonce[0].to_be_bytes());
    block[4..8].copy_from_slice(&nonce[1].to_be_bytes());
    block[8..16].copy_from_slice(&counter.to_be_bytes());
    block
}
