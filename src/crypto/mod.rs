//! Chunk encryption and integrity
//!
//! File contents travel AES-128-CTR encrypted. Integrity comes from a
//! CBC-MAC per 128 KiB block, condensed into a 64-bit meta-MAC that the
//! file key carries.
//!
//! Key material layout (32-bit big-endian words):
//!
//! ```text
//! file key:   k0 k1 k2 k3 k4 k5 k6 k7
//! AES key:    k0^k4 k1^k5 k2^k6 k3^k7
//! CTR nonce:  k4 k5
//! meta-MAC:   k6 k7
//! ```

pub mod ctr;
pub mod key;
pub mod mac;

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

pub use ctr::apply_keystream;
pub use key::{FileKey, UploadKey};
pub use mac::{
    block_mac, block_macs, condense, meta_mac, upload_checksum, BlockMac, MacList,
    MAC_BLOCK_SIZE,
};

/// Single AES-128 block permutation shared by CTR and the MACs.
#[derive(Clone)]
pub struct BlockCipher {
    inner: Aes128,
}

impl BlockCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            inner: Aes128::new(GenericArray::from_slice(&key)),
        }
    }

    pub fn encrypt(&self, block: [u8; 16]) -> [u8; 16] {
        let mut buf = GenericArray::clone_from_slice(&block);
        self.inner.encrypt_block(&mut buf);
        let mut out = [0u8; 16];
        out.copy_from_slice(&buf);
        out
    }
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockCipher(..)")
    }
}

/// Everything needed to transform one chunk in either direction.
#[derive(Clone, Debug)]
pub struct ChunkCipher {
    cipher: BlockCipher,
    nonce: [u32; 2],
}

impl ChunkCipher {
    pub fn new(aes_key: [u8; 16], nonce: [u32; 2]) -> Self {
        Self {
            cipher: BlockCipher::new(aes_key),
            nonce,
        }
    }

    pub fn nonce(&self) -> [u32; 2] {
        self.nonce
    }

    pub fn block_cipher(&self) -> &BlockCipher {
        &self.cipher
    }

    /// Decrypt a downloaded chunk and MAC its plaintext.
    ///
    /// `offset` must sit on a MAC block boundary.
    pub fn decrypt_chunk(&self, offset: u64, mut data: Vec<u8>) -> (Vec<u8>, MacList) {
        apply_keystream(&self.cipher, self.nonce, offset, &mut data);
        let macs = block_macs(&self.cipher, self.nonce, offset, &data);
        (data, macs)
    }

    /// MAC a plaintext chunk, then encrypt it in place.
    pub fn encrypt_chunk(&self, offset: u64, mut data: Vec<u8>) -> (Vec<u8>, MacList) {
        let macs = block_macs(&self.cipher, self.nonce, offset, &data);
        apply_keystream(&self.cipher, self.nonce, offset, &mut data);
        (data, macs)
    }

    /// Fold ordered block MACs into the 64-bit meta-MAC.
    pub fn meta_mac<'a>(&self, macs: impl IntoIterator<Item = &'a BlockMac>) -> [u32; 2] {
        meta_mac(&condense(&self.cipher, macs))
    }
}

pub(crate) fn words_to_bytes(words: &[u32; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

pub(crate) fn bytes_to_words(bytes: &[u8; 16]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}
