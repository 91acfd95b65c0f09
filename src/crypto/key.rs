//! File and upload keys

use std::fmt;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use super::{words_to_bytes, ChunkCipher};
use crate::error::{Result, TransferError};

/// Full 256-bit key of a stored file.
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey {
    words: [u32; 8],
}

impl FileKey {
    pub fn from_words(words: [u32; 8]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> [u32; 8] {
        self.words
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(TransferError::Config(format!(
                "file key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self { words })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (chunk, word) in out.chunks_exact_mut(4).zip(&self.words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Parse URL-safe base64, padded or not.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(trimmed))
            .map_err(|e| TransferError::Config(format!("invalid file key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn aes_key(&self) -> [u8; 16] {
        let w = &self.words;
        words_to_bytes(&[w[0] ^ w[4], w[1] ^ w[5], w[2] ^ w[6], w[3] ^ w[7]])
    }

    pub fn nonce(&self) -> [u32; 2] {
        [self.words[4], self.words[5]]
    }

    /// Meta-MAC the file's contents must condense to
    pub fn meta_mac(&self) -> [u32; 2] {
        [self.words[6], self.words[7]]
    }

    pub fn chunk_cipher(&self) -> ChunkCipher {
        ChunkCipher::new(self.aes_key(), self.nonce())
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(..)")
    }
}

/// Random key generated for a new upload: AES key plus nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadKey {
    words: [u32; 6],
}

impl UploadKey {
    pub fn generate() -> Self {
        Self {
            words: rand::random(),
        }
    }

    pub fn from_words(words: [u32; 6]) -> Self {
        Self { words }
    }

    pub fn aes_key(&self) -> [u8; 16] {
        words_to_bytes(&[self.words[0], self.words[1], self.words[2], self.words[3]])
    }

    pub fn nonce(&self) -> [u32; 2] {
        [self.words[4], self.words[5]]
    }

    pub fn chunk_cipher(&self) -> ChunkCipher {
        ChunkCipher::new(self.aes_key(), self.nonce())
    }

    /// Fold the computed meta-MAC in to produce the stored file key.
    ///
    /// The result obfuscates the AES key so that `FileKey::aes_key`
    /// recovers the original upload key.
    pub fn complete(&self, meta_mac: [u32; 2]) -> FileKey {
        let u = &self.words;
        FileKey::from_words([
            u[0] ^ u[4],
            u[1] ^ u[5],
            u[2] ^ meta_mac[0],
            u[3] ^ meta_mac[1],
            u[4],
            u[5],
            meta_mac[0],
            meta_mac[1],
        ])
    }
}

impl fmt::Debug for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UploadKey(..)")
    }
}
