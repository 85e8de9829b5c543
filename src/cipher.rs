//! AES-128-CBC framing used on both GATT characteristics.
//!
//! Every frame is zero-padded to the 16-byte block size and chained from an
//! all-zero IV. The key is baked into the monitor firmware.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::warn;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Key shared by every BM2 monitor
pub const CIPHER_KEY: [u8; 16] = [
    0x6C, 0x65, 0x61, 0x67, 0x65, 0x6E, 0x64, 0xFF, 0xFE, 0x31, 0x38, 0x38, 0x32, 0x34, 0x36, 0x36,
];

/// Zero-pad `data` to the next multiple of [`BLOCK_SIZE`]
#[must_use]
pub fn pad16(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    let remainder = data.len() % BLOCK_SIZE;
    if remainder != 0 {
        padded.resize(data.len() + BLOCK_SIZE - remainder, 0);
    }
    padded
}

/// CBC codec with a zero IV
pub struct FrameCipher {
    cipher: Aes128,
}

impl Default for FrameCipher {
    fn default() -> Self {
        Self::new(&CIPHER_KEY)
    }
}

impl FrameCipher {
    /// Create a codec for the given key
    #[must_use]
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// Pad and encrypt a plaintext frame. Output length is a multiple of 16.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut data = pad16(plaintext);
        let mut chain = [0u8; BLOCK_SIZE];

        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            for (byte, prev) in block.iter_mut().zip(chain.iter()) {
                *byte ^= prev;
            }
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
            chain.copy_from_slice(block);
        }

        data
    }

    /// Decrypt a ciphertext frame.
    ///
    /// Input that is not block aligned is zero-padded first instead of being
    /// rejected; the trailing plaintext of such a frame is garbage.
    #[must_use]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            warn!(
                "Ciphertext length {} is not a multiple of {BLOCK_SIZE}, zero-padding",
                ciphertext.len()
            );
        }

        let mut data = pad16(ciphertext);
        let mut chain = [0u8; BLOCK_SIZE];
        let mut saved = [0u8; BLOCK_SIZE];

        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            saved.copy_from_slice(block);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
            for (byte, prev) in block.iter_mut().zip(chain.iter()) {
                *byte ^= prev;
            }
            chain = saved;
        }

        data
    }
}

/// Encrypt with the monitor key
#[must_use]
pub fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    FrameCipher::default().encrypt(plaintext)
}

/// Decrypt with the monitor key
#[must_use]
pub fn decrypt(ciphertext: &[u8]) -> Vec<u8> {
    FrameCipher::default().decrypt(ciphertext)
}
