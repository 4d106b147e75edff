//! Artifact cipher and content checksums.
//!
//! Artifacts are encrypted with AES-256-CBC (PKCS7 padding) under a key/IV
//! pair that is injected at startup and immutable afterwards; nothing in this
//! module holds a compile-time key. Checksums are hex SHA-256 over the
//! *encrypted* bytes, a compatibility fingerprint rather than a security
//! measure.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::error::{CipherError, CipherResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Symmetric cipher for distributable artifacts.
#[derive(Clone)]
pub struct ArtifactCipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for ArtifactCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCipher")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

impl ArtifactCipher {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Builds a cipher from raw slices, validating lengths.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> CipherResult<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            })?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CipherError::InvalidIvLength {
            expected: IV_LEN,
            actual: iv.len(),
        })?;
        Ok(Self::new(key, iv))
    }

    /// The raw key, as transported base64-encoded in script responses.
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> CipherResult<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| CipherError::Decrypt(e.to_string()))
    }
}

/// Hex SHA-256 digest of the given bytes.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> ArtifactCipher {
        ArtifactCipher::new([0x42; KEY_LEN], [0x17; IV_LEN])
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let cipher = test_cipher();
        let plaintext = b"PK\x03\x04 pretend jar contents".repeat(50);

        let ciphertext = cipher.encrypt(&plaintext);
        assert_ne!(ciphertext, plaintext);
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn ciphertext_is_block_padded() {
        let cipher = test_cipher();
        let ciphertext = cipher.encrypt(b"short");
        assert_eq!(ciphertext.len() % 16, 0);
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let ciphertext = test_cipher().encrypt(b"artifact bytes here, 32 or more!");
        let other = ArtifactCipher::new([0x01; KEY_LEN], [0x17; IV_LEN]);
        match other.decrypt(&ciphertext) {
            Ok(garbled) => assert_ne!(garbled, b"artifact bytes here, 32 or more!"),
            Err(CipherError::Decrypt(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn from_slices_validates_lengths() {
        assert!(matches!(
            ArtifactCipher::from_slices(&[0; 16], &[0; 16]),
            Err(CipherError::InvalidKeyLength { .. })
        ));
        assert!(matches!(
            ArtifactCipher::from_slices(&[0; 32], &[0; 8]),
            Err(CipherError::InvalidIvLength { .. })
        ));
        assert!(ArtifactCipher::from_slices(&[0; 32], &[0; 16]).is_ok());
    }

    #[test]
    fn checksum_is_stable_hex() {
        let sum = checksum_hex(b"abc");
        assert_eq!(
            sum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
