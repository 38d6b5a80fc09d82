// AEAD primitives for the message envelope: AES-CCM with a 4-byte tag.
// Numan Thabit 2025

use aes::Aes128;
use ccm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    consts::{U13, U4},
    Ccm,
};
use thiserror::Error;

use crate::types::ExtAddress;

type MleCcm = Ccm<Aes128, U4, U13>;

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 16;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 4;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 13;

/// A per-epoch symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct MleKey(pub [u8; KEY_LEN]);

impl std::fmt::Debug for MleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MleKey(..)")
    }
}

/// Envelope nonce: sender extended address, frame counter, security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn build(sender: &ExtAddress, frame_counter: u32, security_level: u8) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[0..8].copy_from_slice(sender.as_bytes());
        bytes[8..12].copy_from_slice(&frame_counter.to_be_bytes());
        bytes[12] = security_level;
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Errors returned by AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Authentication tag did not verify.
    #[error("decryption failed")]
    Decrypt,
}

/// Encrypts `plaintext`, returning ciphertext concatenated with the tag.
pub fn seal(
    key: &MleKey,
    nonce: &Nonce,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = MleCcm::new(GenericArray::from_slice(&key.0));
    cipher
        .encrypt(
            GenericArray::from_slice(&nonce.0),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts ciphertext+tag produced by [`seal`].
pub fn open(
    key: &MleKey,
    nonce: &Nonce,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = MleCcm::new(GenericArray::from_slice(&key.0));
    cipher
        .decrypt(
            GenericArray::from_slice(&nonce.0),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ccm_round_trip() {
        let key = MleKey([0x11; KEY_LEN]);
        let nonce = Nonce::build(&ExtAddress([0x22; 8]), 7, 5);
        let aad = b"addresses and header";
        let plaintext = b"hello mesh";

        let ciphertext = seal(&key, &nonce, aad, plaintext).expect("seal");
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let recovered = open(&key, &nonce, aad, &ciphertext).expect("open");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn flipping_any_byte_breaks_authentication() {
        let key = MleKey([0x42; KEY_LEN]);
        let nonce = Nonce::build(&ExtAddress([0x01; 8]), 1, 5);
        let aad = b"aad";
        let ciphertext = seal(&key, &nonce, aad, b"payload").unwrap();

        for i in 0..ciphertext.len() {
            let mut tampered = ciphertext.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                open(&key, &nonce, aad, &tampered),
                Err(AeadError::Decrypt),
                "byte {i} flip must fail"
            );
        }
    }

    #[test]
    fn aad_is_authenticated() {
        let key = MleKey([0x33; KEY_LEN]);
        let nonce = Nonce::build(&ExtAddress([0x09; 8]), 99, 5);
        let ciphertext = seal(&key, &nonce, b"aad-one", b"payload").unwrap();
        assert_eq!(
            open(&key, &nonce, b"aad-two", &ciphertext),
            Err(AeadError::Decrypt)
        );
    }

    #[test]
    fn nonce_layout() {
        let nonce = Nonce::build(&ExtAddress([1, 2, 3, 4, 5, 6, 7, 8]), 0x0A0B0C0D, 5);
        let bytes = nonce.as_bytes();
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(bytes[12], 5);
    }
}
