use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};
use crate::error::{AppError, Result};

/// The size of a symmetric key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 24;
/// The size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Creates a new `SecureKey` from a byte array.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Returns a reference to the key as a byte array.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short, non-reversible identifier for logs.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl PartialEq for SecureKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SecureKey {}

impl fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureKey({})", self.fingerprint())
    }
}

/// Generates a new random 32-byte key.
pub fn generate_key() -> SecureKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecureKey::new(key)
}

/// Generates a new random 24-byte nonce.
///
/// A nonce must never repeat under the same key, so every encryption draws
/// a fresh one from the OS RNG.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts a plaintext using XChaCha20-Poly1305.
///
/// # Returns
///
/// The ciphertext with the 16-byte tag appended.
pub fn seal(key: &SecureKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))
}

/// Decrypts a ciphertext using XChaCha20-Poly1305.
///
/// Fails closed with `AppError::AuthFailure` on any modification of the
/// ciphertext, the nonce, or a wrong key.
pub fn open(key: &SecureKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| AppError::AuthFailure)
}

/// Packs `nonce || ciphertext`.
pub fn pack(nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    packed.extend_from_slice(nonce);
    packed.extend_from_slice(ciphertext);
    packed
}

/// Splits a packed buffer into its nonce prefix and ciphertext.
pub fn unpack(packed: &[u8]) -> Result<([u8; NONCE_SIZE], &[u8])> {
    if packed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(AppError::AuthFailure);
    }
    let (nonce, ciphertext) = packed.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| AppError::AuthFailure)?;
    Ok((nonce, ciphertext))
}

/// Parses a nonce of exactly `NONCE_SIZE` bytes.
pub fn nonce_from_slice(bytes: &[u8]) -> Result<[u8; NONCE_SIZE]> {
    bytes.try_into().map_err(|_| AppError::AuthFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = generate_key();
        let nonce = generate_nonce();

        let ciphertext = seal(&key, &nonce, b"hello room").unwrap();
        assert_eq!(ciphertext.len(), b"hello room".len() + TAG_SIZE);

        let plaintext = open(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello room");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let nonce = generate_nonce();
        let ciphertext = seal(&generate_key(), &nonce, b"secret").unwrap();

        assert!(matches!(
            open(&generate_key(), &nonce, &ciphertext),
            Err(AppError::AuthFailure)
        ));
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let key = generate_key();
        let nonce = generate_nonce();
        let ciphertext = seal(&key, &nonce, b"tamper me").unwrap();

        for i in 0..ciphertext.len() * 8 {
            let mut corrupted = ciphertext.clone();
            corrupted[i / 8] ^= 1 << (i % 8);
            assert!(open(&key, &nonce, &corrupted).is_err(), "bit {} undetected", i);
        }

        for i in 0..NONCE_SIZE * 8 {
            let mut corrupted = nonce;
            corrupted[i / 8] ^= 1 << (i % 8);
            assert!(open(&key, &corrupted, &ciphertext).is_err(), "nonce bit {} undetected", i);
        }
    }

    #[test]
    fn pack_unpack_keeps_nonce_prefix() {
        let key = generate_key();
        let nonce = generate_nonce();
        let ciphertext = seal(&key, &nonce, &[7u8; 32]).unwrap();

        let packed = pack(&nonce, &ciphertext);
        assert_eq!(&packed[..NONCE_SIZE], &nonce);

        let (n, c) = unpack(&packed).unwrap();
        assert_eq!(n, nonce);
        assert_eq!(c, ciphertext.as_slice());
    }

    #[test]
    fn unpack_rejects_truncated_input() {
        assert!(unpack(&[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn debug_does_not_leak_key_bytes() {
        let key = SecureKey::new([0xAB; KEY_SIZE]);
        let shown = format!("{:?}", key);
        assert!(!shown.contains(", "));
        assert!(shown.starts_with("SecureKey("));
        assert_eq!(key.fingerprint().len(), 16);
    }
}
