use base64::{engine::general_purpose, Engine as _};
use crate::crypto::cipher::{self, SecureKey};
use crate::error::Result;

/// Key that wraps a room's session key before it is written to the store.
///
/// Derived deterministically from the room id and the configured salt, so it
/// is only as secret as the salt. It never leaves the process.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvelopeKey(SecureKey);

impl EnvelopeKey {
    /// Returns the underlying key.
    pub fn key(&self) -> &SecureKey {
        &self.0
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeKey({})", self.0.fingerprint())
    }
}

/// Derives a room's envelope key from `room_id ":" salt` with BLAKE3.
pub fn derive_envelope_key(room_id: &str, salt: &str) -> EnvelopeKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(room_id.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    EnvelopeKey(SecureKey::new(*hasher.finalize().as_bytes()))
}

/// Seals a session key under the envelope key.
///
/// # Returns
///
/// `Base64(nonce[24] || ciphertext)`, ready to store.
pub fn seal_session_key(envelope: &EnvelopeKey, session_key: &SecureKey) -> Result<String> {
    let nonce = cipher::generate_nonce();
    let ciphertext = cipher::seal(envelope.key(), &nonce, session_key.as_bytes())?;
    Ok(general_purpose::STANDARD.encode(cipher::pack(&nonce, &ciphertext)))
}

/// Opens a stored envelope back into the raw session key.
pub fn open_session_key(envelope: &EnvelopeKey, encoded: &str) -> Result<SecureKey> {
    let packed = general_purpose::STANDARD.decode(encoded.trim())?;
    let (nonce, ciphertext) = cipher::unpack(&packed)?;
    let raw = zeroize::Zeroizing::new(cipher::open(envelope.key(), &nonce, ciphertext)?);

    let key: [u8; cipher::KEY_SIZE] = raw
        .as_slice()
        .try_into()
        .map_err(|_| crate::error::AppError::AuthFailure)?;
    Ok(SecureKey::new(key))
}
