//! # Cryptographic Primitives
//!
//! Generic AES-256-GCM authenticated encryption over raw key bytes, shared
//! by every subsystem that needs an AEAD (today: the credential store's
//! payload encryption). Key derivation from human-supplied secrets is the
//! caller's job — see [`crate::credential::kdf`] for the memory-hard KDF
//! used to turn a master password into a key for this module.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │  Nonce (12B)  │  Ciphertext + Auth Tag (16B suffix)  │
//! └──────────────┴──────────────────────────────────────┘
//! ```

use crate::error::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};

/// Fixed nonce length for AES-256-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// Derives a 256-bit key from a password using BLAKE3 keyed hashing.
///
/// This is a *fast* KDF, suitable only where the input already has high
/// entropy (e.g. a generated repository password) — not for a human-memorable
/// master password, which needs the memory-hard KDF in `credential::kdf`.
pub fn derive_key_fast(password: &str) -> [u8; 32] {
    blake3::derive_key("timelocker v1 encryption key", password.as_bytes())
}

/// Encrypts plaintext using AES-256-GCM with a random nonce and a raw key.
///
/// Returns the nonce prepended to the ciphertext (nonce ‖ ciphertext ‖ tag).
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypts data produced by [`encrypt_with_key`].
///
/// Returns an error if the authentication tag does not match (indicating
/// corruption or a wrong key).
pub fn decrypt_with_key(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionFailed.into());
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(plaintext)
}

/// Encrypts plaintext using a password-derived key (fast KDF — see
/// [`derive_key_fast`]). Convenience wrapper kept for repository-password
/// based encryption of small values outside the credential store.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    encrypt_with_key(plaintext, &derive_key_fast(password))
}

/// Decrypts data produced by [`encrypt`].
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    decrypt_with_key(data, &derive_key_fast(password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encryption() {
        let password = "test-password-12345";
        let plaintext = b"Hello, timelocker encryption!";

        let encrypted = encrypt(plaintext, password).unwrap();
        assert_ne!(encrypted.as_slice(), plaintext);
        assert!(encrypted.len() > plaintext.len());

        let decrypted = decrypt(&encrypted, password).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_password_fails() {
        let encrypted = encrypt(b"secret data", "correct-password").unwrap();
        let result = decrypt(&encrypted, "wrong-password");
        assert!(result.is_err());
    }

    #[test]
    fn empty_data_fails() {
        let result = decrypt(&[], "password");
        assert!(result.is_err());
    }

    #[test]
    fn short_data_fails() {
        let result = decrypt(&[0u8; 5], "password");
        assert!(result.is_err());
    }

    #[test]
    fn unique_nonces() {
        let a = encrypt(b"data", "pw").unwrap();
        let b = encrypt(b"data", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_based_roundtrip() {
        let key = [7u8; 32];
        let ciphertext = encrypt_with_key(b"raw key data", &key).unwrap();
        let plaintext = decrypt_with_key(&ciphertext, &key).unwrap();
        assert_eq!(plaintext, b"raw key data");
    }
}
