//! At-rest encryption of protected note content.
//!
//! Protected content is encrypted before it is stored, so everything the
//! replication core sees (content hashes, wire payloads, the peer's copy) is
//! ciphertext. Only an editor holding the password can read it back.

use crate::{ArborError, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric key for protected content, wiped from memory on drop.
pub struct ProtectionKey {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ProtectionKey {
    /// Derives the key from the user's password with argon2id.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::Crypto`] if the salt is too short for argon2.
    pub fn derive(password: &str, salt: &[u8]) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::default()
            .hash_password_into(password.as_bytes(), salt, key.as_mut_slice())
            .map_err(|e| ArborError::Crypto(format!("Key derivation failed: {e}")))?;
        Ok(Self { key })
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|e| ArborError::Crypto(format!("Cipher creation failed: {e}")))
    }

    /// Encrypts `plaintext`; the output is the random nonce followed by the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext)
            .map_err(|e| ArborError::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverses [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::Crypto`] for truncated input, a wrong key or
    /// tampered ciphertext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(ArborError::Crypto("Protected content is truncated".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ArborError::Crypto(format!("Decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"arbor-test-salt!";

    #[test]
    fn test_encrypt_then_decrypt() {
        let key = ProtectionKey::derive("hunter2", SALT).unwrap();
        let sealed = key.encrypt(b"secret diary").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"secret diary");
        assert_eq!(key.decrypt(&sealed).unwrap(), b"secret diary");
    }

    #[test]
    fn test_nonces_differ_between_encryptions() {
        let key = ProtectionKey::derive("hunter2", SALT).unwrap();
        assert_ne!(key.encrypt(b"same").unwrap(), key.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_wrong_password_fails() {
        let sealed = ProtectionKey::derive("right", SALT).unwrap().encrypt(b"x").unwrap();
        let wrong = ProtectionKey::derive("wrong", SALT).unwrap();
        assert!(matches!(wrong.decrypt(&sealed), Err(ArborError::Crypto(_))));
        assert!(wrong.decrypt(&[1, 2, 3]).is_err());
    }
}
