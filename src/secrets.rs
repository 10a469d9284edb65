// llmlb — sealing of upstream endpoint API keys
//
// Endpoint secrets never reach the store in plaintext. They are sealed with
// AES-256-GCM under a key derived from the process JWT secret, and unsealed
// only at proxy time when the request is forwarded upstream.
//
// Wire format: base64(nonce[12] || ciphertext).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed — wrong key or corrupted ciphertext")]
    Decrypt,
    #[error("malformed sealed value")]
    Malformed,
}

#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Derive the sealing key from the JWT secret. Rotating the JWT secret
    /// invalidates stored endpoint keys, which must then be re-entered.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SealError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SealError::Encrypt)?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(B64.encode(out))
    }

    pub fn unseal(&self, sealed: &str) -> Result<String, SealError> {
        let raw = B64.decode(sealed).map_err(|_| SealError::Malformed)?;
        if raw.len() < 12 {
            return Err(SealError::Malformed);
        }
        let (nonce, ciphertext) = raw.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SealError::Decrypt)
    }
}
