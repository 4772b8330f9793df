//! AES-256-GCM payload sealing with a key derived from the shared cluster key.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use bytes::Bytes;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TransportError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to every sealed payload (nonce + authentication tag).
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// 256-bit connection key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; 32]);

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherKey([REDACTED])")
    }
}

impl CipherKey {
    /// Derives the connection key from the configured cluster key with HKDF-SHA256.
    pub fn derive(cluster_key: &str) -> Result<Self> {
        if cluster_key.len() < 16 {
            return Err(TransportError::Config {
                reason: "cluster key must be at least 16 characters".to_string(),
            });
        }
        let hk = Hkdf::<Sha256>::new(Some(b"nodelink-cluster"), cluster_key.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(b"payload-key-v1", &mut okm)
            .map_err(|e| TransportError::Crypto {
                reason: e.to_string(),
            })?;
        Ok(CipherKey(okm))
    }
}

/// Seals and opens frame payloads. Each call uses a fresh random nonce,
/// stored in front of the ciphertext.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Builds a cipher from a derived key.
    pub fn new(key: &CipherKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|e| TransportError::Crypto {
            reason: e.to_string(),
        })?;
        Ok(Self { cipher })
    }

    /// Convenience constructor from the cluster key string.
    pub fn from_cluster_key(cluster_key: &str) -> Result<Self> {
        Self::new(&CipherKey::derive(cluster_key)?)
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| TransportError::Crypto {
                reason: e.to_string(),
            })?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a sealed payload. Tampered or foreign payloads fail authentication.
    pub fn open(&self, sealed: &[u8]) -> Result<Bytes> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(TransportError::Crypto {
                reason: format!("sealed payload too short: {} bytes", sealed.len()),
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map(Bytes::from)
            .map_err(|_| TransportError::Crypto {
                reason: "payload authentication failed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "00000000000000000000000000000000";

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = PayloadCipher::from_cluster_key(KEY).unwrap();
        let sealed = cipher.seal(b"keepalive").unwrap();
        assert_eq!(sealed.len(), b"keepalive".len() + SEAL_OVERHEAD);
        assert_eq!(cipher.open(&sealed).unwrap().as_ref(), b"keepalive");
    }

    #[test]
    fn test_empty_payload() {
        let cipher = PayloadCipher::from_cluster_key(KEY).unwrap();
        let sealed = cipher.seal(b"").unwrap();
        assert_eq!(sealed.len(), SEAL_OVERHEAD);
        assert!(cipher.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = PayloadCipher::from_cluster_key(KEY).unwrap();
        assert_ne!(cipher.seal(b"x").unwrap(), cipher.seal(b"x").unwrap());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let cipher = PayloadCipher::from_cluster_key(KEY).unwrap();
        let mut sealed = cipher.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            cipher.open(&sealed),
            Err(TransportError::Crypto { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = PayloadCipher::from_cluster_key(KEY).unwrap();
        let b = PayloadCipher::from_cluster_key("11111111111111111111111111111111").unwrap();
        let sealed = a.seal(b"secret").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(
            CipherKey::derive("short"),
            Err(TransportError::Config { .. })
        ));
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = CipherKey::derive(KEY).unwrap();
        assert_eq!(format!("{:?}", key), "CipherKey([REDACTED])");
    }
}
