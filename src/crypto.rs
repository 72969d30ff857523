//! Record-level AEAD encryption.
//!
//! When a key is configured, the CBOR bytes of every record are sealed with
//! AES-128-GCM before framing. Serialized form: nonce (12 bytes) followed by
//! ciphertext including the 16-byte tag. A fresh random nonce is drawn per
//! encryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FolioError, Result};

/// Key length for AES-128-GCM.
pub const KEY_SIZE: usize = 16;

const NONCE_SIZE: usize = 12;
const TAG_OVERHEAD: usize = 16;

/// 128-bit record encryption key. Key material is zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        EncryptionKey { key }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(FolioError::OutOfRange(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                slice.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(EncryptionKey { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey(..)")
    }
}

/// AES-128-GCM sealing of record payloads.
pub struct RecordCrypto {
    cipher: Aes128Gcm,
}

impl RecordCrypto {
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes128Gcm::new_from_slice(key.as_bytes()).expect("valid key size");
        RecordCrypto { cipher }
    }

    /// Encrypt plaintext. Returns nonce (12 bytes) || ciphertext+tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| FolioError::AuthenticationFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt input of the form nonce (12 bytes) || ciphertext+tag.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_OVERHEAD {
            return Err(FolioError::AuthenticationFailed);
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| FolioError::AuthenticationFailed)
    }

    /// Bytes added by encryption (nonce + tag).
    pub const fn overhead() -> usize {
        NONCE_SIZE + TAG_OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::new([0x42u8; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let crypto = RecordCrypto::new(&test_key());
        let plaintext = b"document payload bytes";

        let sealed = crypto.encrypt(plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + RecordCrypto::overhead());

        let opened = crypto.decrypt(&sealed).unwrap();
        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let crypto = RecordCrypto::new(&test_key());
        let a = crypto.encrypt(b"same input").unwrap();
        let b = crypto.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detection() {
        let crypto = RecordCrypto::new(&test_key());
        let mut sealed = crypto.encrypt(b"sensitive").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            crypto.decrypt(&sealed),
            Err(FolioError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypto1 = RecordCrypto::new(&EncryptionKey::new([0x01u8; KEY_SIZE]));
        let crypto2 = RecordCrypto::new(&EncryptionKey::new([0x02u8; KEY_SIZE]));
        let sealed = crypto1.encrypt(b"secret").unwrap();
        assert!(matches!(
            crypto2.decrypt(&sealed),
            Err(FolioError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        let crypto = RecordCrypto::new(&test_key());
        assert!(matches!(
            crypto.decrypt(&[0u8; 10]),
            Err(FolioError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_key_from_slice_length_checked() {
        assert!(EncryptionKey::from_slice(&[0u8; 16]).is_ok());
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_err());
    }
}
