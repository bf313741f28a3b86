//! Serialization protocol for checkpoints
//!
//! Savers turn checkpoints, metadata and pending writes into bytes through a
//! [`SerializerProtocol`]. [`JsonSerializer`] is the default; wrap any serializer
//! in an [`EncryptedSerializer`] to keep state encrypted at rest.

use crate::error::{CheckpointError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Protocol for serializing and deserializing checkpoint data
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// JSON-based serializer (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// AES-256-GCM wrapper around another serializer.
///
/// Output is `nonce (12 bytes) || ciphertext`. A fresh random nonce is drawn for
/// every call, so equal values never produce equal bytes. Errors never carry
/// plaintext or key material.
#[derive(Clone)]
pub struct EncryptedSerializer<S = JsonSerializer> {
    inner: S,
    cipher: Aes256Gcm,
}

impl<S: SerializerProtocol> EncryptedSerializer<S> {
    /// Wrap `inner` with a 256-bit key
    pub fn new(inner: S, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Wrap `inner` with a key given as a byte slice
    ///
    /// # Errors
    ///
    /// Returns `Encryption` unless the key is exactly 32 bytes.
    pub fn from_slice(inner: S, key: &[u8]) -> Result<Self> {
        let key: &[u8; 32] = key
            .try_into()
            .map_err(|_| CheckpointError::Encryption("key must be 32 bytes"))?;
        Ok(Self::new(inner, key))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CheckpointError::Encryption("encryption failed"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(CheckpointError::Encryption("ciphertext too short"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CheckpointError::Encryption("decryption failed"))
    }
}

impl<S> std::fmt::Debug for EncryptedSerializer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSerializer").finish_non_exhaustive()
    }
}

impl<S: SerializerProtocol> SerializerProtocol for EncryptedSerializer<S> {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let plaintext = self.inner.dumps(value)?;
        self.encrypt(&plaintext)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        let plaintext = self.decrypt(data)?;
        self.inner.loads(&plaintext)
    }
}

/// Generate a random 256-bit key using the OS CSPRNG.
pub fn generate_key() -> [u8; 32] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    fn sample() -> TestData {
        TestData {
            name: "test".to_string(),
            value: 42,
        }
    }

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::new();
        let bytes = serializer.dumps(&sample()).unwrap();
        let restored: TestData = serializer.loads(&bytes).unwrap();
        assert_eq!(sample(), restored);
    }

    #[test]
    fn test_encrypted_output_is_opaque() {
        let serializer = EncryptedSerializer::new(JsonSerializer, &generate_key());
        let first = serializer.dumps(&sample()).unwrap();
        let second = serializer.dumps(&sample()).unwrap();

        assert_ne!(first, second, "nonce must differ per call");
        let text = String::from_utf8_lossy(&first);
        assert!(!text.contains("test"));

        let restored: TestData = serializer.loads(&first).unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_wrong_key_fails() {
        let writer = EncryptedSerializer::new(JsonSerializer, &generate_key());
        let reader = EncryptedSerializer::new(JsonSerializer, &generate_key());

        let bytes = writer.dumps(&sample()).unwrap();
        let err = reader.loads::<TestData>(&bytes).unwrap_err();
        assert!(matches!(err, CheckpointError::Encryption("decryption failed")));
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let serializer = EncryptedSerializer::new(JsonSerializer, &generate_key());
        let err = serializer.loads::<TestData>(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CheckpointError::Encryption(_)));
    }

    #[test]
    fn test_key_length_checked() {
        assert!(EncryptedSerializer::from_slice(JsonSerializer, &[0u8; 16]).is_err());
        assert!(EncryptedSerializer::from_slice(JsonSerializer, &[0u8; 32]).is_ok());
    }
}
