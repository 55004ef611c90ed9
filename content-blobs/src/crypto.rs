//! Chunk token sealing
//!
//! Chunk tokens are handed to untrusted callers between the calls of a
//! chunked upload. The four correlation ids are sealed with AES-256-GCM under
//! a key derived once with Argon2id, so a substituted or truncated token fails
//! authentication instead of decoding into someone else's ids.

use crate::database::ChunkToken;
use crate::error::{BlobStorageError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use rand::RngCore;

const NONCE_SIZE: usize = 12; // 96 bits for GCM
const TOKEN_SALT: &[u8] = b"content-blobs/chunk-token";

/// Seals and opens chunk tokens
pub struct ChunkTokenCodec {
    cipher: Aes256Gcm,
}

impl ChunkTokenCodec {
    /// Derive the sealing key from a configured secret
    pub fn new(secret: &str) -> Result<Self> {
        let key = derive_key(secret, TOKEN_SALT)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| {
            BlobStorageError::Configuration(format!("Cipher initialization failed: {}", e))
        })?;
        Ok(Self { cipher })
    }

    /// Codec with a secret that lives only as long as the process
    pub fn ephemeral() -> Result<Self> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::new(&hex::encode(secret))
    }

    pub fn encode(&self, token: &ChunkToken) -> Result<String> {
        let plaintext = serde_json::to_vec(token)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| BlobStorageError::InvalidChunkToken(format!("Sealing failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decode(&self, token: &str) -> Result<ChunkToken> {
        let sealed = hex::decode(token.trim())
            .map_err(|e| BlobStorageError::InvalidChunkToken(format!("not a hex string: {}", e)))?;

        if sealed.len() <= NONCE_SIZE {
            return Err(BlobStorageError::InvalidChunkToken("token too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BlobStorageError::InvalidChunkToken("authentication failed".to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| BlobStorageError::InvalidChunkToken(format!("malformed payload: {}", e)))
    }
}

/// Derive 256-bit key from a secret using Argon2id
fn derive_key(secret: &str, salt: &[u8]) -> Result<Vec<u8>> {
    let argon2 = Argon2::default();

    let salt_string = SaltString::encode_b64(salt)
        .map_err(|e| BlobStorageError::Configuration(format!("Salt encoding failed: {}", e)))?;

    let password_hash = argon2
        .hash_password(secret.as_bytes(), &salt_string)
        .map_err(|e| BlobStorageError::Configuration(format!("Key derivation failed: {}", e)))?;

    let hash = password_hash
        .hash
        .ok_or_else(|| BlobStorageError::Configuration("No hash generated".to_string()))?;

    let key_bytes = hash.as_bytes();
    if key_bytes.len() < 32 {
        return Err(BlobStorageError::Configuration("Derived key too short".to_string()));
    }

    Ok(key_bytes[..32].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> ChunkToken {
        ChunkToken {
            version_id: 42,
            property_type_id: 7,
            binary_property_id: 11,
            file_id: 1234,
        }
    }

    #[test]
    fn test_encode_decode() {
        let codec = ChunkTokenCodec::new("test_secret").unwrap();

        let text = codec.encode(&sample_token()).unwrap();
        let decoded = codec.decode(&text).unwrap();

        assert_eq!(decoded, sample_token());
    }

    #[test]
    fn test_tokens_are_not_plain_ids() {
        let codec = ChunkTokenCodec::new("test_secret").unwrap();

        let first = codec.encode(&sample_token()).unwrap();
        let second = codec.encode(&sample_token()).unwrap();

        // Random nonces
        assert_ne!(first, second);
        assert!(!first.contains("file_id"));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let codec = ChunkTokenCodec::new("test_secret").unwrap();
        let text = codec.encode(&sample_token()).unwrap();

        let mut bytes = hex::decode(&text).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let result = codec.decode(&hex::encode(&bytes));
        assert!(matches!(result, Err(BlobStorageError::InvalidChunkToken(_))));
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let codec = ChunkTokenCodec::new("secret-a").unwrap();
        let other = ChunkTokenCodec::new("secret-b").unwrap();

        let text = codec.encode(&sample_token()).unwrap();

        assert!(other.decode(&text).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = ChunkTokenCodec::ephemeral().unwrap();

        assert!(codec.decode("").is_err());
        assert!(codec.decode("zz").is_err());
        assert!(codec.decode("42*7*11*1234").is_err());
        assert!(codec.decode("abc").is_err());
    }
}
