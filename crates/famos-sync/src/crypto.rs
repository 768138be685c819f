//! Pluggable end-to-end crypto for the replicator.
//!
//! Keys are scoped per space (the MLS group boundary): every device admitted
//! to a space shares its group key, and nothing else can read that space's
//! ops in transit.

use std::collections::HashMap;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use famos_types::SpaceId;

use crate::SyncError;

/// Wraps and unwraps op batches crossing the transport.
pub trait CryptoProvider: Send + Sync {
    /// Encrypt a plaintext for a space.
    fn wrap(&self, space: &SpaceId, plain: &[u8]) -> Result<Vec<u8>, SyncError>;

    /// Decrypt a ciphertext for a space.
    fn unwrap(&self, space: &SpaceId, cipher: &[u8]) -> Result<Vec<u8>, SyncError>;
}

/// No-op provider for tests and trusted local transports.
#[derive(Debug, Clone, Default)]
pub struct PassthroughCrypto;

impl CryptoProvider for PassthroughCrypto {
    fn wrap(&self, _space: &SpaceId, plain: &[u8]) -> Result<Vec<u8>, SyncError> {
        Ok(plain.to_vec())
    }

    fn unwrap(&self, _space: &SpaceId, cipher: &[u8]) -> Result<Vec<u8>, SyncError> {
        Ok(cipher.to_vec())
    }
}

/// ChaCha20-Poly1305 AEAD with one 256-bit group key per space.
/// Wire form: `nonce(12) | ciphertext`.
pub struct ChaChaGroupCrypto {
    keys: HashMap<SpaceId, [u8; 32]>,
}

impl ChaChaGroupCrypto {
    /// Provider over a key table.
    pub fn new(keys: HashMap<SpaceId, [u8; 32]>) -> Self {
        Self { keys }
    }

    /// Install (or rotate) a space key.
    pub fn set_key(&mut self, space: SpaceId, key: [u8; 32]) {
        self.keys.insert(space, key);
    }

    fn cipher_for(&self, space: &SpaceId) -> Result<ChaCha20Poly1305, SyncError> {
        let key = self.keys.get(space).ok_or_else(|| SyncError::UnknownSpaceKey {
            space: space.to_string(),
        })?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
    }
}

impl CryptoProvider for ChaChaGroupCrypto {
    fn wrap(&self, space: &SpaceId, plain: &[u8]) -> Result<Vec<u8>, SyncError> {
        let cipher = self.cipher_for(space)?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut out = nonce_bytes.to_vec();
        let ciphertext = cipher
            .encrypt(nonce, plain)
            .map_err(|_| SyncError::Codec("encryption failed".into()))?;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unwrap(&self, space: &SpaceId, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        let cipher = self.cipher_for(space)?;
        if data.len() < 12 {
            return Err(SyncError::Decryption {
                space: space.to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                tracing::warn!(space = %space, "dropping frame that failed to unwrap");
                SyncError::Decryption {
                    space: space.to_string(),
                }
            })
    }
}
