//! Hashing and signature primitives
//!
//! The engine treats signing as a capability: anything implementing [`Signer`]
//! can seal blocks and spend outputs, and [`verify_signature`] checks a
//! signature against a bare public key.

use crate::address::OwnerId;
use crate::{CoreError, Result};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::{thread_rng, RngCore};
use secrecy::{ExposeSecret, Secret};
use sha3::{Digest, Sha3_256};
use std::fmt;
use zeroize::Zeroize;

/// 32-byte SHA3 digest used for transaction ids and block hashes
pub type Hash = [u8; 32];

/// Length of a raw ed25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// SHA3-256 of `data`
pub fn hash(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256 over several byte slices, in order
pub fn hash_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Something that can produce signatures for a fixed public key
pub trait Signer: Send + Sync {
    /// Raw public key matching the signatures this signer produces
    fn public_key(&self) -> &[u8];

    /// Sign arbitrary bytes
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Owner identity derived from the public key
    fn owner(&self) -> OwnerId {
        OwnerId::from_public_key(self.public_key())
    }
}

/// Verify `signature` over `data` against a raw public key
pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(data, &signature).is_ok()
}

/// Ed25519 key pair
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Secret<Vec<u8>>,
    /// Cached owner id for fast identity operations
    owner: OwnerId,
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        KeyPair {
            public_key: self.public_key.clone(),
            private_key: Secret::new(self.private_key.expose_secret().clone()),
            owner: self.owner.clone(),
        }
    }
}

impl Zeroize for KeyPair {
    fn zeroize(&mut self) {
        self.public_key.zeroize();
        // private_key is handled by Secret<T>
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .field("owner", &self.owner.to_string())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the thread RNG
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        thread_rng().fill_bytes(&mut seed);
        let keypair = Self::from_seed(&seed);
        seed.zeroize();
        keypair
    }

    /// Deterministically derive a key pair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key = signing_key.verifying_key().to_bytes().to_vec();
        let owner = OwnerId::from_public_key(&public_key);
        KeyPair {
            public_key,
            private_key: Secret::new(seed.to_vec()),
            owner,
        }
    }

    /// Restore a key pair from hex-encoded private key bytes
    pub fn from_private_key_hex(private_key: &str) -> Result<Self> {
        let bytes = hex::decode(private_key.trim())
            .map_err(|e| CoreError::CryptoError(format!("Invalid private key hex: {}", e)))?;
        let mut seed = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| CoreError::CryptoError(format!("Private key must be 32 bytes, got {}", bytes.len())))?;
        let keypair = Self::from_seed(&seed);
        seed.zeroize();
        Ok(keypair)
    }

    fn signing_key(&self) -> Result<SigningKey> {
        let seed = <[u8; 32]>::try_from(self.private_key.expose_secret().as_slice())
            .map_err(|_| CoreError::CryptoError("Corrupted private key".to_string()))?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Verify a signature made by this key pair
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.public_key, data, signature)
    }
}

impl Signer for KeyPair {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self.signing_key()?;
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }

    fn owner(&self) -> OwnerId {
        self.owner
    }
}
