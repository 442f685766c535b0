//! Owner identities
//!
//! Every output is owned either by a user (hash of a public key) or by a
//! contract. The variant is decided once, when an id is built or decoded.

use crate::crypto::hash_parts;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of the hash carried by an owner id
pub const OWNER_HASH_LEN: usize = 20;

/// Version byte prefixed to user ids in their byte form
pub const USER_VERSION: u8 = 0x5A;

/// Version byte prefixed to contract ids in their byte form
pub const CONTRACT_VERSION: u8 = 0x58;

/// Owner of an unspent output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OwnerId {
    User([u8; OWNER_HASH_LEN]),
    Contract([u8; OWNER_HASH_LEN]),
}

impl OwnerId {
    /// User id of a public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        OwnerId::User(truncate(&hash_parts(&[b"owner", public_key])))
    }

    /// Contract id derived from arbitrary seed bytes (e.g. the deploying tx id)
    pub fn contract_from_seed(seed: &[u8]) -> Self {
        OwnerId::Contract(truncate(&hash_parts(&[b"contract", seed])))
    }

    /// Decode the versioned byte form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (version, rest) = bytes
            .split_first()
            .ok_or_else(|| CoreError::InvalidOwnerId("empty".to_string()))?;
        let hash = <[u8; OWNER_HASH_LEN]>::try_from(rest)
            .map_err(|_| CoreError::InvalidOwnerId(format!("expected {} bytes, got {}", OWNER_HASH_LEN + 1, bytes.len())))?;
        match *version {
            USER_VERSION => Ok(OwnerId::User(hash)),
            CONTRACT_VERSION => Ok(OwnerId::Contract(hash)),
            other => Err(CoreError::InvalidOwnerId(format!("unknown version byte {:#04x}", other))),
        }
    }

    /// Versioned byte form: one version byte followed by the hash
    pub fn to_bytes(&self) -> Vec<u8> {
        let (version, hash) = match self {
            OwnerId::User(h) => (USER_VERSION, h),
            OwnerId::Contract(h) => (CONTRACT_VERSION, h),
        };
        let mut bytes = Vec::with_capacity(OWNER_HASH_LEN + 1);
        bytes.push(version);
        bytes.extend_from_slice(hash);
        bytes
    }

    pub fn hash(&self) -> &[u8; OWNER_HASH_LEN] {
        match self {
            OwnerId::User(h) | OwnerId::Contract(h) => h,
        }
    }

    pub fn is_contract(&self) -> bool {
        matches!(self, OwnerId::Contract(_))
    }
}

fn truncate(digest: &[u8; 32]) -> [u8; OWNER_HASH_LEN] {
    let mut out = [0u8; OWNER_HASH_LEN];
    out.copy_from_slice(&digest[..OWNER_HASH_LEN]);
    out
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl FromStr for OwnerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| CoreError::InvalidOwnerId(format!("{}: {}", s, e)))?;
        OwnerId::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_and_contract_are_distinct() {
        let user = OwnerId::from_public_key(b"key");
        let contract = OwnerId::contract_from_seed(b"key");
        assert!(!user.is_contract());
        assert!(contract.is_contract());
        assert_ne!(user.hash(), contract.hash());
    }

    #[test]
    fn test_string_form() {
        let owner = OwnerId::contract_from_seed(b"seed");
        let text = owner.to_string();
        assert!(text.starts_with("58"));
        assert_eq!(text.parse::<OwnerId>().unwrap(), owner);
    }

    #[test]
    fn test_rejects_bad_bytes() {
        assert!(OwnerId::from_bytes(&[]).is_err());
        assert!(OwnerId::from_bytes(&[USER_VERSION, 1, 2]).is_err());
        let mut bytes = OwnerId::from_public_key(b"k").to_bytes();
        bytes[0] = 0x01;
        assert!(OwnerId::from_bytes(&bytes).is_err());
    }
}
