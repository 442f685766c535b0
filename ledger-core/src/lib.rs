//! Ledger Core - value, identity and storage primitives
//!
//! This crate holds the leaf building blocks the consensus engine is written
//! against: exact amounts, owner identities, hashing and signatures, and the
//! key-value storage capability.

pub mod address;
pub mod amount;
pub mod crypto;
pub mod error;
pub mod storage;

pub use address::OwnerId;
pub use amount::Amount;
pub use crypto::{hash, verify_signature, Hash, KeyPair, Signer};
pub use error::CoreError;
pub use storage::{FileStorage, MemoryStorage, Storage};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Ledger core version
pub const CORE_VERSION: &str = "0.1.0";
