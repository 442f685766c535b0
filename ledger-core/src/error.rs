//! Error types for ledger primitives

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Amount underflow")]
    AmountUnderflow,

    #[error("Invalid amount string: {0}")]
    InvalidAmount(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),

    #[error("Invalid owner id: {0}")]
    InvalidOwnerId(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}
