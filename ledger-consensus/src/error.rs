//! Error types for the consensus system

use ledger_core::{Amount, CoreError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid input reference: {0}")]
    InvalidInput(String),

    #[error("UTXO not found")]
    UtxoNotFound,

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Duplicate transaction")]
    DuplicateTransaction,

    #[error("Transaction pool is full")]
    TransactionPoolFull,

    #[error("Producer does not own the time slot")]
    WrongProducerTurn,

    #[error("Producer minted more than one block in slot {0}")]
    DoubleMint(u64),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Contract execution failed: {0}")]
    ContractExecution(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

/// Coarse classification of a [`ConsensusError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transaction or block is discarded
    Validation,
    /// Retrying later may succeed
    Resource,
    /// State is inconsistent; the current attempt must be aborted
    Invariant,
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::TransactionPoolFull
            | ConsensusError::NetworkError(_)
            | ConsensusError::Core(CoreError::StorageError(_)) => ErrorKind::Resource,
            ConsensusError::InvariantViolation(_) => ErrorKind::Invariant,
            _ => ErrorKind::Validation,
        }
    }
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::SerializationError(e.to_string())
    }
}
