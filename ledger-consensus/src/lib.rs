//! Ledger Consensus - block production, UTXO state and fork choice
//!
//! This crate implements the engine of a UTXO ledger: the owner-indexed UTXO
//! index, the tip-ordered transaction pool, round-robin producer scheduling,
//! block assembly, proof-of-work and delegated-proof-of-stake sealing, and the
//! driver that ties them to a network.

pub mod chain;
pub mod config;
pub mod consensus;
pub mod contract;
pub mod dynasty;
pub mod error;
pub mod network;
pub mod producer;
pub mod proof;
pub mod transaction;
pub mod txpool;
pub mod utxo;

pub use chain::{Block, BlockHeader, Blockchain};
pub use config::NodeConfig;
pub use consensus::{BlockDisposition, ConsensusEngine, ConsensusState, DriverSettings};
pub use contract::{ContractExecutor, ExecutionContext, ExecutionResult, NoopExecutor};
pub use dynasty::Dynasty;
pub use error::{ConsensusError, ErrorKind};
pub use network::{NetService, NetworkMessage};
pub use producer::{BlockContext, BlockProducer, ProductionOutcome, ProductionTask};
pub use proof::{Dpos, ProofEngine, ProofOfWork, SealResult, StopSignal};
pub use transaction::{Transaction, TransactionType, TransferParams, TxId, TxInput, TxOutput};
pub use txpool::{PoolEvent, TransactionPool};
pub use utxo::{Utxo, UtxoIndex, UtxoKind, UtxoTx};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Block height in the chain
pub type BlockHeight = u64;

/// Consensus protocol version
pub const CONSENSUS_VERSION: &str = "0.1.0";

/// Engine constants
pub mod constants {
    /// Block subsidy when none is configured
    pub const DEFAULT_SUBSIDY: u64 = 10;

    /// Recent DPoS slots remembered for double-mint detection
    pub const DOUBLE_MINT_CACHE_SIZE: usize = 128;

    /// Most blocks sent in one sync response
    pub const MAX_SYNC_BLOCKS: usize = 128;

    /// Driver timer period in milliseconds
    pub const TICK_INTERVAL_MS: u64 = 250;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(!CONSENSUS_VERSION.is_empty());
    }
}
