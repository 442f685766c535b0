//! Block assembly and the cancellable production task
//!
//! Assembly runs against a private copy of the UTXO index: transactions are
//! popped from the pool in dependency and tip order and applied to that copy as
//! they are accepted. Nothing touches the canonical index until the chain
//! commits the sealed block.

use crate::chain::{Block, Blockchain};
use crate::contract::{execute_transaction, gas_payouts, ContractExecutor};
use crate::error::ErrorKind;
use crate::proof::{ProofEngine, SealResult, StopSignal};
use crate::transaction::Transaction;
use crate::txpool::TransactionPool;
use crate::utxo::UtxoIndex;
use crate::{BlockHeight, Result};
use ledger_core::{Amount, OwnerId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default byte budget for the transactions of one block
pub const DEFAULT_BLOCK_SIZE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Collecting,
    Sealed,
}

/// A block under production together with everything needed to adopt or
/// abandon it
#[derive(Debug)]
pub struct BlockContext {
    pub block: Block,

    /// Index state after applying `block`, derived from its parent
    pub utxo_index: UtxoIndex,

    /// Pool transactions consumed by this block
    pub popped: Vec<Transaction>,

    pub state: AssemblyState,
}

impl BlockContext {
    /// Give every popped transaction back to the pool
    pub fn rollback(self, pool: &TransactionPool) {
        if !self.popped.is_empty() {
            tracing::info!(
                "Returning {} transactions from abandoned block to the pool",
                self.popped.len()
            );
        }
        pool.rollback(self.popped);
    }
}

/// Per-block accumulator used while collecting transactions
struct Assembly {
    height: BlockHeight,
    transactions: Vec<Transaction>,
    tips: Amount,
    size: usize,
    special_seq: u32,
}

pub struct BlockProducer {
    chain: Arc<RwLock<Blockchain>>,
    pool: Arc<TransactionPool>,
    executor: Arc<dyn ContractExecutor>,
    beneficiary: OwnerId,
    block_size_limit: usize,
}

impl BlockProducer {
    pub fn new(
        chain: Arc<RwLock<Blockchain>>,
        pool: Arc<TransactionPool>,
        executor: Arc<dyn ContractExecutor>,
        beneficiary: OwnerId,
    ) -> Self {
        Self {
            chain,
            pool,
            executor,
            beneficiary,
            block_size_limit: DEFAULT_BLOCK_SIZE_LIMIT,
        }
    }

    pub fn with_block_size_limit(mut self, limit: usize) -> Self {
        self.block_size_limit = limit;
        self
    }

    pub fn beneficiary(&self) -> OwnerId {
        self.beneficiary
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    /// Assemble an unsealed block on top of the current tail.
    ///
    /// Collection stops when the pool has nothing ready, the byte budget is
    /// spent, or `deadline` passes. On error every popped transaction is
    /// returned to the pool.
    pub fn produce_block(&self, timestamp: u64, deadline: Option<Instant>) -> Result<BlockContext> {
        let (parent, working, subsidy) = {
            let chain = self.chain.read();
            (chain.tail_block().clone(), chain.utxo_index().deep_copy(), chain.subsidy().clone())
        };
        let evicted = self.pool.remove_invalid(&working);
        if evicted > 0 {
            tracing::debug!("Evicted {} transactions invalidated by the new tail", evicted);
        }

        let mut popped = Vec::new();
        match self.assemble(&parent, &working, subsidy, timestamp, deadline, &mut popped) {
            Ok(block) => {
                tracing::info!(
                    "Assembled block at height {} with {} transactions",
                    block.height(),
                    block.transactions.len()
                );
                Ok(BlockContext {
                    block,
                    utxo_index: working,
                    popped,
                    state: AssemblyState::Collecting,
                })
            }
            Err(e) => {
                tracing::error!("Block assembly aborted: {}", e);
                self.pool.rollback(popped);
                Err(e)
            }
        }
    }

    fn assemble(
        &self,
        parent: &Block,
        working: &UtxoIndex,
        subsidy: Amount,
        timestamp: u64,
        deadline: Option<Instant>,
        popped: &mut Vec<Transaction>,
    ) -> Result<Block> {
        let mut assembly = Assembly {
            height: parent.height() + 1,
            transactions: Vec::new(),
            tips: Amount::zero(),
            size: 0,
            special_seq: 0,
        };

        while deadline.map_or(true, |d| Instant::now() < d) && assembly.size < self.block_size_limit {
            let Some(tx) = self.pool.pop_highest_tip_ready(working) else {
                break;
            };
            let size = tx.size();
            if assembly.size + size > self.block_size_limit {
                self.pool.rollback(vec![tx]);
                break;
            }
            let included = if tx.is_contract() {
                self.include_contract(&tx, parent, working, &mut assembly)?
            } else {
                self.include_transfer(&tx, working, &mut assembly)?
            };
            let Some(segment) = included else {
                continue;
            };

            // Accepted: from here on an aborted attempt must give it back.
            assembly.size += size;
            assembly.tips = assembly.tips.add(&tx.tip);
            assembly.transactions.extend(segment);
            popped.push(tx);
        }

        let coinbase = Transaction::new_coinbase(self.beneficiary, assembly.height, subsidy.add(&assembly.tips))?;
        working.apply_transaction(&coinbase)?;
        assembly.transactions.push(coinbase);

        Block::new(assembly.transactions, parent, self.beneficiary, timestamp)
    }

    /// Apply a plain transaction and refund its gas reserve. `None` means the
    /// transaction was dropped.
    fn include_transfer(
        &self,
        tx: &Transaction,
        working: &UtxoIndex,
        assembly: &mut Assembly,
    ) -> Result<Option<Vec<Transaction>>> {
        if let Err(e) = working.apply_transaction(tx) {
            tracing::warn!("Dropping transaction {}: {}", hex::encode(tx.id), e);
            return Ok(None);
        }
        let mut segment = vec![tx.clone()];
        for payout in gas_payouts(self.beneficiary, tx, assembly.height, 0, &mut assembly.special_seq)? {
            working.apply_transaction(&payout)?;
            segment.push(payout);
        }
        Ok(Some(segment))
    }

    /// Run a contract transaction on a staged copy of `working`.
    ///
    /// The copy replaces `working` only once the transaction, its gas payouts
    /// and everything the contract generated have applied. A transaction the
    /// ledger rejects at any of those steps is dropped and `None` returned.
    fn include_contract(
        &self,
        tx: &Transaction,
        parent: &Block,
        working: &UtxoIndex,
        assembly: &mut Assembly,
    ) -> Result<Option<Vec<Transaction>>> {
        let staged = working.deep_copy();
        let mut seq = assembly.special_seq;
        match self.stage_contract(tx, parent, &staged, assembly.height, &mut seq) {
            Ok(segment) => {
                working.replace_with(staged);
                assembly.special_seq = seq;
                Ok(Some(segment))
            }
            Err(e) if e.kind() == ErrorKind::Validation => {
                tracing::warn!("Dropping contract transaction {}: {}", hex::encode(tx.id), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn stage_contract(
        &self,
        tx: &Transaction,
        parent: &Block,
        staged: &UtxoIndex,
        height: BlockHeight,
        seq: &mut u32,
    ) -> Result<Vec<Transaction>> {
        let result = execute_transaction(self.executor.as_ref(), tx, staged, height, parent.header.timestamp)?;
        let mut segment = vec![tx.clone()];
        for payout in gas_payouts(self.beneficiary, tx, height, result.gas_used, seq)? {
            staged.apply_transaction(&payout)?;
            segment.push(payout);
        }
        for generated in result.generated {
            staged.verify_transaction(&generated)?;
            staged.apply_transaction(&generated)?;
            segment.push(generated);
        }
        Ok(segment)
    }

    /// Assemble, then seal with `engine`. Unsealed attempts give their
    /// transactions back to the pool.
    pub fn produce_and_seal(
        &self,
        engine: &dyn ProofEngine,
        timestamp: u64,
        deadline: Option<Duration>,
        stop: &mut StopSignal,
    ) -> ProductionOutcome {
        let mut ctx = match self.produce_block(timestamp, deadline.map(|d| Instant::now() + d)) {
            Ok(ctx) => ctx,
            Err(e) => return ProductionOutcome::Failed(e.to_string()),
        };
        match engine.seal(&mut ctx.block, stop) {
            SealResult::Sealed => {
                ctx.state = AssemblyState::Sealed;
                tracing::info!(
                    "Sealed block {} at height {} ({})",
                    hex::encode(ctx.block.hash()),
                    ctx.block.height(),
                    engine.name()
                );
                ProductionOutcome::Sealed(Box::new(ctx))
            }
            SealResult::Interrupted => {
                ctx.rollback(&self.pool);
                ProductionOutcome::Interrupted
            }
            SealResult::Failed(reason) => {
                tracing::warn!("Sealing failed: {}", reason);
                ctx.rollback(&self.pool);
                ProductionOutcome::Failed(reason)
            }
        }
    }
}

/// What a production task ended with
#[derive(Debug)]
pub enum ProductionOutcome {
    Sealed(Box<BlockContext>),
    Interrupted,
    Failed(String),
}

/// Handle to a block production running on the blocking thread pool
pub struct ProductionTask {
    stop_tx: mpsc::Sender<()>,
    result_rx: mpsc::Receiver<ProductionOutcome>,
}

impl ProductionTask {
    pub fn spawn(
        producer: Arc<BlockProducer>,
        engine: Arc<dyn ProofEngine>,
        timestamp: u64,
        deadline: Option<Duration>,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(1);

        tokio::task::spawn_blocking(move || {
            let mut stop = StopSignal::new(stop_rx);
            let outcome = producer.produce_and_seal(engine.as_ref(), timestamp, deadline, &mut stop);
            if let Err(mpsc::error::SendError(outcome)) = result_tx.blocking_send(outcome) {
                // Nobody is waiting for the block any more.
                if let ProductionOutcome::Sealed(ctx) = outcome {
                    ctx.rollback(producer.pool());
                }
            }
        });

        Self { stop_tx, result_rx }
    }

    /// Ask the task to stop; repeated requests are harmless
    pub fn cancel(&self) {
        if self.stop_tx.try_send(()).is_ok() {
            tracing::info!("Block production cancelled");
        }
    }

    /// The outcome, if the task has finished
    pub fn try_outcome(&mut self) -> Option<ProductionOutcome> {
        match self.result_rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Some(ProductionOutcome::Failed("production task ended without a result".to_string()))
            }
        }
    }

    /// Wait for the task to finish
    pub async fn outcome(mut self) -> ProductionOutcome {
        self.result_rx
            .recv()
            .await
            .unwrap_or_else(|| ProductionOutcome::Failed("production task ended without a result".to_string()))
    }
}
