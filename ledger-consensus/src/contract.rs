//! Contract execution capability
//!
//! The virtual machine itself lives outside this crate. Block assembly hands
//! each contract transaction to a [`ContractExecutor`] and folds the result
//! back into the block; block verification runs the same steps again and
//! expects the same transactions.

use crate::transaction::{Transaction, TransactionType};
use crate::utxo::{Utxo, UtxoIndex};
use crate::{BlockHeight, ConsensusError, Result};
use ledger_core::{Amount, OwnerId};

/// Everything an executor may look at while running one contract transaction
pub struct ExecutionContext<'a> {
    pub tx: &'a Transaction,

    /// Outputs spent by `tx`, in input order
    pub prev_utxos: &'a [Utxo],

    /// Working index of the block under construction, with `tx` already applied
    pub utxo_index: &'a UtxoIndex,

    pub block_height: BlockHeight,

    /// Deterministic randomness source: the parent block's timestamp
    pub seed: u64,

    /// Whether the target contract existed before this transaction
    pub is_deployed: bool,
}

/// Outcome of running a contract transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub gas_used: u64,

    /// Transactions produced by the contract, usually `ContractSend`
    pub generated: Vec<Transaction>,

    /// Execution error; gas is still charged
    pub error: Option<String>,
}

pub trait ContractExecutor: Send + Sync {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> ExecutionResult;
}

/// Executor that accepts every contract, uses no gas and generates nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

impl ContractExecutor for NoopExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> ExecutionResult {
        tracing::debug!(
            "No-op execution of {} at height {}",
            hex::encode(ctx.tx.id),
            ctx.block_height
        );
        ExecutionResult::default()
    }
}

/// Apply contract transaction `tx` to `working` and run it.
///
/// `seed` is the parent block's timestamp. Whether the contract was deployed
/// is decided before `tx` lands, so the first call to a contract sees
/// `is_deployed == false`.
pub fn execute_transaction(
    executor: &dyn ContractExecutor,
    tx: &Transaction,
    working: &UtxoIndex,
    block_height: BlockHeight,
    seed: u64,
) -> Result<ExecutionResult> {
    let prev_utxos = working.find_vin_utxos(tx)?;
    let contract = tx
        .contract_owner()
        .ok_or_else(|| ConsensusError::InvalidTransaction("contract transaction without target".to_string()))?;
    let is_deployed = working.contract_create_utxo(&contract)?.is_some();
    working.apply_transaction(tx)?;

    let ctx = ExecutionContext {
        tx,
        prev_utxos: &prev_utxos,
        utxo_index: working,
        block_height,
        seed,
        is_deployed,
    };
    let result = executor.execute(&ctx);
    if let Some(error) = &result.error {
        tracing::warn!("Contract {} failed: {}", contract, error);
    }
    if let Some(other) = result.generated.iter().find(|g| g.tx_type != TransactionType::ContractSend) {
        return Err(ConsensusError::ContractExecution(format!(
            "contract {} generated a {:?} transaction",
            contract, other.tx_type
        )));
    }
    Ok(result)
}

/// Gas reward for `producer` and gas change for the sender of `tx`, in block
/// order. Zero amounts are skipped; `seq` numbers the emitted transactions
/// within the block.
pub fn gas_payouts(
    producer: OwnerId,
    tx: &Transaction,
    block_height: BlockHeight,
    gas_used: u64,
    seq: &mut u32,
) -> Result<Vec<Transaction>> {
    let used = std::cmp::min(Amount::from_u64(gas_used), tx.gas_limit.clone());
    let reward = used.mul(&tx.gas_price);
    let change = tx.gas_limit.sub(&used)?.mul(&tx.gas_price);

    let mut payouts = Vec::new();
    if !reward.is_zero() {
        payouts.push(Transaction::new_gas_reward(producer, block_height, *seq, reward)?);
        *seq += 1;
    }
    if !change.is_zero() {
        payouts.push(Transaction::new_gas_change(tx.sender()?, block_height, *seq, change)?);
        *seq += 1;
    }
    Ok(payouts)
}
