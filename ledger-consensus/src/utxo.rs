//! Unspent outputs and the UTXO index
//!
//! The index maps every owner to the outputs it can spend. Reads fall through
//! to the backing store on the first access per owner and are cached in an
//! in-memory overlay; mutations only touch the overlay until [`UtxoIndex::persist`]
//! writes the changed owner buckets back. All access goes through one
//! reader/writer lock per index instance.

use crate::transaction::{Transaction, TxId, TxOutput};
use crate::{ConsensusError, Result};
use ledger_core::{Amount, OwnerId, Storage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

const UTXO_KEY_PREFIX: &[u8] = b"utxo/";
const CONTRACT_BUCKET_KEY: &[u8] = b"utxo/contracts";

/// How an output was classified when it entered the index
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UtxoKind {
    Normal,
    /// First output ever paid to a contract; marks the contract as deployed
    ContractCreate,
    /// Any later output paid to an already deployed contract
    ContractInvoke,
}

/// An unspent transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub value: Amount,
    pub owner: OwnerId,
    pub contract: String,
    pub txid: TxId,
    pub tx_index: u32,
    pub kind: UtxoKind,
}

impl Utxo {
    pub fn new(output: &TxOutput, txid: TxId, tx_index: u32, kind: UtxoKind) -> Self {
        Self {
            value: output.value.clone(),
            owner: output.owner,
            contract: output.contract.clone(),
            txid,
            tx_index,
            kind,
        }
    }

    pub fn outpoint(&self) -> (TxId, u32) {
        (self.txid, self.tx_index)
    }
}

/// The outputs held by one owner, keyed by outpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Utxo>", into = "Vec<Utxo>")]
pub struct UtxoTx {
    entries: BTreeMap<(TxId, u32), Utxo>,
}

impl UtxoTx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, txid: &TxId, index: u32) -> Option<&Utxo> {
        self.entries.get(&(*txid, index))
    }

    pub fn put(&mut self, utxo: Utxo) {
        self.entries.insert(utxo.outpoint(), utxo);
    }

    pub fn remove(&mut self, txid: &TxId, index: u32) -> Option<Utxo> {
        self.entries.remove(&(*txid, index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.entries.values()
    }

    pub fn total_value(&self) -> Amount {
        self.entries.values().map(|u| &u.value).sum()
    }

    /// Greedily collect spendable outputs until they cover `amount`.
    ///
    /// Contract-creation records are never spendable.
    pub fn prepare_utxos(&self, amount: &Amount) -> Option<Vec<Utxo>> {
        let mut picked = Vec::new();
        let mut sum = Amount::zero();
        for utxo in self.spendable() {
            if sum >= *amount {
                break;
            }
            sum = sum.add(&utxo.value);
            picked.push(utxo.clone());
        }
        (sum >= *amount).then_some(picked)
    }

    fn spendable(&self) -> impl Iterator<Item = &Utxo> {
        self.entries
            .values()
            .filter(|u| u.kind != UtxoKind::ContractCreate)
    }
}

impl From<Vec<Utxo>> for UtxoTx {
    fn from(utxos: Vec<Utxo>) -> Self {
        let mut tx = UtxoTx::new();
        for utxo in utxos {
            tx.put(utxo);
        }
        tx
    }
}

impl From<UtxoTx> for Vec<Utxo> {
    fn from(tx: UtxoTx) -> Self {
        tx.entries.into_values().collect()
    }
}

fn bucket_key(owner: &OwnerId) -> Vec<u8> {
    let mut key = UTXO_KEY_PREFIX.to_vec();
    key.extend_from_slice(&owner.to_bytes());
    key
}

fn load(store: &dyn Storage, key: &[u8]) -> Result<UtxoTx> {
    match store.get(key)? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(UtxoTx::new()),
    }
}

/// Overlay contents; everything here is guarded by the index lock
#[derive(Clone, Default)]
struct IndexState {
    buckets: HashMap<OwnerId, UtxoTx>,
    /// Contract registry, loaded on first use
    contracts: Option<UtxoTx>,
    dirty: HashSet<OwnerId>,
    contracts_dirty: bool,
}

impl IndexState {
    fn ensure_loaded(&mut self, store: &dyn Storage, owner: &OwnerId) -> Result<()> {
        if !self.buckets.contains_key(owner) {
            let loaded = load(store, &bucket_key(owner))?;
            self.buckets.insert(*owner, loaded);
        }
        Ok(())
    }

    fn bucket(&mut self, store: &dyn Storage, owner: &OwnerId) -> Result<&mut UtxoTx> {
        self.ensure_loaded(store, owner)?;
        self.buckets
            .get_mut(owner)
            .ok_or_else(|| ConsensusError::InvariantViolation("owner bucket vanished".to_string()))
    }

    fn contracts(&mut self, store: &dyn Storage) -> Result<&mut UtxoTx> {
        if self.contracts.is_none() {
            self.contracts = Some(load(store, CONTRACT_BUCKET_KEY)?);
        }
        self.contracts
            .as_mut()
            .ok_or_else(|| ConsensusError::InvariantViolation("contract registry vanished".to_string()))
    }

    fn add(&mut self, store: &dyn Storage, output: &TxOutput, txid: TxId, index: u32) -> Result<()> {
        let owner = output.owner;
        let bucket = self.bucket(store, &owner)?;
        let kind = match owner {
            OwnerId::Contract(_) if bucket.is_empty() => UtxoKind::ContractCreate,
            OwnerId::Contract(_) => UtxoKind::ContractInvoke,
            OwnerId::User(_) => UtxoKind::Normal,
        };
        let utxo = Utxo::new(output, txid, index, kind);
        bucket.put(utxo.clone());
        self.dirty.insert(owner);

        if kind == UtxoKind::ContractCreate {
            self.contracts(store)?.put(utxo);
            self.contracts_dirty = true;
        }
        Ok(())
    }

    fn remove(&mut self, store: &dyn Storage, owner: &OwnerId, txid: &TxId, index: u32) -> Result<Utxo> {
        let removed = self
            .bucket(store, owner)?
            .remove(txid, index)
            .ok_or(ConsensusError::UtxoNotFound)?;
        self.dirty.insert(*owner);

        if removed.kind == UtxoKind::ContractCreate {
            self.contracts(store)?.remove(txid, index);
            self.contracts_dirty = true;
        }
        Ok(removed)
    }

    /// Load every bucket `tx` touches so the mutation below cannot fail half-way
    fn preload(&mut self, store: &dyn Storage, owners: impl Iterator<Item = OwnerId>) -> Result<()> {
        for owner in owners {
            self.ensure_loaded(store, &owner)?;
        }
        self.contracts(store)?;
        Ok(())
    }

    fn apply_transaction(&mut self, store: &dyn Storage, tx: &Transaction) -> Result<()> {
        let mut spent = Vec::new();
        if !tx.is_special() {
            let mut seen = HashSet::new();
            for input in &tx.vin {
                if !seen.insert(input.outpoint()) {
                    return Err(ConsensusError::InvalidInput(format!(
                        "outpoint {}:{} spent twice",
                        hex::encode(input.txid),
                        input.vout
                    )));
                }
                let owner = input.owner()?;
                if self.bucket(store, &owner)?.get(&input.txid, input.vout).is_none() {
                    return Err(ConsensusError::UtxoNotFound);
                }
                spent.push((owner, input.txid, input.vout));
            }
        }
        self.preload(store, tx.vout.iter().map(|o| o.owner))?;

        for (owner, txid, index) in spent {
            self.remove(store, &owner, &txid, index)?;
        }
        for (index, output) in (0u32..).zip(&tx.vout) {
            self.add(store, output, tx.id, index)?;
        }
        Ok(())
    }

    fn undo_transaction<F>(&mut self, store: &dyn Storage, tx: &Transaction, lookup: &F) -> Result<()>
    where
        F: Fn(&TxId) -> Option<Transaction>,
    {
        for (index, output) in (0u32..).zip(&tx.vout) {
            self.remove(store, &output.owner, &tx.id, index)?;
        }
        if tx.is_special() {
            return Ok(());
        }
        for input in &tx.vin {
            let prev = lookup(&input.txid).ok_or_else(|| {
                ConsensusError::InvariantViolation(format!(
                    "spent transaction {} is unknown",
                    hex::encode(input.txid)
                ))
            })?;
            let output = usize::try_from(input.vout)
                .ok()
                .and_then(|i| prev.vout.get(i))
                .ok_or_else(|| ConsensusError::InvalidInput(format!("output index {} out of range", input.vout)))?;
            self.add(store, output, input.txid, input.vout)?;
        }
        Ok(())
    }
}

/// Owner-indexed view of every unspent output
pub struct UtxoIndex {
    state: RwLock<IndexState>,
    store: Arc<dyn Storage>,
}

impl fmt::Debug for UtxoIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("UtxoIndex")
            .field("cached_owners", &state.buckets.len())
            .field("dirty_owners", &state.dirty.len())
            .finish()
    }
}

impl UtxoIndex {
    /// Create an index over `store`; nothing is loaded until first access
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            store,
        }
    }

    fn with_bucket<R>(&self, owner: &OwnerId, f: impl FnOnce(&UtxoTx) -> R) -> Result<R> {
        {
            let state = self.state.read();
            if let Some(bucket) = state.buckets.get(owner) {
                return Ok(f(bucket));
            }
        }
        let loaded = load(self.store.as_ref(), &bucket_key(owner))?;
        let mut state = self.state.write();
        // Another writer may have populated the bucket while we were loading.
        let bucket = state.buckets.entry(*owner).or_insert(loaded);
        Ok(f(bucket))
    }

    /// All outputs currently owned by `owner`
    pub fn get_all_for_owner(&self, owner: &OwnerId) -> Result<UtxoTx> {
        self.with_bucket(owner, UtxoTx::clone)
    }

    /// Look up one output
    pub fn find_utxo(&self, owner: &OwnerId, txid: &TxId, index: u32) -> Result<Option<Utxo>> {
        self.with_bucket(owner, |bucket| bucket.get(txid, index).cloned())
    }

    pub fn get_balance(&self, owner: &OwnerId) -> Result<Amount> {
        self.with_bucket(owner, UtxoTx::total_value)
    }

    /// Outputs of `owner` whose sum covers `amount`
    pub fn get_spendable_set(&self, owner: &OwnerId, amount: &Amount) -> Result<Vec<Utxo>> {
        self.with_bucket(owner, |bucket| {
            bucket.prepare_utxos(amount).ok_or_else(|| ConsensusError::InsufficientFunds {
                needed: amount.clone(),
                available: bucket.spendable().map(|u| &u.value).sum(),
            })
        })?
    }

    /// The outputs referenced by `tx`'s inputs, in input order
    pub fn find_vin_utxos(&self, tx: &Transaction) -> Result<Vec<Utxo>> {
        tx.vin
            .iter()
            .map(|input| {
                self.find_utxo(&input.owner()?, &input.txid, input.vout)?
                    .ok_or(ConsensusError::UtxoNotFound)
            })
            .collect()
    }

    /// Check `tx` against the outputs it references in this index
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.is_special() {
            return Ok(());
        }
        let prev = self.find_vin_utxos(tx)?;
        tx.verify(&prev)
    }

    /// Every deployed contract's creation record
    pub fn contract_utxos(&self) -> Result<Vec<Utxo>> {
        let mut state = self.state.write();
        Ok(state.contracts(self.store.as_ref())?.iter().cloned().collect())
    }

    /// Creation record of `contract`, present once it has been deployed
    pub fn contract_create_utxo(&self, contract: &OwnerId) -> Result<Option<Utxo>> {
        self.with_bucket(contract, |bucket| {
            bucket
                .iter()
                .find(|u| u.kind == UtxoKind::ContractCreate)
                .cloned()
        })
    }

    /// Insert one output
    pub fn add(&self, output: &TxOutput, txid: TxId, index: u32) -> Result<()> {
        let mut state = self.state.write();
        state.add(self.store.as_ref(), output, txid, index)
    }

    /// Remove one output, failing with `UtxoNotFound` when absent
    pub fn remove(&self, owner: &OwnerId, txid: &TxId, index: u32) -> Result<Utxo> {
        let mut state = self.state.write();
        state.remove(self.store.as_ref(), owner, txid, index)
    }

    /// Spend `tx`'s inputs and add its outputs.
    ///
    /// Either the whole transaction is applied or, on error, nothing is.
    pub fn apply_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.write();
        state.apply_transaction(self.store.as_ref(), tx)
    }

    /// Apply transactions in order. Not atomic across transactions: apply to a
    /// [`deep_copy`](Self::deep_copy) when all-or-nothing is required.
    pub fn apply_block(&self, transactions: &[Transaction]) -> Result<()> {
        for tx in transactions {
            self.apply_transaction(tx)?;
        }
        Ok(())
    }

    /// Reverse a block's transactions, restoring the outputs they spent.
    ///
    /// `lookup` resolves the transactions that created those outputs.
    pub fn undo_transactions<F>(&self, transactions: &[Transaction], lookup: F) -> Result<()>
    where
        F: Fn(&TxId) -> Option<Transaction>,
    {
        let mut state = self.state.write();
        for tx in transactions.iter().rev() {
            state.undo_transaction(self.store.as_ref(), tx, &lookup)?;
        }
        Ok(())
    }

    /// Independent copy of the overlay sharing the same backing store
    pub fn deep_copy(&self) -> UtxoIndex {
        UtxoIndex {
            state: RwLock::new(self.state.read().clone()),
            store: Arc::clone(&self.store),
        }
    }

    /// Take over the overlay of `other`, a copy made by [`deep_copy`](Self::deep_copy)
    pub fn replace_with(&self, other: UtxoIndex) {
        *self.state.write() = other.state.into_inner();
    }

    /// Whether there are mutations not yet written to the store
    pub fn has_pending_writes(&self) -> bool {
        let state = self.state.read();
        !state.dirty.is_empty() || state.contracts_dirty
    }

    /// Write changed owner buckets to the store, one bucket at a time, then
    /// drop the overlay.
    ///
    /// On a storage error the remaining buckets stay marked dirty, so calling
    /// `persist` again retries without losing anything.
    pub fn persist(&self) -> Result<()> {
        let mut state = self.state.write();
        let dirty: Vec<OwnerId> = state.dirty.iter().copied().collect();
        for owner in dirty {
            let key = bucket_key(&owner);
            match state.buckets.get(&owner) {
                Some(bucket) if !bucket.is_empty() => {
                    self.store.put(&key, &bincode::serialize(bucket)?)?;
                }
                _ => self.store.delete(&key)?,
            }
            state.dirty.remove(&owner);
        }
        if state.contracts_dirty {
            if let Some(contracts) = &state.contracts {
                self.store.put(CONTRACT_BUCKET_KEY, &bincode::serialize(contracts)?)?;
            }
            state.contracts_dirty = false;
        }
        // Everything cached now matches the store; later reads reload on demand.
        state.buckets.clear();
        state.contracts = None;
        tracing::debug!("Persisted UTXO index overlay");
        Ok(())
    }

    /// Number of owner buckets held in the overlay
    pub fn cached_owners(&self) -> usize {
        self.state.read().buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransferParams, Transaction};
    use ledger_core::{CoreError, KeyPair, MemoryStorage, Signer};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn index() -> UtxoIndex {
        UtxoIndex::new(Arc::new(MemoryStorage::new()))
    }

    fn fund(index: &UtxoIndex, owner: OwnerId, value: u64, height: u64) -> Transaction {
        let tx = Transaction::new_coinbase(owner, height, Amount::from_u64(value)).unwrap();
        index.apply_transaction(&tx).unwrap();
        tx
    }

    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: AtomicBool,
    }

    impl Storage for FlakyStorage {
        fn get(&self, key: &[u8]) -> ledger_core::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> ledger_core::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CoreError::StorageError("disk full".to_string()));
            }
            self.inner.put(key, value)
        }

        fn delete(&self, key: &[u8]) -> ledger_core::Result<()> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_add_remove_and_not_found() {
        let index = index();
        let owner = OwnerId::from_public_key(b"alice");
        let output = TxOutput::new(Amount::from_u64(5), owner);

        index.add(&output, [1u8; 32], 0).unwrap();
        assert_eq!(index.get_balance(&owner).unwrap(), Amount::from_u64(5));

        let removed = index.remove(&owner, &[1u8; 32], 0).unwrap();
        assert_eq!(removed.kind, UtxoKind::Normal);
        assert_eq!(index.remove(&owner, &[1u8; 32], 0), Err(ConsensusError::UtxoNotFound));
    }

    #[test]
    fn test_contract_outputs_are_classified() {
        let index = index();
        let contract = OwnerId::contract_from_seed(b"counter");
        let output = TxOutput::new(Amount::zero(), contract);

        index.add(&output, [1u8; 32], 0).unwrap();
        index.add(&output, [2u8; 32], 0).unwrap();

        let bucket = index.get_all_for_owner(&contract).unwrap();
        assert_eq!(bucket.get(&[1u8; 32], 0).unwrap().kind, UtxoKind::ContractCreate);
        assert_eq!(bucket.get(&[2u8; 32], 0).unwrap().kind, UtxoKind::ContractInvoke);
        assert_eq!(index.contract_utxos().unwrap().len(), 1);
        assert!(index.contract_create_utxo(&contract).unwrap().is_some());

        index.remove(&contract, &[1u8; 32], 0).unwrap();
        assert!(index.contract_utxos().unwrap().is_empty());
    }

    #[test]
    fn test_apply_transaction_spends_inputs() {
        let index = index();
        let keypair = KeyPair::generate();
        let bob = OwnerId::from_public_key(b"bob");
        fund(&index, keypair.owner(), 10, 1);

        let utxos = index.get_spendable_set(&keypair.owner(), &Amount::from_u64(6)).unwrap();
        let tx = Transaction::new_transfer(
            TransferParams::new(bob, Amount::from_u64(6), Amount::from_u64(1)),
            &utxos,
            &keypair,
        )
        .unwrap();
        index.verify_transaction(&tx).unwrap();
        index.apply_transaction(&tx).unwrap();

        assert_eq!(index.get_balance(&bob).unwrap(), Amount::from_u64(6));
        assert_eq!(index.get_balance(&keypair.owner()).unwrap(), Amount::from_u64(3));

        // Replaying the same spend fails and changes nothing.
        assert_eq!(index.apply_transaction(&tx), Err(ConsensusError::UtxoNotFound));
        assert_eq!(index.get_balance(&bob).unwrap(), Amount::from_u64(6));
    }

    #[test]
    fn test_duplicate_outpoint_in_one_transaction() {
        let index = index();
        let keypair = KeyPair::generate();
        let funding = fund(&index, keypair.owner(), 10, 1);
        let utxo = index.find_utxo(&keypair.owner(), &funding.id, 0).unwrap().unwrap();

        let tx = Transaction::new_transfer(
            TransferParams::new(OwnerId::from_public_key(b"bob"), Amount::from_u64(20), Amount::zero()),
            &[utxo.clone(), utxo],
            &keypair,
        )
        .unwrap();
        assert!(matches!(index.apply_transaction(&tx), Err(ConsensusError::InvalidInput(_))));
        assert_eq!(index.get_balance(&keypair.owner()).unwrap(), Amount::from_u64(10));
    }

    #[test]
    fn test_spendable_set_insufficient_funds() {
        let index = index();
        let owner = OwnerId::from_public_key(b"alice");
        fund(&index, owner, 4, 1);
        fund(&index, owner, 4, 2);

        assert_eq!(index.get_spendable_set(&owner, &Amount::from_u64(5)).unwrap().len(), 2);
        let err = index.get_spendable_set(&owner, &Amount::from_u64(9)).unwrap_err();
        assert_eq!(
            err,
            ConsensusError::InsufficientFunds {
                needed: Amount::from_u64(9),
                available: Amount::from_u64(8),
            }
        );
    }

    #[test]
    fn test_deep_copy_is_isolated() {
        let index = index();
        let owner = OwnerId::from_public_key(b"alice");
        fund(&index, owner, 10, 1);

        let copy = index.deep_copy();
        fund(&copy, owner, 10, 2);

        assert_eq!(index.get_balance(&owner).unwrap(), Amount::from_u64(10));
        assert_eq!(copy.get_balance(&owner).unwrap(), Amount::from_u64(20));
    }

    #[test]
    fn test_replace_with_adopts_staged_copy() {
        let index = index();
        let owner = OwnerId::from_public_key(b"alice");
        fund(&index, owner, 10, 1);

        let staged = index.deep_copy();
        fund(&staged, owner, 5, 2);
        assert_eq!(index.get_balance(&owner).unwrap(), Amount::from_u64(10));

        index.replace_with(staged);
        assert_eq!(index.get_balance(&owner).unwrap(), Amount::from_u64(15));
        assert!(index.has_pending_writes());
    }

    #[test]
    fn test_persist_and_reload() {
        let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let index = UtxoIndex::new(Arc::clone(&store));
        let owner = OwnerId::from_public_key(b"alice");
        let contract = OwnerId::contract_from_seed(b"c");
        fund(&index, owner, 10, 1);
        index.add(&TxOutput::new(Amount::zero(), contract), [3u8; 32], 0).unwrap();
        index.persist().unwrap();
        assert!(!index.has_pending_writes());

        let reloaded = UtxoIndex::new(store);
        assert_eq!(reloaded.get_balance(&owner).unwrap(), Amount::from_u64(10));
        assert_eq!(reloaded.contract_utxos().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_persist_keeps_overlay() {
        let flaky = Arc::new(FlakyStorage::default());
        let index = UtxoIndex::new(flaky.clone());
        let owner = OwnerId::from_public_key(b"alice");
        fund(&index, owner, 10, 1);

        flaky.fail_writes.store(true, Ordering::SeqCst);
        assert!(index.persist().is_err());
        assert!(index.has_pending_writes());
        assert_eq!(index.get_balance(&owner).unwrap(), Amount::from_u64(10));

        flaky.fail_writes.store(false, Ordering::SeqCst);
        index.persist().unwrap();
        let reloaded = UtxoIndex::new(flaky);
        assert_eq!(reloaded.get_balance(&owner).unwrap(), Amount::from_u64(10));
    }

    #[test]
    fn test_persist_evicts_overlay() {
        let index = index();
        let contract = OwnerId::contract_from_seed(b"c");
        for n in 0..50u8 {
            fund(&index, OwnerId::from_public_key(&[n]), 10, u64::from(n));
        }
        index.add(&TxOutput::new(Amount::zero(), contract), [3u8; 32], 0).unwrap();
        assert_eq!(index.cached_owners(), 51);

        index.persist().unwrap();
        assert_eq!(index.cached_owners(), 0);
        assert_eq!(index.deep_copy().cached_owners(), 0);

        // Evicted buckets and the registry read back from the store.
        assert_eq!(index.get_balance(&OwnerId::from_public_key(&[7])).unwrap(), Amount::from_u64(10));
        assert_eq!(index.contract_utxos().unwrap().len(), 1);
        assert_eq!(index.cached_owners(), 1);
    }

    #[test]
    fn test_undo_restores_spent_outputs() {
        let index = index();
        let keypair = KeyPair::generate();
        let bob = OwnerId::from_public_key(b"bob");
        let funding = fund(&index, keypair.owner(), 10, 1);

        let utxos = index.get_spendable_set(&keypair.owner(), &Amount::from_u64(10)).unwrap();
        let tx = Transaction::new_transfer(
            TransferParams::new(bob, Amount::from_u64(10), Amount::zero()),
            &utxos,
            &keypair,
        )
        .unwrap();
        index.apply_transaction(&tx).unwrap();

        let known = vec![funding.clone(), tx.clone()];
        index
            .undo_transactions(&[tx], |id| known.iter().find(|t| &t.id == id).cloned())
            .unwrap();
        assert_eq!(index.get_balance(&keypair.owner()).unwrap(), Amount::from_u64(10));
        assert!(index.get_balance(&bob).unwrap().is_zero());
        assert!(index.find_utxo(&keypair.owner(), &funding.id, 0).unwrap().is_some());
    }
}
