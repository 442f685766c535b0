//! Pending transaction pool
//!
//! Transactions wait here until a producer includes them. The pool is bounded
//! by serialized size and hands transactions out highest tip first, never
//! before the pending transactions they depend on.

use crate::transaction::{Transaction, TxId};
use crate::utxo::UtxoIndex;
use crate::{ConsensusError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use tokio::sync::broadcast;

/// Default number of recently seen transaction ids remembered for relay suppression
pub const DEFAULT_SEEN_CACHE_SIZE: usize = 4096;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Added(TxId),
    Evicted(TxId),
}

#[derive(Debug)]
struct PoolEntry {
    tx: Transaction,
    size: usize,
    seq: u64,
}

/// Whether a pooled transaction can be included right now
#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    /// Every input resolves against the snapshot
    Ready,
    /// Some input is produced by another pooled transaction
    Waiting,
    /// Some input resolves nowhere
    Orphaned,
}

struct PoolState {
    entries: HashMap<TxId, PoolEntry>,
    curr_size: usize,
    next_seq: u64,
    seen: LruCache<TxId, ()>,
}

impl PoolState {
    fn insert(&mut self, tx: Transaction) {
        let size = tx.size();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.curr_size += size;
        self.seen.put(tx.id, ());
        self.entries.insert(tx.id, PoolEntry { tx, size, seq });
    }

    fn take(&mut self, id: &TxId) -> Option<Transaction> {
        let entry = self.entries.remove(id)?;
        self.curr_size -= entry.size;
        Some(entry.tx)
    }

    fn readiness(&self, tx: &Transaction, utxo_index: &UtxoIndex) -> Readiness {
        let mut waiting = false;
        for input in &tx.vin {
            let found = input
                .owner()
                .and_then(|owner| utxo_index.find_utxo(&owner, &input.txid, input.vout));
            match found {
                Ok(Some(_)) => {}
                _ if self.entries.contains_key(&input.txid) => waiting = true,
                _ => return Readiness::Orphaned,
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }
}

/// Size-bounded pool of unconfirmed transactions
pub struct TransactionPool {
    state: Mutex<PoolState>,
    size_limit: usize,
    events: broadcast::Sender<PoolEvent>,
}

impl TransactionPool {
    /// Create a pool holding at most `size_limit` bytes of transactions
    pub fn new(size_limit: usize) -> Self {
        Self::with_seen_cache(size_limit, DEFAULT_SEEN_CACHE_SIZE)
    }

    pub fn with_seen_cache(size_limit: usize, seen_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(seen_cache_size).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                curr_size: 0,
                next_seq: 0,
                seen: LruCache::new(capacity),
            }),
            size_limit,
            events,
        }
    }

    /// Subscribe to added/evicted notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Admit a transaction.
    ///
    /// Transactions already pooled or recently seen are rejected as duplicates,
    /// which also stops them from being relayed again.
    pub fn push(&self, tx: Transaction) -> Result<()> {
        let id = tx.id;
        {
            let mut state = self.state.lock();
            if state.entries.contains_key(&id) || state.seen.contains(&id) {
                return Err(ConsensusError::DuplicateTransaction);
            }
            if state.curr_size + tx.size() > self.size_limit {
                tracing::warn!("Transaction pool full, rejecting {}", hex::encode(id));
                return Err(ConsensusError::TransactionPoolFull);
            }
            state.insert(tx);
        }
        tracing::debug!("Transaction {} added to pool", hex::encode(id));
        self.publish(PoolEvent::Added(id));
        Ok(())
    }

    /// Re-admit transactions taken out for a block that was abandoned or
    /// reverted. Ignores the size budget and the seen cache.
    pub fn rollback(&self, transactions: Vec<Transaction>) {
        let mut readmitted = Vec::new();
        {
            let mut state = self.state.lock();
            for tx in transactions {
                if !tx.tx_type.is_user_submittable() || state.entries.contains_key(&tx.id) {
                    continue;
                }
                readmitted.push(tx.id);
                state.insert(tx);
            }
        }
        if !readmitted.is_empty() {
            tracing::debug!("Rolled {} transactions back into the pool", readmitted.len());
        }
        for id in readmitted {
            self.publish(PoolEvent::Added(id));
        }
    }

    /// Remove and return the highest-tip transaction whose inputs all resolve
    /// against `utxo_index`. Ties go to the earliest admitted transaction.
    ///
    /// Transactions that spend outputs of other pooled transactions are skipped
    /// until those have been applied to the snapshot. A candidate that fails
    /// full verification is evicted and the scan continues.
    pub fn pop_highest_tip_ready(&self, utxo_index: &UtxoIndex) -> Option<Transaction> {
        let mut state = self.state.lock();
        loop {
            let best = state
                .entries
                .values()
                .filter(|entry| state.readiness(&entry.tx, utxo_index) == Readiness::Ready)
                .max_by(|a, b| a.tx.tip.cmp(&b.tx.tip).then(b.seq.cmp(&a.seq)))
                .map(|entry| entry.tx.id)?;

            let tx = state.take(&best)?;
            match utxo_index.verify_transaction(&tx) {
                Ok(()) => return Some(tx),
                Err(e) => {
                    tracing::warn!("Evicting invalid transaction {}: {}", hex::encode(tx.id), e);
                    self.publish(PoolEvent::Evicted(tx.id));
                }
            }
        }
    }

    /// Drop every transaction that can no longer be satisfied by `utxo_index`
    /// or by the outputs of other surviving pool transactions.
    pub fn remove_invalid(&self, utxo_index: &UtxoIndex) -> usize {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            loop {
                let orphaned: Vec<TxId> = state
                    .entries
                    .values()
                    .filter(|entry| state.readiness(&entry.tx, utxo_index) == Readiness::Orphaned)
                    .map(|entry| entry.tx.id)
                    .collect();
                if orphaned.is_empty() {
                    break;
                }
                for id in orphaned {
                    state.take(&id);
                    evicted.push(id);
                }
            }
        }
        for id in &evicted {
            tracing::debug!("Evicted unresolvable transaction {}", hex::encode(id));
            self.publish(PoolEvent::Evicted(*id));
        }
        evicted.len()
    }

    /// Remove transactions that were included in a block
    pub fn remove_confirmed(&self, transactions: &[Transaction]) {
        let mut state = self.state.lock();
        for tx in transactions {
            state.take(&tx.id);
            state.seen.put(tx.id, ());
        }
    }

    /// Whether `txid` is currently pooled
    pub fn contains(&self, txid: &TxId) -> bool {
        self.state.lock().entries.contains_key(txid)
    }

    pub fn get_transaction(&self, txid: &TxId) -> Option<Transaction> {
        self.state.lock().entries.get(txid).map(|e| e.tx.clone())
    }

    /// All pooled transactions in admission order
    pub fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.lock();
        let mut entries: Vec<&PoolEntry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.tx.clone()).collect()
    }

    /// Total serialized size of pooled transactions in bytes
    pub fn size(&self) -> usize {
        self.state.lock().curr_size
    }

    pub fn num_transactions(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Ids of pooled transactions that some other pooled transaction spends from
    pub fn dependency_roots(&self) -> HashSet<TxId> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .flat_map(|e| e.tx.vin.iter().map(|i| i.txid))
            .filter(|id| state.entries.contains_key(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransferParams;
    use ledger_core::{Amount, KeyPair, MemoryStorage, OwnerId, Signer};
    use std::sync::Arc;

    struct Fixture {
        index: UtxoIndex,
        keypair: KeyPair,
    }

    impl Fixture {
        fn new(balance: u64) -> Self {
            let index = UtxoIndex::new(Arc::new(MemoryStorage::new()));
            let keypair = KeyPair::generate();
            let coinbase = Transaction::new_coinbase(keypair.owner(), 1, Amount::from_u64(balance)).unwrap();
            index.apply_transaction(&coinbase).unwrap();
            Self { index, keypair }
        }

        fn spend_all(&self, to: OwnerId, tip: u64) -> Transaction {
            let utxos = self.index.get_all_for_owner(&self.keypair.owner()).unwrap();
            let utxos: Vec<_> = utxos.iter().cloned().collect();
            let total: Amount = utxos.iter().map(|u| &u.value).sum();
            let amount = total.sub(&Amount::from_u64(tip)).unwrap();
            Transaction::new_transfer(TransferParams::new(to, amount, Amount::from_u64(tip)), &utxos, &self.keypair)
                .unwrap()
        }
    }

    /// Spend output 0 of `parent` (owned by `keypair`) entirely, paying `tip`
    fn chained(parent: &Transaction, keypair: &KeyPair, to: OwnerId, tip: u64) -> Transaction {
        let utxo = crate::utxo::Utxo::new(&parent.vout[0], parent.id, 0, crate::utxo::UtxoKind::Normal);
        let amount = utxo.value.sub(&Amount::from_u64(tip)).unwrap();
        Transaction::new_transfer(TransferParams::new(to, amount, Amount::from_u64(tip)), &[utxo], keypair).unwrap()
    }

    #[test]
    fn test_push_duplicate_and_full() {
        let fx = Fixture::new(10);
        let tx = fx.spend_all(OwnerId::from_public_key(b"bob"), 1);

        let pool = TransactionPool::new(tx.size());
        pool.push(tx.clone()).unwrap();
        assert_eq!(pool.push(tx.clone()), Err(ConsensusError::DuplicateTransaction));
        assert_eq!(pool.num_transactions(), 1);
        assert_eq!(pool.size(), tx.size());

        let other = Fixture::new(20).spend_all(OwnerId::from_public_key(b"bob"), 1);
        assert_eq!(pool.push(other), Err(ConsensusError::TransactionPoolFull));
    }

    #[test]
    fn test_seen_cache_blocks_repeat_after_confirmation() {
        let fx = Fixture::new(10);
        let tx = fx.spend_all(OwnerId::from_public_key(b"bob"), 1);
        let pool = TransactionPool::new(1 << 20);
        pool.push(tx.clone()).unwrap();
        pool.remove_confirmed(&[tx.clone()]);
        assert!(pool.is_empty());
        assert_eq!(pool.push(tx), Err(ConsensusError::DuplicateTransaction));
    }

    #[test]
    fn test_highest_tip_first_ties_by_insertion() {
        let a = Fixture::new(10);
        let b = Fixture::new(10);
        let c = Fixture::new(10);
        let index = UtxoIndex::new(Arc::new(MemoryStorage::new()));
        for fx in [&a, &b, &c] {
            for utxo in fx.index.get_all_for_owner(&fx.keypair.owner()).unwrap().iter() {
                let output = crate::transaction::TxOutput::new(utxo.value.clone(), utxo.owner);
                index.add(&output, utxo.txid, utxo.tx_index).unwrap();
            }
        }
        let bob = OwnerId::from_public_key(b"bob");
        let low = a.spend_all(bob, 1);
        let high_first = b.spend_all(bob, 5);
        let high_second = c.spend_all(bob, 5);

        let pool = TransactionPool::new(1 << 20);
        pool.push(low.clone()).unwrap();
        pool.push(high_first.clone()).unwrap();
        pool.push(high_second.clone()).unwrap();

        assert_eq!(pool.pop_highest_tip_ready(&index).unwrap().id, high_first.id);
        assert_eq!(pool.pop_highest_tip_ready(&index).unwrap().id, high_second.id);
        assert_eq!(pool.pop_highest_tip_ready(&index).unwrap().id, low.id);
        assert!(pool.pop_highest_tip_ready(&index).is_none());
    }

    #[test]
    fn test_dependency_chain_pops_in_order() {
        let fx = Fixture::new(100);
        let owner = fx.keypair.owner();
        let a = fx.spend_all(owner, 1);
        let b = chained(&a, &fx.keypair, owner, 2);
        let c = chained(&b, &fx.keypair, owner, 3);

        let pool = TransactionPool::new(1 << 20);
        pool.push(c.clone()).unwrap();
        pool.push(b.clone()).unwrap();
        pool.push(a.clone()).unwrap();
        assert_eq!(pool.dependency_roots().len(), 2);

        let mut order = Vec::new();
        while let Some(tx) = pool.pop_highest_tip_ready(&fx.index) {
            fx.index.apply_transaction(&tx).unwrap();
            order.push(tx.id);
        }
        assert_eq!(order, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_remove_invalid_keeps_resolvable_dependents() {
        let fx = Fixture::new(100);
        let owner = fx.keypair.owner();
        let a = fx.spend_all(owner, 1);
        let b = chained(&a, &fx.keypair, owner, 1);
        let pool = TransactionPool::new(1 << 20);
        pool.push(a.clone()).unwrap();
        pool.push(b.clone()).unwrap();

        assert_eq!(pool.remove_invalid(&fx.index), 0);

        // Something else spends a's input: a and then b become unresolvable.
        let conflicting = fx.spend_all(OwnerId::from_public_key(b"carol"), 0);
        fx.index.apply_transaction(&conflicting).unwrap();
        assert_eq!(pool.remove_invalid(&fx.index), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_rollback_bypasses_limits_and_emits_events() {
        let fx = Fixture::new(10);
        let tx = fx.spend_all(OwnerId::from_public_key(b"bob"), 1);
        let pool = TransactionPool::new(0);
        let mut events = pool.subscribe();

        assert_eq!(pool.push(tx.clone()), Err(ConsensusError::TransactionPoolFull));
        pool.rollback(vec![tx.clone()]);
        assert_eq!(pool.num_transactions(), 1);
        assert_eq!(events.try_recv().unwrap(), PoolEvent::Added(tx.id));

        let coinbase = Transaction::new_coinbase(fx.keypair.owner(), 9, Amount::from_u64(1)).unwrap();
        pool.rollback(vec![coinbase]);
        assert_eq!(pool.num_transactions(), 1);
    }

    #[test]
    fn test_concurrent_pops_never_return_the_same_transaction() {
        let fx = Arc::new(Fixture::new(10));
        let pool = Arc::new(TransactionPool::new(1 << 20));
        pool.push(fx.spend_all(OwnerId::from_public_key(b"bob"), 1)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let fx = Arc::clone(&fx);
                std::thread::spawn(move || pool.pop_highest_tip_ready(&fx.index).is_some())
            })
            .collect();
        let popped = handles.into_iter().map(|h| h.join().unwrap()).filter(|p| *p).count();
        assert_eq!(popped, 1);
    }
}
