//! Blocks and the canonical chain
//!
//! Every known block lives in an arena keyed by its hash; parents are referred
//! to by hash only. The canonical chain is the list of hashes from genesis to
//! the tail, and the UTXO index always reflects exactly that chain.

use crate::contract::{execute_transaction, gas_payouts, ContractExecutor, NoopExecutor};
use crate::transaction::{Transaction, TransactionType, TxId};
use crate::utxo::UtxoIndex;
use crate::{BlockHeight, ConsensusError, Result};
use ledger_core::{hash, verify_signature, Amount, Hash, OwnerId, Storage};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const BLOCK_KEY_PREFIX: &[u8] = b"block/";
const TAIL_KEY: &[u8] = b"tail";
const LIB_KEY: &[u8] = b"lib";

/// How far ahead of the local clock a block timestamp may be
pub const MAX_FUTURE_DRIFT_SECS: u64 = 300;

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block height (0 for genesis block)
    pub height: BlockHeight,

    /// Hash of the parent block
    pub prev_hash: Hash,

    /// Merkle root of the transaction ids
    pub merkle_root: Hash,

    /// Unix time in seconds; for scheduled production, the slot start
    pub timestamp: u64,

    /// Who produced the block and receives its coinbase
    pub producer: OwnerId,

    /// Public key matching `signature`, empty for unsigned blocks
    pub producer_pub_key: Vec<u8>,

    /// Proof-of-work nonce, zero otherwise
    pub nonce: u64,

    pub hash: Hash,

    /// Producer signature over `hash`
    pub signature: Vec<u8>,
}

/// The fields covered by the block hash
#[derive(Serialize)]
struct HashableHeader<'a> {
    height: BlockHeight,
    prev_hash: &'a Hash,
    merkle_root: &'a Hash,
    timestamp: u64,
    producer: &'a OwnerId,
    producer_pub_key: &'a [u8],
    nonce: u64,
}

/// A block of transactions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create an unsealed block on top of `parent`
    pub fn new(transactions: Vec<Transaction>, parent: &Block, producer: OwnerId, timestamp: u64) -> Result<Self> {
        let mut block = Block {
            header: BlockHeader {
                height: parent.header.height + 1,
                prev_hash: parent.header.hash,
                merkle_root: Self::calculate_merkle_root(&transactions),
                timestamp,
                producer,
                producer_pub_key: Vec::new(),
                nonce: 0,
                hash: [0u8; 32],
                signature: Vec::new(),
            },
            transactions,
        };
        block.header.hash = block.compute_hash()?;
        Ok(block)
    }

    /// Deterministic genesis block paying the initial allocations
    pub fn genesis(allocations: &[(OwnerId, Amount)]) -> Result<Self> {
        let transactions = if allocations.is_empty() {
            Vec::new()
        } else {
            vec![Transaction::new_reward(0, allocations)?]
        };
        let mut block = Block {
            header: BlockHeader {
                height: 0,
                prev_hash: [0u8; 32],
                merkle_root: Self::calculate_merkle_root(&transactions),
                timestamp: 0,
                producer: OwnerId::User([0u8; 20]),
                producer_pub_key: Vec::new(),
                nonce: 0,
                hash: [0u8; 32],
                signature: Vec::new(),
            },
            transactions,
        };
        block.header.hash = block.compute_hash()?;
        Ok(block)
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn height(&self) -> BlockHeight {
        self.header.height
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0
    }

    /// Hash of the header as if it carried `nonce`
    pub fn hash_with_nonce(&self, nonce: u64) -> Result<Hash> {
        let header = HashableHeader {
            height: self.header.height,
            prev_hash: &self.header.prev_hash,
            merkle_root: &self.header.merkle_root,
            timestamp: self.header.timestamp,
            producer: &self.header.producer,
            producer_pub_key: &self.header.producer_pub_key,
            nonce,
        };
        Ok(hash(&bincode::serialize(&header)?))
    }

    pub fn compute_hash(&self) -> Result<Hash> {
        self.hash_with_nonce(self.header.nonce)
    }

    /// Stored hash and merkle root both match the contents
    pub fn verify_hash(&self) -> bool {
        self.header.merkle_root == Self::calculate_merkle_root(&self.transactions)
            && self.compute_hash().map_or(false, |h| h == self.header.hash)
    }

    /// The signature is valid and made by the declared producer
    pub fn verify_signature(&self) -> bool {
        !self.header.signature.is_empty()
            && OwnerId::from_public_key(&self.header.producer_pub_key) == self.header.producer
            && verify_signature(&self.header.producer_pub_key, &self.header.hash, &self.header.signature)
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.is_coinbase())
    }

    /// Check linkage to `parent` and internal consistency
    pub fn validate_structure(&self, parent: &Block) -> Result<()> {
        if self.header.height != parent.header.height + 1 {
            return Err(ConsensusError::InvalidBlock(format!(
                "Invalid height: expected {}, got {}",
                parent.header.height + 1,
                self.header.height
            )));
        }
        if self.header.prev_hash != parent.header.hash {
            return Err(ConsensusError::InvalidBlock("Invalid previous hash".to_string()));
        }
        if self.header.timestamp < parent.header.timestamp {
            return Err(ConsensusError::InvalidBlock("Timestamp precedes parent".to_string()));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ConsensusError::InvalidBlock(format!("Time error: {}", e)))?
            .as_secs();
        if self.header.timestamp > now + MAX_FUTURE_DRIFT_SECS {
            return Err(ConsensusError::InvalidBlock("Block timestamp too far in future".to_string()));
        }
        if !self.verify_hash() {
            return Err(ConsensusError::InvalidBlock("Hash does not match contents".to_string()));
        }
        Ok(())
    }

    /// Calculate merkle root of transaction ids
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return [0u8; 32];
        }

        let mut hashes: Vec<Hash> = transactions.iter().map(|tx| tx.id).collect();

        // Build merkle tree bottom-up
        while hashes.len() > 1 {
            let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

            for chunk in hashes.chunks(2) {
                let mut hasher = Sha3_256::new();
                hasher.update(chunk[0]);

                // Handle odd number of hashes by duplicating last hash
                if chunk.len() == 2 {
                    hasher.update(chunk[1]);
                } else {
                    hasher.update(chunk[0]);
                }

                next_level.push(hasher.finalize().into());
            }

            hashes = next_level;
        }

        hashes[0]
    }
}

fn block_key(hash: &Hash) -> Vec<u8> {
    let mut key = BLOCK_KEY_PREFIX.to_vec();
    key.extend_from_slice(hash);
    key
}

fn load_block(store: &dyn Storage, hash: &Hash) -> Result<Block> {
    let bytes = store
        .get(&block_key(hash))?
        .ok_or_else(|| ConsensusError::InvariantViolation(format!("block {} missing from store", hex::encode(hash))))?;
    Ok(bincode::deserialize(&bytes)?)
}

fn read_hash(store: &dyn Storage, key: &[u8]) -> Result<Option<Hash>> {
    match store.get(key)? {
        Some(bytes) => Hash::try_from(bytes.as_slice())
            .map(Some)
            .map_err(|_| ConsensusError::InvariantViolation(format!("corrupt {} pointer", String::from_utf8_lossy(key)))),
        None => Ok(None),
    }
}

/// Canonical chain, known forks and the ledger state of the tail
pub struct Blockchain {
    /// Every known block, canonical or not
    blocks: HashMap<Hash, Block>,

    /// Canonical hashes indexed by height; never empty
    canonical: Vec<Hash>,

    /// Location of every canonical transaction
    tx_index: HashMap<TxId, (BlockHeight, usize)>,

    /// Last irreversible block
    lib: Hash,

    utxo: UtxoIndex,
    store: Arc<dyn Storage>,
    subsidy: Amount,

    /// Re-runs contract transactions of peer blocks
    executor: Arc<dyn ContractExecutor>,
}

impl Blockchain {
    /// Open the chain stored in `store`, or start a new one from `genesis`
    pub fn new(genesis: Block, store: Arc<dyn Storage>, subsidy: Amount) -> Result<Self> {
        let mut chain = Blockchain {
            blocks: HashMap::new(),
            canonical: Vec::new(),
            tx_index: HashMap::new(),
            lib: genesis.hash(),
            utxo: UtxoIndex::new(Arc::clone(&store)),
            store,
            subsidy,
            executor: Arc::new(NoopExecutor),
        };

        match read_hash(chain.store.as_ref(), TAIL_KEY)? {
            Some(tail) => chain.reload(tail, &genesis)?,
            None => chain.init_genesis(genesis)?,
        }
        Ok(chain)
    }

    /// Verify contract transactions with `executor` instead of the no-op one
    pub fn with_executor(mut self, executor: Arc<dyn ContractExecutor>) -> Self {
        self.executor = executor;
        self
    }

    fn init_genesis(&mut self, genesis: Block) -> Result<()> {
        self.utxo.apply_block(&genesis.transactions)?;
        self.store.put(&block_key(&genesis.hash()), &bincode::serialize(&genesis)?)?;
        self.utxo.persist()?;
        self.store.put(TAIL_KEY, &genesis.hash())?;
        self.store.put(LIB_KEY, &genesis.hash())?;
        tracing::info!("Initialized chain with genesis {}", hex::encode(genesis.hash()));
        self.index_canonical(genesis);
        Ok(())
    }

    fn reload(&mut self, tail: Hash, genesis: &Block) -> Result<()> {
        let mut chain = Vec::new();
        let mut cursor = tail;
        loop {
            let block = load_block(self.store.as_ref(), &cursor)?;
            cursor = block.header.prev_hash;
            let done = block.is_genesis();
            chain.push(block);
            if done {
                break;
            }
        }
        chain.reverse();
        if chain[0].hash() != genesis.hash() {
            return Err(ConsensusError::InvalidBlock("Stored chain has a different genesis".to_string()));
        }
        for block in chain {
            self.index_canonical(block);
        }
        if let Some(lib) = read_hash(self.store.as_ref(), LIB_KEY)? {
            if self.is_canonical(&lib) {
                self.lib = lib;
            }
        }
        tracing::info!("Loaded chain at height {}", self.tail_height());
        Ok(())
    }

    fn index_canonical(&mut self, block: Block) {
        let height = block.height();
        for (position, tx) in block.transactions.iter().enumerate() {
            self.tx_index.insert(tx.id, (height, position));
        }
        self.canonical.push(block.hash());
        self.blocks.insert(block.hash(), block);
    }

    pub fn tail_hash(&self) -> Hash {
        self.canonical[self.canonical.len() - 1]
    }

    pub fn tail_block(&self) -> &Block {
        &self.blocks[&self.tail_hash()]
    }

    pub fn tail_height(&self) -> BlockHeight {
        self.tail_block().height()
    }

    /// Any known block, canonical or on a fork
    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Canonical block at `height`
    pub fn block_by_height(&self, height: BlockHeight) -> Option<&Block> {
        let index = usize::try_from(height).ok()?;
        self.canonical.get(index).and_then(|h| self.blocks.get(h))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn is_canonical(&self, hash: &Hash) -> bool {
        self.blocks
            .get(hash)
            .and_then(|b| self.block_by_height(b.height()))
            .map_or(false, |b| &b.hash() == hash)
    }

    pub fn lib_block(&self) -> &Block {
        &self.blocks[&self.lib]
    }

    pub fn lib_height(&self) -> BlockHeight {
        self.lib_block().height()
    }

    pub fn utxo_index(&self) -> &UtxoIndex {
        &self.utxo
    }

    pub fn subsidy(&self) -> &Amount {
        &self.subsidy
    }

    pub fn get_balance(&self, owner: &OwnerId) -> Result<Amount> {
        self.utxo.get_balance(owner)
    }

    /// A transaction on the canonical chain
    pub fn find_transaction(&self, id: &TxId) -> Option<Transaction> {
        let (height, position) = self.tx_index.get(id)?;
        self.block_by_height(*height)?.transactions.get(*position).cloned()
    }

    /// Exactly one coinbase worth the subsidy plus every included tip
    pub fn check_block_value(&self, block: &Block) -> Result<()> {
        let coinbases: Vec<&Transaction> = block.transactions.iter().filter(|tx| tx.is_coinbase()).collect();
        let [coinbase] = coinbases.as_slice() else {
            return Err(ConsensusError::InvalidBlock(format!(
                "expected one coinbase, found {}",
                coinbases.len()
            )));
        };
        let tips: Amount = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_special())
            .map(|tx| &tx.tip)
            .sum();
        let expected = self.subsidy.add(&tips);
        if coinbase.total_output() != expected {
            return Err(ConsensusError::InvalidBlock(format!(
                "coinbase pays {}, expected {}",
                coinbase.total_output(),
                expected
            )));
        }

        // Gas reward plus change hands back exactly the reserved gas.
        let reserved: Amount = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_special())
            .map(|tx| tx.gas_limit.mul(&tx.gas_price))
            .sum();
        let paid: Amount = block
            .transactions
            .iter()
            .filter(|tx| matches!(tx.tx_type, TransactionType::GasReward | TransactionType::GasChange))
            .map(Transaction::total_output)
            .sum();
        if paid != reserved {
            return Err(ConsensusError::InvalidBlock(format!(
                "gas payouts of {} do not match the {} reserved",
                paid, reserved
            )));
        }
        Ok(())
    }

    /// Replay `block` on `working` the way a producer builds it.
    ///
    /// Every user transaction must be followed by exactly the gas payouts and
    /// contract-generated transactions that running it again yields, and the
    /// coinbase comes last. Payouts and contract sends anywhere else are
    /// rejected.
    fn apply_block_to(&self, block: &Block, working: &UtxoIndex) -> Result<()> {
        self.check_block_value(block)?;
        let parent = self
            .blocks
            .get(&block.header.prev_hash)
            .ok_or_else(|| ConsensusError::InvalidBlock("unknown parent".to_string()))?;
        let height = block.height();
        let mut seq = 0u32;
        let mut cursor = 0;

        while let Some(tx) = block.transactions.get(cursor) {
            cursor += 1;
            if tx.is_coinbase() {
                if cursor != block.transactions.len() {
                    return Err(ConsensusError::InvalidBlock("coinbase is not the last transaction".to_string()));
                }
                working.apply_transaction(tx)?;
                continue;
            }
            if !tx.tx_type.is_user_submittable() {
                return Err(ConsensusError::InvalidBlock(format!(
                    "{:?} transaction {} has no originating transaction",
                    tx.tx_type,
                    hex::encode(tx.id)
                )));
            }

            working.verify_transaction(tx)?;
            let (gas_used, generated) = if tx.is_contract() {
                let result = execute_transaction(self.executor.as_ref(), tx, working, height, parent.header.timestamp)?;
                (result.gas_used, result.generated)
            } else {
                working.apply_transaction(tx)?;
                (0, Vec::new())
            };

            let mut expected = gas_payouts(block.header.producer, tx, height, gas_used, &mut seq)?;
            expected.extend(generated);
            for want in expected {
                if block.transactions.get(cursor) != Some(&want) {
                    return Err(ConsensusError::InvalidBlock(format!(
                        "transactions after {} do not match its execution",
                        hex::encode(tx.id)
                    )));
                }
                cursor += 1;
                working.verify_transaction(&want)?;
                working.apply_transaction(&want)?;
            }
        }
        Ok(())
    }

    fn store_block(&self, block: &Block) -> Result<()> {
        self.store.put(&block_key(&block.hash()), &bincode::serialize(block)?)?;
        Ok(())
    }

    /// Append a peer block on top of the tail after full verification
    pub fn extend(&mut self, block: Block) -> Result<()> {
        block.validate_structure(self.tail_block())?;
        let working = self.utxo.deep_copy();
        self.apply_block_to(&block, &working)?;
        self.commit_block(block, working)
    }

    /// Adopt a block built on the tail together with the UTXO state it leads
    /// to. The state must have been derived from the current tail.
    pub fn commit_block(&mut self, block: Block, utxo: UtxoIndex) -> Result<()> {
        let tail = self.tail_block();
        if block.header.prev_hash != tail.hash() || block.height() != tail.height() + 1 {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {} does not extend the tail",
                hex::encode(block.hash())
            )));
        }
        self.store_block(&block)?;
        utxo.persist()?;
        self.store.put(TAIL_KEY, &block.hash())?;

        tracing::info!("Block {} appended at height {}", hex::encode(block.hash()), block.height());
        self.utxo = utxo;
        self.index_canonical(block);
        Ok(())
    }

    /// Remember a block that does not extend the tail. Its parent must be known.
    pub fn add_fork_block(&mut self, block: Block) -> Result<()> {
        let parent = self
            .blocks
            .get(&block.header.prev_hash)
            .ok_or_else(|| ConsensusError::InvalidBlock("unknown parent".to_string()))?;
        block.validate_structure(parent)?;
        self.store_block(&block)?;
        tracing::debug!("Stored fork block {} at height {}", hex::encode(block.hash()), block.height());
        self.blocks.insert(block.hash(), block);
        Ok(())
    }

    /// Non-canonical blocks from the fork point up to `head`, in height order,
    /// plus the canonical ancestor they branch from
    pub fn fork_branch(&self, head: &Hash) -> Option<(Vec<Hash>, Hash)> {
        let mut branch = Vec::new();
        let mut cursor = *head;
        while !self.is_canonical(&cursor) {
            let block = self.blocks.get(&cursor)?;
            branch.push(cursor);
            cursor = block.header.prev_hash;
        }
        branch.reverse();
        Some((branch, cursor))
    }

    /// Switch the canonical chain to the branch ending at `head`.
    ///
    /// The UTXO state is rebuilt from the common ancestor on a private copy and
    /// only swapped in once every branch block has applied. Returns the user
    /// transactions of the reverted blocks that the new branch does not carry.
    pub fn reorganize(&mut self, head: &Hash) -> Result<Vec<Transaction>> {
        let (branch, ancestor) = self
            .fork_branch(head)
            .ok_or_else(|| ConsensusError::InvalidBlock("branch does not reach the canonical chain".to_string()))?;
        let ancestor_height = self.blocks[&ancestor].height();
        if ancestor_height < self.lib_height() {
            return Err(ConsensusError::InvalidBlock(format!(
                "fork at height {} would revert irreversible block {}",
                ancestor_height,
                self.lib_height()
            )));
        }

        let working = self.utxo.deep_copy();
        let reverted: Vec<Hash> = self.canonical[usize::try_from(ancestor_height + 1).unwrap_or(usize::MAX)..]
            .iter()
            .rev()
            .copied()
            .collect();
        for hash in &reverted {
            let block = &self.blocks[hash];
            working.undo_transactions(&block.transactions, |id| self.find_transaction(id))?;
        }
        for hash in &branch {
            self.apply_block_to(&self.blocks[hash], &working)?;
        }
        working.persist()?;
        self.store.put(TAIL_KEY, head)?;

        let adopted: HashSet<TxId> = branch
            .iter()
            .flat_map(|h| self.blocks[h].transactions.iter().map(|tx| tx.id))
            .collect();
        let mut orphaned = Vec::new();
        for hash in reverted.iter().rev() {
            for tx in &self.blocks[hash].transactions {
                self.tx_index.remove(&tx.id);
                if tx.tx_type.is_user_submittable() && !adopted.contains(&tx.id) {
                    orphaned.push(tx.clone());
                }
            }
        }

        self.canonical.truncate(usize::try_from(ancestor_height + 1).unwrap_or(usize::MAX));
        for hash in &branch {
            let block = self.blocks[hash].clone();
            self.index_canonical(block);
        }
        self.utxo = working;

        tracing::warn!(
            "Switched to fork at height {}: reverted {} blocks, applied {}, {} transactions orphaned",
            ancestor_height,
            reverted.len(),
            branch.len(),
            orphaned.len()
        );
        Ok(orphaned)
    }

    /// Advance the last irreversible block to the highest canonical block that
    /// at least `quorum` distinct producers have built on. Returns the new
    /// height when it moved.
    pub fn update_lib(&mut self, quorum: usize) -> Result<Option<BlockHeight>> {
        let lib_height = self.lib_height();
        let tail_height = self.tail_height();
        let mut builders = HashSet::new();
        let mut candidate = tail_height;
        while candidate > lib_height {
            // `builders` holds the producers of every block above `candidate - 1`.
            let Some(block) = self.block_by_height(candidate) else {
                break;
            };
            builders.insert(block.header.producer);
            candidate -= 1;
            if builders.len() >= quorum {
                break;
            }
        }
        if builders.len() < quorum || candidate <= lib_height {
            return Ok(None);
        }
        let Some(new_lib) = self.block_by_height(candidate).map(Block::hash) else {
            return Ok(None);
        };
        self.store.put(LIB_KEY, &new_lib)?;
        self.lib = new_lib;
        tracing::info!("Last irreversible block advanced to height {}", candidate);
        let pruned = self.prune_dead_forks()?;
        if pruned > 0 {
            tracing::debug!("Pruned {} fork blocks below the irreversible block", pruned);
        }
        Ok(Some(candidate))
    }

    /// Drop fork blocks that can no longer become canonical: those branching
    /// off below the LIB, or whose branch no longer reaches the chain.
    fn prune_dead_forks(&mut self) -> Result<usize> {
        let lib_height = self.lib_height();
        let dead: Vec<Hash> = self
            .blocks
            .keys()
            .filter(|hash| !self.is_canonical(hash))
            .filter(|hash| {
                self.fork_branch(hash)
                    .map_or(true, |(_, ancestor)| self.blocks[&ancestor].height() < lib_height)
            })
            .copied()
            .collect();
        for hash in &dead {
            self.store.delete(&block_key(hash))?;
            self.blocks.remove(hash);
        }
        Ok(dead.len())
    }

    /// Blocks held in memory, canonical and fork
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
