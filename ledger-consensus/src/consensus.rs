//! Consensus driver
//!
//! The [`ConsensusEngine`] owns the chain, the pool and the sealing strategy.
//! Timer ticks start production when it is our turn, inbound blocks are
//! validated and either extend the tail, switch forks, or trigger a sync.

use crate::chain::{Block, Blockchain};
use crate::config::{ConsensusKind, NodeConfig};
use crate::contract::ContractExecutor;
use crate::dynasty::Dynasty;
use crate::network::{NetService, NetworkMessage};
use crate::producer::{BlockProducer, ProductionOutcome, ProductionTask};
use crate::proof::{Dpos, ProofEngine, ProofOfWork};
use crate::transaction::Transaction;
use crate::txpool::TransactionPool;
use crate::utxo::{Utxo, UtxoKind};
use crate::{constants, BlockHeight, ConsensusError, Result};
use ledger_core::{Amount, Hash, OwnerId, Signer, Storage};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusState {
    Idle,
    Producing { height: BlockHeight },
    Syncing { since: Instant },
}

/// What happened to an inbound block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDisposition {
    /// Already known
    Known,
    /// Appended to the tail
    Extended,
    /// Made a competing branch canonical
    Reorganized,
    /// Kept on a branch that is not longer than ours
    StoredFork,
    /// Parent unknown; a sync was requested
    Orphan,
}

/// Driver tuning
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Distinct producers needed on top of a block to make it irreversible;
    /// `None` disables the LIB
    pub lib_quorum: Option<usize>,
    pub sync_timeout: Duration,
    /// Assembly deadline per block
    pub production_deadline: Option<Duration>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            lib_quorum: None,
            sync_timeout: Duration::from_secs(30),
            production_deadline: None,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub struct ConsensusEngine {
    chain: Arc<RwLock<Blockchain>>,
    pool: Arc<TransactionPool>,
    proof: Arc<dyn ProofEngine>,
    /// Absent on nodes that only validate
    producer: Option<Arc<BlockProducer>>,
    network: Arc<dyn NetService>,
    settings: DriverSettings,

    state: Mutex<ConsensusState>,
    running: AtomicBool,
    task: Mutex<Option<ProductionTask>>,
    /// Timestamp of the last production attempt, so one slot is tried once
    last_attempt: Mutex<Option<u64>>,
}

impl ConsensusEngine {
    pub fn new(
        chain: Arc<RwLock<Blockchain>>,
        pool: Arc<TransactionPool>,
        proof: Arc<dyn ProofEngine>,
        producer: Option<Arc<BlockProducer>>,
        network: Arc<dyn NetService>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            chain,
            pool,
            proof,
            producer,
            network,
            settings,
            state: Mutex::new(ConsensusState::Idle),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
            last_attempt: Mutex::new(None),
        }
    }

    /// Wire up a complete engine from configuration
    pub fn from_config(
        config: &NodeConfig,
        store: Arc<dyn Storage>,
        network: Arc<dyn NetService>,
        executor: Arc<dyn ContractExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let genesis = Block::genesis(&config.genesis.allocations()?)?;
        let chain = Blockchain::new(genesis, store, config.producer.subsidy_amount()?)?
            .with_executor(Arc::clone(&executor));
        let chain = Arc::new(RwLock::new(chain));
        let pool = Arc::new(TransactionPool::with_seen_cache(
            config.pool.size_limit,
            config.pool.seen_cache_size,
        ));
        let keypair = config.producer.keypair()?.map(Arc::new);

        let consensus = &config.consensus;
        let (proof, lib_quorum): (Arc<dyn ProofEngine>, Option<usize>) = match consensus.kind {
            ConsensusKind::Pow => {
                let mut pow = ProofOfWork::new(consensus.target_bits);
                if let Some(keypair) = &keypair {
                    pow = pow.with_signer(keypair.clone());
                }
                (Arc::new(pow), None)
            }
            ConsensusKind::Dpos => {
                let mut dynasty = Dynasty::new(consensus.max_producers, consensus.slice_secs);
                dynasty.add_producers(consensus.producer_ids()?);
                let quorum = dynasty.quorum(consensus.lib_quorum_numerator, consensus.lib_quorum_denominator);
                let mut dpos = Dpos::new(dynasty);
                if let Some(keypair) = &keypair {
                    dpos = dpos.with_signer(keypair.clone());
                }
                (Arc::new(dpos), Some(quorum))
            }
        };

        let producer = keypair.map(|keypair| {
            let owner = keypair.owner();
            Arc::new(
                BlockProducer::new(chain.clone(), pool.clone(), executor, owner)
                    .with_block_size_limit(config.producer.block_size_limit),
            )
        });

        let settings = DriverSettings {
            lib_quorum,
            sync_timeout: Duration::from_secs(consensus.sync_timeout_secs),
            production_deadline: config.producer.deadline(),
        };
        tracing::info!(
            "Consensus engine configured: {}, LIB quorum {:?}, producing: {}",
            proof.name(),
            lib_quorum,
            producer.is_some()
        );
        Ok(Self::new(chain, pool, proof, producer, network, settings))
    }

    pub fn chain(&self) -> &Arc<RwLock<Blockchain>> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    pub fn state(&self) -> ConsensusState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_balance(&self, owner: &OwnerId) -> Result<Amount> {
        self.chain.read().get_balance(owner)
    }

    pub fn tail_height(&self) -> BlockHeight {
        self.chain.read().tail_height()
    }

    pub fn block_by_height(&self, height: BlockHeight) -> Option<Block> {
        self.chain.read().block_by_height(height).cloned()
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.chain.read().block_by_hash(hash).cloned()
    }

    pub fn last_irreversible_block(&self) -> Block {
        self.chain.read().lib_block().clone()
    }

    /// Allow production. Starting a running engine does nothing.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Consensus engine started ({})", self.proof.name());
        }
    }

    /// Stop production, cancelling and waiting for any attempt in flight.
    /// Stopping a stopped engine does nothing.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel();
            if let ProductionOutcome::Sealed(ctx) = task.outcome().await {
                ctx.rollback(&self.pool);
            }
        }
        self.set_state(ConsensusState::Idle);
        tracing::info!("Consensus engine stopped");
    }

    fn set_state(&self, state: ConsensusState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Consensus state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Timer tick: collect a finished production, expire a stale sync, and
    /// start producing if it is our turn at `now`
    pub fn tick(&self, now: u64) {
        self.poll_production();

        if let ConsensusState::Syncing { since } = self.state() {
            if since.elapsed() < self.settings.sync_timeout {
                return;
            }
            tracing::warn!("Sync timed out, resuming");
            self.set_state(ConsensusState::Idle);
        }

        if let Some(task) = self.begin_production(now) {
            *self.task.lock() = Some(task);
        }
    }

    fn begin_production(&self, now: u64) -> Option<ProductionTask> {
        if !self.is_running() || self.state() != ConsensusState::Idle {
            return None;
        }
        let producer = self.producer.as_ref()?;
        if !self.proof.is_turn(&producer.beneficiary(), now) {
            return None;
        }
        {
            let mut last = self.last_attempt.lock();
            if *last == Some(now) {
                return None;
            }
            *last = Some(now);
        }

        let height = self.tail_height() + 1;
        tracing::info!("Our turn to produce block {} at {}", height, now);
        self.set_state(ConsensusState::Producing { height });
        Some(ProductionTask::spawn(
            producer.clone(),
            self.proof.clone(),
            now,
            self.settings.production_deadline,
        ))
    }

    /// Adopt the result of a finished production task, if any
    pub fn poll_production(&self) -> Option<Block> {
        let outcome = {
            let mut task = self.task.lock();
            let outcome = task.as_mut()?.try_outcome()?;
            *task = None;
            outcome
        };
        self.finish_production(outcome)
    }

    /// Produce at `now` and wait for the result
    pub async fn produce_once(&self, now: u64) -> Option<Block> {
        let task = self.begin_production(now)?;
        let outcome = task.outcome().await;
        self.finish_production(outcome)
    }

    fn finish_production(&self, outcome: ProductionOutcome) -> Option<Block> {
        let adopted = match outcome {
            ProductionOutcome::Sealed(ctx) => self.adopt_own_block(*ctx),
            ProductionOutcome::Interrupted => {
                tracing::info!("Block production interrupted");
                None
            }
            ProductionOutcome::Failed(reason) => {
                tracing::warn!("Block production failed: {}", reason);
                None
            }
        };
        if matches!(self.state(), ConsensusState::Producing { .. }) {
            self.set_state(ConsensusState::Idle);
        }
        adopted
    }

    fn adopt_own_block(&self, ctx: crate::producer::BlockContext) -> Option<Block> {
        let block = ctx.block.clone();
        if !self.proof.validate(&block) {
            tracing::error!("Produced block {} failed validation", hex::encode(block.hash()));
            ctx.rollback(&self.pool);
            return None;
        }

        let mut chain = self.chain.write();
        if block.header.prev_hash != chain.tail_hash() {
            tracing::info!("Discarding stale block {}: the tail moved", hex::encode(block.hash()));
            drop(chain);
            ctx.rollback(&self.pool);
            return None;
        }
        let popped = ctx.popped;
        if let Err(e) = chain.commit_block(block.clone(), ctx.utxo_index) {
            tracing::error!("Failed to commit produced block: {}", e);
            drop(chain);
            self.pool.rollback(popped);
            return None;
        }
        self.pool.remove_confirmed(&block.transactions);
        self.advance_lib(&mut chain);
        drop(chain);

        tracing::info!("Produced block {} at height {}", hex::encode(block.hash()), block.height());
        self.network.broadcast_block(&block);
        Some(block)
    }

    fn advance_lib(&self, chain: &mut Blockchain) {
        let Some(quorum) = self.settings.lib_quorum else {
            return;
        };
        if let Err(e) = chain.update_lib(quorum) {
            tracing::warn!("Failed to advance LIB: {}", e);
        }
    }

    fn cancel_production(&self) {
        if let Some(task) = self.task.lock().as_ref() {
            task.cancel();
        }
    }

    /// Validate and adopt a block received from a peer
    pub fn handle_block(&self, block: Block) -> Result<BlockDisposition> {
        let hash = block.hash();
        if self.chain.read().contains(&hash) {
            return Ok(BlockDisposition::Known);
        }
        if !self.proof.validate(&block) {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {} rejected by {}",
                hex::encode(hash),
                self.proof.name()
            )));
        }

        let mut chain = self.chain.write();
        let disposition = if block.header.prev_hash == chain.tail_hash() {
            chain.extend(block.clone())?;
            self.pool.remove_confirmed(&block.transactions);
            BlockDisposition::Extended
        } else if !chain.contains(&block.header.prev_hash) {
            let our_height = chain.tail_height();
            drop(chain);
            tracing::info!("Block {} has an unknown parent, syncing from {}", hex::encode(hash), our_height);
            self.set_state(ConsensusState::Syncing { since: Instant::now() });
            self.network.send(NetworkMessage::SyncRequest { our_height });
            return Ok(BlockDisposition::Orphan);
        } else {
            let height = block.height();
            chain.add_fork_block(block.clone())?;
            if height <= chain.tail_height() {
                return Ok(BlockDisposition::StoredFork);
            }
            let orphaned = chain.reorganize(&hash)?;
            self.pool.rollback(orphaned);
            self.pool.remove_invalid(chain.utxo_index());
            BlockDisposition::Reorganized
        };

        self.advance_lib(&mut chain);
        drop(chain);
        self.cancel_production();
        tracing::info!("Accepted block {} at height {} ({:?})", hex::encode(hash), block.height(), disposition);
        self.network.broadcast_block(&block);
        Ok(disposition)
    }

    /// Resolve `tx`'s inputs against the canonical index or, failing that,
    /// against outputs of pooled transactions
    fn resolve_inputs(&self, tx: &Transaction) -> Result<Vec<Utxo>> {
        let chain = self.chain.read();
        let index = chain.utxo_index();
        tx.vin
            .iter()
            .map(|input| -> Result<Utxo> {
                if let Some(utxo) = index.find_utxo(&input.owner()?, &input.txid, input.vout)? {
                    return Ok(utxo);
                }
                let parent = self.pool.get_transaction(&input.txid).ok_or(ConsensusError::UtxoNotFound)?;
                let output = usize::try_from(input.vout)
                    .ok()
                    .and_then(|i| parent.vout.get(i))
                    .ok_or(ConsensusError::UtxoNotFound)?;
                let kind = if output.owner.is_contract() {
                    UtxoKind::ContractInvoke
                } else {
                    UtxoKind::Normal
                };
                Ok(Utxo::new(output, input.txid, input.vout, kind))
            })
            .collect()
    }

    fn accept_transaction(&self, tx: Transaction) -> Result<()> {
        if !tx.tx_type.is_user_submittable() {
            return Err(ConsensusError::InvalidTransaction(format!(
                "{:?} transactions cannot be submitted",
                tx.tx_type
            )));
        }
        let prev = self.resolve_inputs(&tx)?;
        tx.verify(&prev)?;
        self.pool.push(tx.clone())?;
        tracing::debug!("Accepted transaction {} into the pool", hex::encode(tx.id));
        self.network.broadcast_transaction(&tx);
        Ok(())
    }

    /// Verify and pool a locally submitted transaction, then relay it
    pub fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        let id = tx.id;
        self.accept_transaction(tx).map_err(|e| {
            tracing::info!("Rejected transaction {}: {}", hex::encode(id), e);
            e
        })
    }

    /// React to a message from a peer. Nothing is sent back for rejected
    /// blocks or transactions.
    pub fn handle_network_message(&self, message: NetworkMessage) {
        match message {
            NetworkMessage::NewBlock(block) => {
                if let Err(e) = self.handle_block(block) {
                    tracing::debug!("Ignoring peer block: {}", e);
                }
            }
            NetworkMessage::NewTransaction(tx) => {
                if let Err(e) = self.accept_transaction(tx) {
                    tracing::debug!("Ignoring peer transaction: {}", e);
                }
            }
            NetworkMessage::BlockRequest { hash } => {
                if let Some(block) = self.block_by_hash(&hash) {
                    self.network.send(NetworkMessage::BlockResponse { blocks: vec![block] });
                }
            }
            NetworkMessage::SyncRequest { our_height } => {
                let blocks: Vec<Block> = {
                    let chain = self.chain.read();
                    (our_height.saturating_add(1)..=chain.tail_height())
                        .take(constants::MAX_SYNC_BLOCKS)
                        .filter_map(|h| chain.block_by_height(h).cloned())
                        .collect()
                };
                if !blocks.is_empty() {
                    self.network.send(NetworkMessage::BlockResponse { blocks });
                }
            }
            NetworkMessage::BlockResponse { mut blocks } => {
                blocks.sort_by_key(Block::height);
                for block in blocks {
                    if let Err(e) = self.handle_block(block) {
                        tracing::debug!("Ignoring synced block: {}", e);
                    }
                }
                if matches!(self.state(), ConsensusState::Syncing { .. }) {
                    tracing::info!("Sync finished at height {}", self.tail_height());
                    self.set_state(ConsensusState::Idle);
                }
            }
        }
    }

    /// Drive the engine until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<NetworkMessage>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        self.start();
        let mut ticker = tokio::time::interval(Duration::from_millis(constants::TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(unix_now()),
                Some(message) = inbound.recv() => self.handle_network_message(message),
                _ = &mut shutdown => break,
            }
        }
        self.stop().await;
    }
}
