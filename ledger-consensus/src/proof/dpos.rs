//! Delegated proof of stake
//!
//! Producers take turns according to the [`Dynasty`]. A block is valid when it
//! is signed by the producer owning its time slot, pays that producer, and is
//! the only block seen for the slot.

use super::{ProofEngine, SealResult, StopSignal};
use crate::chain::Block;
use crate::constants::DOUBLE_MINT_CACHE_SIZE;
use crate::dynasty::Dynasty;
use crate::{ConsensusError, Result};
use ledger_core::{Hash, OwnerId, Signer};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// What has been seen for recent slots
struct SlotCache {
    /// First block hash accepted for a slot timestamp
    minted: LruCache<u64, Hash>,

    /// Slots for which two different blocks showed up
    equivocated: LruCache<u64, ()>,
}

pub struct Dpos {
    dynasty: RwLock<Dynasty>,
    signer: Option<Arc<dyn Signer>>,
    slots: Mutex<SlotCache>,
}

impl Dpos {
    pub fn new(dynasty: Dynasty) -> Self {
        let capacity = NonZeroUsize::new(DOUBLE_MINT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            dynasty: RwLock::new(dynasty),
            signer: None,
            slots: Mutex::new(SlotCache {
                minted: LruCache::new(capacity),
                equivocated: LruCache::new(capacity),
            }),
        }
    }

    /// Produce blocks as `signer`
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn dynasty(&self) -> Dynasty {
        self.dynasty.read().clone()
    }

    pub fn add_producer(&self, producer: OwnerId) -> bool {
        self.dynasty.write().add_producer(producer)
    }

    /// Signature, slot ownership and coinbase beneficiary checks
    fn verify_producer(&self, block: &Block) -> bool {
        if !block.verify_signature() {
            tracing::warn!("DPoS: block {} has an invalid signature", hex::encode(block.hash()));
            return false;
        }
        let producer = block.header.producer;
        if !self.dynasty.read().is_turn(&producer, block.header.timestamp) {
            tracing::warn!(
                "DPoS: {} does not own slot {}",
                producer,
                block.header.timestamp
            );
            return false;
        }
        let pays_producer = block
            .coinbase()
            .and_then(|cb| cb.vout.first())
            .map_or(false, |out| out.owner == producer);
        if !pays_producer {
            tracing::debug!("DPoS: coinbase does not pay the slot producer");
        }
        pays_producer
    }

    /// Record `block` for its slot; false when the slot already has another block
    fn record_slot(&self, block: &Block) -> bool {
        let slot = block.header.timestamp;
        let mut slots = self.slots.lock();
        if slots.equivocated.contains(&slot) {
            tracing::debug!("DPoS: slot {} is equivocated", slot);
            return false;
        }
        match slots.minted.get(&slot).copied() {
            Some(existing) if existing == block.hash() => true,
            Some(_) => {
                tracing::warn!("DPoS: double mint found in slot {}", slot);
                slots.equivocated.put(slot, ());
                false
            }
            None => {
                slots.minted.put(slot, block.hash());
                true
            }
        }
    }

    /// Error form of [`ProofEngine::validate`] for callers reporting a reason
    pub fn check(&self, block: &Block) -> Result<()> {
        if !block.verify_hash() {
            return Err(ConsensusError::InvalidBlock("hash does not match contents".to_string()));
        }
        if !self.verify_producer(block) {
            return Err(ConsensusError::WrongProducerTurn);
        }
        if !self.record_slot(block) {
            return Err(ConsensusError::DoubleMint(block.header.timestamp));
        }
        Ok(())
    }
}

impl ProofEngine for Dpos {
    fn is_turn(&self, producer: &OwnerId, now: u64) -> bool {
        self.dynasty.read().is_turn(producer, now)
    }

    fn seal(&self, block: &mut Block, stop: &mut StopSignal) -> SealResult {
        let Some(signer) = &self.signer else {
            return SealResult::Failed("no producer key configured".to_string());
        };
        if !self.is_turn(&signer.owner(), block.header.timestamp) {
            return SealResult::Failed(ConsensusError::WrongProducerTurn.to_string());
        }
        if stop.is_stopped() {
            return SealResult::Interrupted;
        }

        block.header.nonce = 0;
        block.header.producer_pub_key = signer.public_key().to_vec();
        block.header.hash = match block.compute_hash() {
            Ok(hash) => hash,
            Err(e) => return SealResult::Failed(e.to_string()),
        };
        match signer.sign(&block.header.hash) {
            Ok(signature) => {
                block.header.signature = signature;
                SealResult::Sealed
            }
            Err(e) => {
                tracing::warn!("DPoS: failed to sign the new block: {}", e);
                SealResult::Failed(e.to_string())
            }
        }
    }

    fn validate(&self, block: &Block) -> bool {
        match self.check(block) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("DPoS: rejected block {}: {}", hex::encode(block.hash()), e);
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "dpos"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use ledger_core::{Amount, KeyPair};

    fn setup() -> (Vec<Arc<KeyPair>>, Dynasty) {
        let keys: Vec<Arc<KeyPair>> = (0..3u8).map(|i| Arc::new(KeyPair::from_seed(&[i + 1; 32]))).collect();
        let dynasty = Dynasty::with_producers(keys.iter().map(|k| k.owner()), 2);
        (keys, dynasty)
    }

    fn block_for(producer: OwnerId, timestamp: u64, value: u64) -> Block {
        let genesis = Block::genesis(&[]).unwrap();
        let coinbase = Transaction::new_coinbase(producer, 1, Amount::from_u64(value)).unwrap();
        Block::new(vec![coinbase], &genesis, producer, timestamp).unwrap()
    }

    #[test]
    fn test_seal_only_in_own_slot() {
        let (keys, dynasty) = setup();
        let dpos = Dpos::new(dynasty).with_signer(keys[1].clone());

        let mut block = block_for(keys[1].owner(), 2, 10);
        assert_eq!(dpos.seal(&mut block, &mut StopSignal::never()), SealResult::Sealed);
        assert!(dpos.validate(&block));

        let mut early = block_for(keys[1].owner(), 0, 10);
        assert!(matches!(dpos.seal(&mut early, &mut StopSignal::never()), SealResult::Failed(_)));
    }

    #[test]
    fn test_rejects_foreign_slot() {
        let (keys, dynasty) = setup();
        let sealer = Dpos::new(dynasty.clone()).with_signer(keys[0].clone());
        let validator = Dpos::new(dynasty);

        let mut block = block_for(keys[0].owner(), 0, 10);
        assert_eq!(sealer.seal(&mut block, &mut StopSignal::never()), SealResult::Sealed);
        assert!(validator.validate(&block));

        // Same producer, but slot 2 belongs to producer 1.
        let mut stolen = block_for(keys[0].owner(), 2, 10);
        stolen.header.producer_pub_key = keys[0].public_key().to_vec();
        stolen.header.hash = stolen.compute_hash().unwrap();
        stolen.header.signature = keys[0].sign(&stolen.header.hash).unwrap();
        assert_eq!(validator.check(&stolen), Err(ConsensusError::WrongProducerTurn));
    }

    #[test]
    fn test_coinbase_must_pay_producer() {
        let (keys, dynasty) = setup();
        let dpos = Dpos::new(dynasty).with_signer(keys[0].clone());
        let genesis = Block::genesis(&[]).unwrap();
        let coinbase = Transaction::new_coinbase(keys[2].owner(), 1, Amount::from_u64(10)).unwrap();
        let mut block = Block::new(vec![coinbase], &genesis, keys[0].owner(), 0).unwrap();
        assert_eq!(dpos.seal(&mut block, &mut StopSignal::never()), SealResult::Sealed);
        assert!(!dpos.validate(&block));
    }

    #[test]
    fn test_double_mint_poisons_slot() {
        let (keys, dynasty) = setup();
        let dpos = Dpos::new(dynasty).with_signer(keys[0].clone());

        let mut first = block_for(keys[0].owner(), 6, 10);
        let mut second = block_for(keys[0].owner(), 6, 11);
        assert_eq!(dpos.seal(&mut first, &mut StopSignal::never()), SealResult::Sealed);
        assert_eq!(dpos.seal(&mut second, &mut StopSignal::never()), SealResult::Sealed);

        assert!(dpos.validate(&first));
        assert!(dpos.validate(&first));
        assert_eq!(dpos.check(&second), Err(ConsensusError::DoubleMint(6)));
        assert!(!dpos.validate(&first));
    }

    #[test]
    fn test_seal_without_key_fails() {
        let (keys, dynasty) = setup();
        let dpos = Dpos::new(dynasty);
        let mut block = block_for(keys[0].owner(), 0, 10);
        assert!(matches!(dpos.seal(&mut block, &mut StopSignal::never()), SealResult::Failed(_)));
    }
}
