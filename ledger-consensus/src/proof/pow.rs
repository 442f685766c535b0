//! Proof of work
//!
//! The block hash, read as a big-endian unsigned integer, must be strictly
//! below `2^(256 - target_bits)`.

use super::{ProofEngine, SealResult, StopSignal};
use crate::chain::Block;
use ledger_core::{Hash, OwnerId, Signer};
use num_bigint::BigUint;
use parking_lot::RwLock;
use std::sync::Arc;

/// Default difficulty in leading zero bits
pub const DEFAULT_TARGET_BITS: u32 = 14;

/// Nonces tried between two polls of the stop signal
pub const STOP_POLL_INTERVAL: u64 = 256;

fn target_for(bits: u32) -> BigUint {
    BigUint::from(1u8) << (256 - bits)
}

pub struct ProofOfWork {
    target: RwLock<BigUint>,
    signer: Option<Arc<dyn Signer>>,
}

impl ProofOfWork {
    pub fn new(target_bits: u32) -> Self {
        let pow = Self {
            target: RwLock::new(target_for(0)),
            signer: None,
        };
        pow.set_target_bits(target_bits);
        pow
    }

    /// Sign sealed blocks with `signer`
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Change difficulty; values above 256 are ignored
    pub fn set_target_bits(&self, bits: u32) {
        if bits > 256 {
            tracing::warn!("Ignoring target bits {} above 256", bits);
            return;
        }
        *self.target.write() = target_for(bits);
    }

    pub fn target(&self) -> BigUint {
        self.target.read().clone()
    }

    fn meets_target(&self, hash: &Hash) -> bool {
        BigUint::from_bytes_be(hash) < *self.target.read()
    }
}

impl ProofEngine for ProofOfWork {
    fn is_turn(&self, _producer: &OwnerId, _now: u64) -> bool {
        true
    }

    fn seal(&self, block: &mut Block, stop: &mut StopSignal) -> SealResult {
        if let Some(signer) = &self.signer {
            block.header.producer_pub_key = signer.public_key().to_vec();
        }
        let target = self.target();

        let mut nonce: u64 = 0;
        loop {
            if nonce % STOP_POLL_INTERVAL == 0 && stop.is_stopped() {
                tracing::info!("Mining interrupted at nonce {}", nonce);
                return SealResult::Interrupted;
            }
            let hash = match block.hash_with_nonce(nonce) {
                Ok(hash) => hash,
                Err(e) => return SealResult::Failed(e.to_string()),
            };
            if BigUint::from_bytes_be(&hash) < target {
                block.header.nonce = nonce;
                block.header.hash = hash;
                break;
            }
            nonce = match nonce.checked_add(1) {
                Some(next) => next,
                None => return SealResult::Failed("nonce space exhausted".to_string()),
            };
        }

        if let Some(signer) = &self.signer {
            match signer.sign(&block.header.hash) {
                Ok(signature) => block.header.signature = signature,
                Err(e) => return SealResult::Failed(format!("signing failed: {}", e)),
            }
        }
        tracing::debug!("Found nonce {} for block at height {}", nonce, block.height());
        SealResult::Sealed
    }

    fn validate(&self, block: &Block) -> bool {
        if !block.verify_hash() || !self.meets_target(&block.header.hash) {
            return false;
        }
        block.header.signature.is_empty() || block.verify_signature()
    }

    fn name(&self) -> &'static str {
        "pow"
    }
}
