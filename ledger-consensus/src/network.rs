//! Network capability
//!
//! Transport is somebody else's problem. The engine only emits
//! [`NetworkMessage`]s through a [`NetService`] and consumes the ones peers
//! send back.

use crate::chain::Block;
use crate::transaction::Transaction;
use crate::BlockHeight;
use ledger_core::Hash;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    NewBlock(Block),
    NewTransaction(Transaction),
    /// Ask for a single block by hash
    BlockRequest { hash: Hash },
    /// Consecutive canonical blocks, lowest height first
    BlockResponse { blocks: Vec<Block> },
    /// Ask for canonical blocks above `our_height`
    SyncRequest { our_height: BlockHeight },
}

pub trait NetService: Send + Sync {
    fn send(&self, message: NetworkMessage);

    fn broadcast_block(&self, block: &Block) {
        self.send(NetworkMessage::NewBlock(block.clone()));
    }

    fn broadcast_transaction(&self, tx: &Transaction) {
        self.send(NetworkMessage::NewTransaction(tx.clone()));
    }
}

impl NetService for mpsc::UnboundedSender<NetworkMessage> {
    fn send(&self, message: NetworkMessage) {
        if mpsc::UnboundedSender::send(self, message).is_err() {
            tracing::debug!("Network outbox closed, dropping message");
        }
    }
}

/// A node with no peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNetwork;

impl NetService for NullNetwork {
    fn send(&self, _message: NetworkMessage) {}
}
