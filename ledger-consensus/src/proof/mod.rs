//! Sealing strategies
//!
//! A [`ProofEngine`] turns an assembled block into a sealed one and decides
//! whether blocks sealed by others are acceptable.

pub mod dpos;
pub mod pow;

pub use dpos::Dpos;
pub use pow::ProofOfWork;

use crate::chain::Block;
use ledger_core::OwnerId;
use tokio::sync::mpsc;

/// Result of a sealing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealResult {
    Sealed,
    Interrupted,
    Failed(String),
}

/// Cancellation flag polled by long-running sealing loops
#[derive(Debug)]
pub struct StopSignal {
    rx: Option<mpsc::Receiver<()>>,
    stopped: bool,
}

impl StopSignal {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx: Some(rx), stopped: false }
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None, stopped: false }
    }

    /// Whether a stop was requested. A dropped sender counts as a request.
    pub fn is_stopped(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        if let Some(rx) = self.rx.as_mut() {
            match rx.try_recv() {
                Ok(()) | Err(mpsc::error::TryRecvError::Disconnected) => self.stopped = true,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
        }
        self.stopped
    }
}

pub trait ProofEngine: Send + Sync {
    /// Whether `producer` may produce a block at `now`
    fn is_turn(&self, producer: &OwnerId, now: u64) -> bool;

    /// Seal `block` in place
    fn seal(&self, block: &mut Block, stop: &mut StopSignal) -> SealResult;

    /// Whether a sealed block satisfies this engine's rules
    fn validate(&self, block: &Block) -> bool;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal() {
        let (tx, rx) = mpsc::channel(1);
        let mut signal = StopSignal::new(rx);
        assert!(!signal.is_stopped());
        tx.try_send(()).unwrap();
        assert!(signal.is_stopped());
        assert!(signal.is_stopped());

        let (tx, rx) = mpsc::channel::<()>(1);
        let mut signal = StopSignal::new(rx);
        drop(tx);
        assert!(signal.is_stopped());

        assert!(!StopSignal::never().is_stopped());
    }
}
