//! Property tests for scheduling and pool ordering

use ledger_consensus::*;
use ledger_core::{Amount, KeyPair, MemoryStorage, OwnerId, Signer};
use proptest::prelude::*;
use std::sync::Arc;

fn producers(n: usize) -> Vec<OwnerId> {
    (0..n).map(|i| OwnerId::from_public_key(&[i as u8])).collect()
}

proptest! {
    #[test]
    fn prop_exactly_one_producer_per_slice_start(
        seats in 1usize..8,
        slice in 1u64..10,
        now in 0u64..1_000_000,
    ) {
        let ids = producers(seats);
        let dynasty = Dynasty::with_producers(ids.clone(), slice);
        let turns: Vec<usize> = (0..seats).filter(|i| dynasty.is_turn(&ids[*i], now)).collect();

        let offset = now % dynasty.cycle_secs();
        if now % slice == 0 {
            prop_assert_eq!(turns, vec![(offset / slice) as usize]);
        } else {
            prop_assert!(turns.is_empty());
        }
    }

    #[test]
    fn prop_empty_seats_never_produce(
        filled in 0usize..3,
        now in 0u64..10_000,
    ) {
        let mut dynasty = Dynasty::new(3, 2);
        dynasty.add_producers(producers(filled));
        let owner = dynasty.producer_at(now);
        let seat = ((now % 6) / 2) as usize;
        prop_assert_eq!(owner.is_some(), seat < filled);
    }

    #[test]
    fn prop_pool_pops_independent_transactions_by_tip(
        tips in prop::collection::vec(0u64..50, 1..8),
    ) {
        let keys: Vec<KeyPair> = (0..tips.len()).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
        let allocations: Vec<(OwnerId, Amount)> = keys.iter().map(|k| (k.owner(), Amount::from_u64(100))).collect();
        let chain = Blockchain::new(
            Block::genesis(&allocations).unwrap(),
            Arc::new(MemoryStorage::new()),
            Amount::from_u64(10),
        )
        .unwrap();

        let pool = TransactionPool::new(1024 * 1024);
        for (key, tip) in keys.iter().zip(&tips) {
            let utxos = chain.utxo_index().get_spendable_set(&key.owner(), &Amount::from_u64(10 + tip)).unwrap();
            let tx = Transaction::new_transfer(
                TransferParams::new(OwnerId::from_public_key(b"sink"), Amount::from_u64(10), Amount::from_u64(*tip)),
                &utxos,
                key,
            )
            .unwrap();
            pool.push(tx).unwrap();
        }

        let mut popped = Vec::new();
        while let Some(tx) = pool.pop_highest_tip_ready(chain.utxo_index()) {
            popped.push(tx.tip.to_u64().unwrap());
        }
        prop_assert_eq!(popped.len(), tips.len());
        prop_assert!(popped.windows(2).all(|w| w[0] >= w[1]));
        prop_assert!(pool.is_empty());
    }
}
