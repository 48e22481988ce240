// tests/property/planner_test.rs

//! Planner invariants over arbitrary slot ownership layouts.

use proptest::prelude::*;
use shepherd::core::cluster::topology::{NodeInfo, NodeRole};
use shepherd::core::reshard::{drain, rebalance_toward};
use std::collections::HashSet;

fn master(id: &str, host: &str, slots: Vec<u16>) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        host: host.to_string(),
        port: 6379,
        role: NodeRole::Master,
        connected: true,
        replica_of: None,
        slots,
    }
}

/// Arbitrary clusters of 1..6 masters sharing the full slot space. The
/// first `n` slots are pinned so every master owns at least one.
fn arbitrary_sources() -> impl Strategy<Value = Vec<NodeInfo>> {
    (1usize..6).prop_flat_map(|n| {
        prop::collection::vec(0..n, 16384).prop_map(move |assignment| {
            let mut owned: Vec<Vec<u16>> = vec![Vec::new(); n];
            for (slot, owner) in assignment.iter().enumerate() {
                let owner = if slot < n { slot } else { *owner };
                owned[owner].push(slot as u16);
            }
            owned
                .into_iter()
                .enumerate()
                .map(|(i, slots)| master(&format!("m{i}"), &format!("10.0.0.{}", i + 1), slots))
                .collect()
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn rebalance_output_is_disjoint_and_owned_by_its_source(
        sources in arbitrary_sources()
    ) {
        let table = rebalance_toward(&sources, "target").unwrap();
        let mut seen = HashSet::new();
        for (source_id, slots) in &table.moves {
            let owner = sources.iter().find(|n| &n.id == source_id).unwrap();
            for slot in slots {
                prop_assert!(*slot < 16384);
                prop_assert!(owner.slots.contains(slot));
                prop_assert!(seen.insert(*slot), "slot {} planned twice", slot);
            }
        }
    }

    #[test]
    fn rebalance_is_deterministic(sources in arbitrary_sources()) {
        let first = rebalance_toward(&sources, "target").unwrap();
        let second = rebalance_toward(&sources, "target").unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn rebalance_moves_exactly_the_surplus(sources in arbitrary_sources()) {
        let ideal = 16384usize.div_ceil(sources.len() + 1);
        let table = rebalance_toward(&sources, "target").unwrap();
        for source in &sources {
            let surplus = source.slots.len().saturating_sub(ideal);
            let planned = table.moves.get(&source.id).map(Vec::len).unwrap_or(0);
            prop_assert_eq!(planned, surplus);
        }
    }

    #[test]
    fn drain_covers_every_retiring_slot_exactly_once(
        sources in arbitrary_sources()
    ) {
        if sources.len() < 2 {
            return Ok(());
        }
        let (retiring, remaining) = sources.split_first().unwrap();
        let moves = drain(retiring, remaining).unwrap();

        prop_assert_eq!(moves.len(), retiring.slots.len());
        let moved: HashSet<u16> = moves.iter().map(|m| m.slot).collect();
        prop_assert_eq!(moved.len(), retiring.slots.len());
        for slot_move in &moves {
            prop_assert!(remaining.iter().any(|n| n.id == slot_move.destination_id));
            prop_assert_eq!(&slot_move.source_id, &retiring.id);
        }
    }
}
