// src/core/reshard/table.rs

//! The pure reshard planner: given the current master set and a designated
//! target, decides which slots each source master relinquishes. Same input,
//! byte-identical output.

use crate::core::ShepherdError;
use crate::core::cluster::topology::{NUM_SLOTS, NodeInfo, RedisUri};
use std::collections::BTreeMap;

/// A single slot transfer between two masters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMove {
    pub slot: u16,
    pub source_id: String,
    pub destination_id: String,
    pub destination: RedisUri,
}

/// The plan for one rebalance: which slots each source master gives up,
/// keyed by source node ID. Slot lists are pairwise disjoint and ordered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReshardTable {
    pub moves: BTreeMap<String, Vec<u16>>,
}

impl ReshardTable {
    pub fn slot_count(&self) -> usize {
        self.moves.values().map(Vec::len).sum()
    }

    /// Flattens the table into per-slot moves toward a single destination.
    pub fn into_moves(self, destination: &NodeInfo) -> Vec<SlotMove> {
        let uri = destination.uri();
        self.moves
            .into_iter()
            .flat_map(|(source_id, slots)| {
                let uri = uri.clone();
                let destination_id = destination.id.clone();
                slots.into_iter().map(move |slot| SlotMove {
                    slot,
                    source_id: source_id.clone(),
                    destination_id: destination_id.clone(),
                    destination: uri.clone(),
                })
            })
            .collect()
    }
}

/// Computes the slots each source master must relinquish so that ownership
/// rebalances toward one additional master.
///
/// The ideal share per master is `⌈16384 / (sources + 1)⌉` assuming uniform
/// distribution; each source gives up the numerically-first slots beyond
/// that share. The target never appears as a source.
pub fn rebalance_toward(
    sources: &[NodeInfo],
    target_id: &str,
) -> Result<ReshardTable, ShepherdError> {
    let sources: Vec<&NodeInfo> = sources.iter().filter(|n| n.id != target_id).collect();
    if sources.is_empty() {
        return Err(ShepherdError::ReshardTable(
            "no source masters to draw slots from".into(),
        ));
    }

    let ideal = (NUM_SLOTS as usize).div_ceil(sources.len() + 1);
    let mut table = ReshardTable::default();

    for source in sources {
        if source.slots.is_empty() {
            return Err(ShepherdError::ReshardTable(format!(
                "source master {} owns no slots",
                source.id
            )));
        }
        let mut owned = source.slots.clone();
        owned.sort_unstable();
        let surplus = owned.len().saturating_sub(ideal);
        if surplus > 0 {
            owned.truncate(surplus);
            table.moves.insert(source.id.clone(), owned);
        }
    }

    Ok(table)
}

/// Distributes every slot of a retiring master across the remaining masters,
/// round-robin in numeric slot order with destinations in node-ID order.
/// Used when a master is removed: its keyspace must drain before the node
/// can be forgotten.
pub fn drain(
    retiring: &NodeInfo,
    remaining: &[NodeInfo],
) -> Result<Vec<SlotMove>, ShepherdError> {
    let mut destinations: Vec<&NodeInfo> = remaining
        .iter()
        .filter(|n| n.id != retiring.id)
        .collect();
    if destinations.is_empty() {
        return Err(ShepherdError::ReshardTable(format!(
            "no masters left to absorb slots from {}",
            retiring.id
        )));
    }
    destinations.sort_by(|a, b| a.id.cmp(&b.id));

    let mut slots = retiring.slots.clone();
    slots.sort_unstable();

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            let destination = destinations[i % destinations.len()];
            SlotMove {
                slot,
                source_id: retiring.id.clone(),
                destination_id: destination.id.clone(),
                destination: destination.uri(),
            }
        })
        .collect())
}
