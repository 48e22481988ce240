// src/core/reshard/migrate.rs

//! Executes a single slot migration end-to-end, mirroring the redis-trib
//! protocol: set the importing/migrating assignment, move the keys, then
//! notify every master of the new owner.

use crate::core::ShepherdError;
use crate::core::cluster::client::ConnectionCache;
use crate::core::cluster::topology::{NodeInfo, RedisUri};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between retries of a failed SETSLOT IMPORTING/MIGRATING pair.
const SETSLOT_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Delay before reissuing the key-move step after a CLUSTERDOWN reply.
const CLUSTERDOWN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Recovery class of a key-migration failure, decided by case-insensitive
/// substring match on the error's string form. The row order is a contract:
/// the first matching class wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorClass {
    /// Destination already holds one of the keys; reissue with REPLACE.
    BusyKey,
    /// Reacquire the source/destination connections and reissue the step.
    ClusterDown,
    /// The slot already moved; nothing left to do.
    Moved,
    /// Non-fatal from the per-slot perspective; the outer loop reconciles.
    Other,
}

/// Classifies a key-migration failure. See `MigrationErrorClass` for the
/// meaning of each row.
pub fn classify_migration_error(error: &ShepherdError) -> MigrationErrorClass {
    let text = error.to_string().to_ascii_lowercase();
    if text.contains("busykey") {
        MigrationErrorClass::BusyKey
    } else if text.contains("clusterdown") {
        MigrationErrorClass::ClusterDown
    } else if text.contains("moved") {
        MigrationErrorClass::Moved
    } else {
        MigrationErrorClass::Other
    }
}

/// Drives single-slot migrations against a per-reshard connection cache and
/// an immutable master snapshot.
pub struct SlotMigrator {
    cache: Arc<ConnectionCache>,
    masters: Vec<NodeInfo>,
    migrate_timeout: Duration,
}

impl SlotMigrator {
    pub fn new(
        cache: Arc<ConnectionCache>,
        masters: Vec<NodeInfo>,
        migrate_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            masters,
            migrate_timeout,
        }
    }

    /// Migrates one slot from `source_id` to `destination_id`.
    ///
    /// Classified key-move failures are absorbed per the recovery table;
    /// only structural failures (a connection-cache miss, an exhausted
    /// per-slot deadline) propagate as errors.
    pub async fn migrate_slot(
        &self,
        slot: u16,
        source_id: &str,
        destination_id: &str,
        destination: &RedisUri,
    ) -> Result<(), ShepherdError> {
        if source_id == destination_id {
            warn!("slot {} is already owned by {}; nothing to migrate", slot, destination_id);
            return Ok(());
        }

        self.set_slot_assignment(slot, source_id, destination_id)
            .await?;

        if !self.move_keys(slot, source_id, destination).await? {
            // The slot resolved itself (already moved, or an absorbed
            // failure); skip the owner broadcast and let the cluster settle.
            return Ok(());
        }

        self.notify_owners(slot, destination_id).await;
        debug!("slot {} now owned by {}", slot, destination_id);
        Ok(())
    }

    /// Marks the slot IMPORTING on the destination and MIGRATING on the
    /// source. Retried until both commands succeed: nothing after this step
    /// can proceed without the assignment in place.
    async fn set_slot_assignment(
        &self,
        slot: u16,
        source_id: &str,
        destination_id: &str,
    ) -> Result<(), ShepherdError> {
        loop {
            let destination = self.cache.get(destination_id)?;
            let source = self.cache.get(source_id)?;

            let result = async {
                destination
                    .cluster_setslot_importing(slot, source_id)
                    .await?;
                source.cluster_setslot_migrating(slot, destination_id).await
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("slot {} assignment failed ({}); retrying", slot, e);
                    tokio::time::sleep(SETSLOT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Moves every key in the slot to the destination with one MIGRATE call.
    ///
    /// Returns `Ok(true)` when the keys landed and the owner broadcast
    /// should follow, `Ok(false)` when the failure was absorbed by the
    /// recovery table and the slot needs no further action here.
    async fn move_keys(
        &self,
        slot: u16,
        source_id: &str,
        destination: &RedisUri,
    ) -> Result<bool, ShepherdError> {
        let mut replace = false;
        loop {
            match self
                .try_move_keys(slot, source_id, destination, replace)
                .await
            {
                Ok(()) => return Ok(true),
                // Structural failures never classify.
                Err(e @ ShepherdError::SlotMigration(_)) => return Err(e),
                Err(e) => match classify_migration_error(&e) {
                    MigrationErrorClass::BusyKey if !replace => {
                        warn!("slot {}: destination keys busy ({}); reissuing MIGRATE with REPLACE", slot, e);
                        replace = true;
                    }
                    MigrationErrorClass::ClusterDown => {
                        warn!("slot {}: cluster down during key move ({}); reacquiring connections", slot, e);
                        tokio::time::sleep(CLUSTERDOWN_RETRY_DELAY).await;
                    }
                    MigrationErrorClass::Moved => {
                        info!("slot {} already moved ({}); treating as success", slot, e);
                        return Ok(false);
                    }
                    _ => {
                        warn!("slot {}: unclassified key-move failure ({}); leaving for reconciliation", slot, e);
                        return Ok(false);
                    }
                },
            }
        }
    }

    async fn try_move_keys(
        &self,
        slot: u16,
        source_id: &str,
        destination: &RedisUri,
        replace: bool,
    ) -> Result<(), ShepherdError> {
        let source = self.cache.get(source_id)?;

        let count = source.cluster_count_keys_in_slot(slot).await?;
        if count == 0 {
            return Ok(());
        }

        let keys = source.cluster_get_keys_in_slot(slot, count).await?;
        if keys.is_empty() {
            return Ok(());
        }

        debug!("slot {}: moving {} keys to {}", slot, keys.len(), destination);
        source
            .migrate(destination, keys, replace, self.migrate_timeout)
            .await
    }

    /// Tells every live master, source and destination included, who owns
    /// the slot now. Stragglers are logged; gossip eventually syncs them.
    async fn notify_owners(&self, slot: u16, destination_id: &str) {
        let notifications = self.masters.iter().map(|master| async move {
            let conn = match self.cache.get(&master.id) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("slot {}: cannot notify {}: {}", slot, master.id, e);
                    return;
                }
            };
            if let Err(e) = conn.cluster_setslot_node(slot, destination_id).await {
                warn!(
                    "slot {}: failed to notify {} of new owner: {}",
                    slot, master.id, e
                );
            }
        });
        join_all(notifications).await;
    }
}
