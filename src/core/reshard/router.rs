// src/core/reshard/router.rs

//! Bounded-parallelism dispatcher for slot migrations. Takes a flattened
//! migration plan and a per-slot migration function, and answers with a
//! single success or error only after every per-slot future settles.

use crate::core::ShepherdError;
use crate::core::reshard::table::SlotMove;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Number of slot migrations in flight at once.
const MIGRATION_PARALLELISM: usize = 5;

pub struct MigrationRouter {
    timeout: Duration,
}

impl MigrationRouter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs one migration per move with a fixed concurrency cap, returning
    /// the number of settled slots. Breaching the deadline aborts every
    /// in-flight migration and surfaces as `ReshardTimeout`.
    pub async fn run<F, Fut>(&self, moves: Vec<SlotMove>, migrate: F) -> Result<usize, ShepherdError>
    where
        F: Fn(SlotMove) -> Fut,
        Fut: Future<Output = Result<(), ShepherdError>> + Send + 'static,
    {
        let total = moves.len();
        if total == 0 {
            info!("migration plan is empty; nothing to route");
            return Ok(0);
        }

        let drive = async {
            let permits = Arc::new(Semaphore::new(MIGRATION_PARALLELISM));
            let mut migrations: JoinSet<Result<(), ShepherdError>> = JoinSet::new();

            for slot_move in moves {
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ShepherdError::Internal("migration semaphore closed".into()))?;
                let fut = migrate(slot_move);
                migrations.spawn(async move {
                    let _permit = permit;
                    fut.await
                });
            }

            let mut failure: Option<ShepherdError> = None;
            while let Some(settled) = migrations.join_next().await {
                match settled {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("slot migration failed: {}", e);
                        failure.get_or_insert(e);
                    }
                    Err(e) => {
                        error!("slot migration task panicked: {}", e);
                        failure.get_or_insert(ShepherdError::Internal(format!(
                            "migration task panicked: {e}"
                        )));
                    }
                }
            }

            match failure {
                None => Ok(total),
                Some(e) => Err(e),
            }
        };

        tokio::time::timeout(self.timeout, drive)
            .await
            .map_err(|_| ShepherdError::ReshardTimeout(self.timeout))?
    }
}
