// src/core/supervisor.rs

//! Wires the cluster client and the task pipeline together and exposes the
//! single task-submission entry point.

use crate::config::Config;
use crate::core::ShepherdError;
use crate::core::cluster::client::ClusterClient;
use crate::core::cluster::topology;
use crate::core::pipeline;
use crate::core::pipeline::task::{Task, TaskReply};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct Supervisor {
    ingress: mpsc::Sender<Task>,
    shutdown: broadcast::Sender<()>,
    workers: Mutex<JoinSet<()>>,
}

impl Supervisor {
    /// Spawns the pipeline and its background tasks.
    pub fn spawn(config: Arc<Config>, client: Arc<dyn ClusterClient>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut workers = JoinSet::new();
        let ingress = pipeline::spawn(config.clone(), client.clone(), &mut workers, &shutdown_tx);
        workers.spawn(log_topology(
            client,
            config.cluster.refresh_interval,
            shutdown_tx.subscribe(),
        ));
        info!("supervisor started with {} worker(s)", workers.len());
        Self {
            ingress,
            shutdown: shutdown_tx,
            workers: Mutex::new(workers),
        }
    }

    /// Accepts a task for processing. A successful return means accepted,
    /// not done: the terminal outcome arrives later on the returned
    /// receiver, which closes without a value for operations that end
    /// without a signal.
    pub async fn submit(
        &self,
        op: &str,
        target: &str,
    ) -> Result<oneshot::Receiver<TaskReply>, ShepherdError> {
        let (task, reply) = Task::new(op, target);
        self.ingress
            .send(task)
            .await
            .map_err(|_| ShepherdError::Internal("task pipeline is not running".into()))?;
        debug!("accepted {} task for '{}'", op, target);
        Ok(reply)
    }

    /// Subscribes to the shutdown signal, for collaborators serving
    /// alongside the pipeline.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signals every worker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Signals every worker to stop and waits for them to finish.
    pub async fn shutdown_and_wait(self) {
        let _ = self.shutdown.send(());
        let mut workers = self.workers.into_inner();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!("pipeline worker ended abnormally: {}", e);
            }
        }
        info!("supervisor stopped");
    }
}

/// Periodically re-reads and logs the cluster layout. The cadence follows
/// the cluster client's own topology refresh interval.
async fn log_topology(
    client: Arc<dyn ClusterClient>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => match client.topology().await {
                Ok(nodes) => {
                    let masters = topology::masters(&nodes).len();
                    debug!(
                        "topology: {} node(s), {} master(s), {} replica(s)",
                        nodes.len(),
                        masters,
                        nodes.len() - masters
                    );
                }
                Err(e) => warn!("periodic topology refresh failed: {}", e),
            },
        }
    }
}
