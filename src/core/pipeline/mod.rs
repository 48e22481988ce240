// src/core/pipeline/mod.rs

//! The staged task flow. Ingress and feedback merge into a classifier that
//! routes each task to its mutation stage; every stage is a single worker
//! over a bounded queue. Two feedback edges re-enter the classifier: a
//! completed add-master synthesizes a reshard, and removing a master
//! synthesizes a drain reshard that ends in a cluster-wide forget.

pub mod poorest;
pub mod stages;
pub mod task;

use self::stages::{
    AddMasterStage, AddReplicaStage, RemoveNodeStage, RemoveReplicaStage, ReshardStage,
    StageContext,
};
use self::task::{Task, TaskOp};
use crate::config::Config;
use crate::core::ShepherdError;
use crate::core::cluster::client::ClusterClient;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Queue depth of the ingress edge.
pub const INGRESS_BUFFER: usize = 64;
/// Queue depth of the feedback edge.
const FEEDBACK_BUFFER: usize = 16;
/// Queue depth of each stage's input.
const STAGE_BUFFER: usize = 64;

/// Destination queues the classifier routes into.
struct StageRoutes {
    add_master: mpsc::Sender<Task>,
    add_replica: mpsc::Sender<Task>,
    remove_node: mpsc::Sender<Task>,
    reshard: mpsc::Sender<Task>,
}

/// Wires up every stage worker and returns the ingress sender.
pub fn spawn(
    config: Arc<Config>,
    client: Arc<dyn ClusterClient>,
    workers: &mut JoinSet<()>,
    shutdown: &broadcast::Sender<()>,
) -> mpsc::Sender<Task> {
    let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_BUFFER);
    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_BUFFER);

    let (add_master_tx, add_master_rx) = mpsc::channel(STAGE_BUFFER);
    let (add_replica_tx, add_replica_rx) = mpsc::channel(STAGE_BUFFER);
    let (remove_node_tx, remove_node_rx) = mpsc::channel(STAGE_BUFFER);
    let (remove_replica_tx, remove_replica_rx) = mpsc::channel(STAGE_BUFFER);
    let (reshard_tx, reshard_rx) = mpsc::channel(STAGE_BUFFER);

    let ctx = StageContext {
        config,
        client,
        feedback: feedback_tx,
    };

    workers.spawn(AddMasterStage { ctx: ctx.clone() }.run(add_master_rx, shutdown.subscribe()));
    workers.spawn(AddReplicaStage { ctx: ctx.clone() }.run(add_replica_rx, shutdown.subscribe()));
    workers.spawn(
        RemoveNodeStage {
            ctx: ctx.clone(),
            remove_replica: remove_replica_tx,
        }
        .run(remove_node_rx, shutdown.subscribe()),
    );
    workers.spawn(RemoveReplicaStage { ctx: ctx.clone() }.run(remove_replica_rx, shutdown.subscribe()));
    workers.spawn(ReshardStage { ctx }.run(reshard_rx, shutdown.subscribe()));

    let routes = StageRoutes {
        add_master: add_master_tx,
        add_replica: add_replica_tx,
        remove_node: remove_node_tx,
        reshard: reshard_tx,
    };
    workers.spawn(run_classifier(
        ingress_rx,
        feedback_rx,
        routes,
        shutdown.subscribe(),
    ));

    ingress_tx
}

/// Receives the next task, strictly preferring the feedback edge: a freshly
/// added master's reshard dispatches ahead of anything waiting at ingress.
pub async fn recv_preferred(
    feedback: &mut mpsc::Receiver<Task>,
    ingress: &mut mpsc::Receiver<Task>,
) -> Option<Task> {
    if let Ok(task) = feedback.try_recv() {
        return Some(task);
    }
    tokio::select! {
        biased;
        Some(task) = feedback.recv() => Some(task),
        Some(task) = ingress.recv() => Some(task),
        else => None,
    }
}

/// Drains the merged edges and hands each task to its stage queue.
/// Unsupported operations fail fast, right here.
async fn run_classifier(
    mut ingress: mpsc::Receiver<Task>,
    mut feedback: mpsc::Receiver<Task>,
    routes: StageRoutes,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("task classifier started");
    loop {
        let mut task = tokio::select! {
            _ = shutdown.recv() => {
                info!("task classifier shutting down");
                return;
            }
            task = recv_preferred(&mut feedback, &mut ingress) => match task {
                Some(task) => task,
                None => return,
            },
        };

        let op = task.classify();
        debug!("dispatching {} task for '{}'", op, task.target);
        let queue = match op {
            TaskOp::AddMaster => &routes.add_master,
            TaskOp::AddReplica => &routes.add_replica,
            TaskOp::RemoveNode => &routes.remove_node,
            TaskOp::Reshard => &routes.reshard,
            TaskOp::Unsupported => {
                warn!("unsupported operation '{}' for '{}'", task.op, task.target);
                let error = ShepherdError::IllegalOperation {
                    op: task.op.trim().to_string(),
                    target: task.target.clone(),
                };
                task.reply_err(error);
                continue;
            }
        };
        if queue.send(task).await.is_err() {
            warn!("stage queue closed; dropping task");
        }
    }
}
