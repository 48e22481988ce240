// src/core/pipeline/stages.rs

//! The mutation stages of the task pipeline. Each stage runs as a single
//! worker over a bounded queue, so tasks of one kind process strictly in
//! arrival order, one batch at a time.

use crate::config::Config;
use crate::core::ShepherdError;
use crate::core::cluster::client::{ClusterClient, ConnectionCache};
use crate::core::cluster::topology::{self, NodeInfo, RedisUri};
use crate::core::pipeline::poorest::PoorestN;
use crate::core::pipeline::task::{Task, TaskOp};
use crate::core::reshard::{MigrationRouter, SlotMigrator, SlotMove, drain, rebalance_toward};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Delay between retry rounds of the CLUSTER MEET fan-out.
const MEET_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Delay before re-running a reshard whose plan was rejected.
const RESHARD_RETRY_DELAY: Duration = Duration::from_millis(500);
/// How often the reshard stage polls a new master for `cluster_state:ok`.
const CLUSTER_OK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Batch caps per stage, each held open for one batch period.
const ADD_MASTER_BATCH: usize = 1;
const ADD_REPLICA_BATCH: usize = 10;
const REMOVE_REPLICA_BATCH: usize = 100;

/// Dependencies shared by every stage worker.
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<Config>,
    pub client: Arc<dyn ClusterClient>,
    /// The feedback edge back into the classifier.
    pub feedback: mpsc::Sender<Task>,
}

/// Collects up to `limit` tasks, holding the batch open for `period` after
/// the first arrival. Returns `None` once the queue closes empty.
async fn next_batch(
    rx: &mut mpsc::Receiver<Task>,
    limit: usize,
    period: Duration,
) -> Option<Vec<Task>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    if limit > 1 {
        let deadline = tokio::time::Instant::now() + period;
        while batch.len() < limit {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(task)) => batch.push(task),
                Ok(None) | Err(_) => break,
            }
        }
    }
    Some(batch)
}

/// Introduces the given URIs to the cluster: every live node issues a
/// CLUSTER MEET for every new address. The operator explicitly asked for
/// the add, so client failures retry until a full round goes through.
async fn add_nodes_to_cluster(client: &Arc<dyn ClusterClient>, uris: &[RedisUri]) {
    loop {
        match meet_round(client, uris).await {
            Ok(met) => {
                info!("{} node(s) met {} new address(es)", met, uris.len());
                return;
            }
            Err(e) => {
                warn!("CLUSTER MEET round failed ({}); retrying", e);
                tokio::time::sleep(MEET_RETRY_DELAY).await;
            }
        }
    }
}

async fn meet_round(
    client: &Arc<dyn ClusterClient>,
    uris: &[RedisUri],
) -> Result<usize, ShepherdError> {
    let nodes = client.topology().await?;
    let mut met = 0;
    for node in nodes.iter().filter(|n| n.connected) {
        let conn = client.connection(node).await?;
        for uri in uris {
            conn.cluster_meet(&uri.host, uri.port).await?;
        }
        met += 1;
    }
    Ok(met)
}

/// Resets each departing node, then has every remaining node forget every
/// departing ID. A node is never asked to forget itself, and a departing
/// node is always reset before anyone is told to forget it. Unreachable
/// nodes are logged and skipped so a dead replica can still be removed.
async fn forget_nodes(
    client: &Arc<dyn ClusterClient>,
    nodes: &[NodeInfo],
    departing: &[NodeInfo],
) {
    for node in departing {
        match client.connection(node).await {
            Ok(conn) => {
                if let Err(e) = conn.cluster_reset_hard().await {
                    warn!("could not reset departing node {}: {}", node.addr(), e);
                }
            }
            Err(e) => warn!("could not reach {} for reset: {}", node.addr(), e),
        }
    }

    let departing_ids: HashSet<&str> = departing.iter().map(|n| n.id.as_str()).collect();
    for node in nodes {
        if departing_ids.contains(node.id.as_str()) {
            continue;
        }
        let conn = match client.connection(node).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("could not reach {} for forget: {}", node.addr(), e);
                continue;
            }
        };
        for id in &departing_ids {
            if *id == node.id {
                continue;
            }
            if let Err(e) = conn.cluster_forget(id).await {
                warn!("{} failed to forget {}: {}", node.id, id, e);
            }
        }
    }
}

/// Adds one master per batch window, then re-enters the classifier with a
/// synthesized reshard carrying the new master's URI and the caller's
/// reply handle.
pub struct AddMasterStage {
    pub ctx: StageContext,
}

impl AddMasterStage {
    pub async fn run(self, mut rx: mpsc::Receiver<Task>, mut shutdown: broadcast::Receiver<()>) {
        info!("add-master stage started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("add-master stage shutting down");
                    return;
                }
                batch = next_batch(&mut rx, ADD_MASTER_BATCH, self.ctx.config.pipeline.batch_period) => {
                    let Some(batch) = batch else { return };
                    for task in batch {
                        self.handle(task).await;
                    }
                }
            }
        }
    }

    async fn handle(&self, mut task: Task) {
        let uri = match RedisUri::parse(&task.target, self.ctx.config.cluster.server_port) {
            Ok(uri) => uri,
            Err(e) => {
                task.reply_err(e);
                return;
            }
        };

        info!("adding master {}", uri);
        add_nodes_to_cluster(&self.ctx.client, std::slice::from_ref(&uri)).await;
        tokio::time::sleep(self.ctx.config.pipeline.refresh_timeout).await;

        let reshard = Task {
            op: TaskOp::Reshard.to_string(),
            target: String::new(),
            reply_to: task.reply_to.take(),
            new_master_uri: Some(uri),
            retiring_uri: None,
        };
        if self.ctx.feedback.send(reshard).await.is_err() {
            warn!("pipeline closed; dropped synthesized reshard for new master");
        }
    }
}

/// Meets a batch of new nodes and assigns each as replica of the poorest
/// masters, round-robin when replicas outnumber masters.
pub struct AddReplicaStage {
    pub ctx: StageContext,
}

impl AddReplicaStage {
    pub async fn run(self, mut rx: mpsc::Receiver<Task>, mut shutdown: broadcast::Receiver<()>) {
        info!("add-replica stage started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("add-replica stage shutting down");
                    return;
                }
                batch = next_batch(&mut rx, ADD_REPLICA_BATCH, self.ctx.config.pipeline.batch_period) => {
                    let Some(batch) = batch else { return };
                    self.handle(batch).await;
                }
            }
        }
    }

    async fn handle(&self, batch: Vec<Task>) {
        let mut pending: Vec<(Task, RedisUri)> = Vec::new();
        for mut task in batch {
            match RedisUri::parse(&task.target, self.ctx.config.cluster.server_port) {
                Ok(uri) => pending.push((task, uri)),
                Err(e) => task.reply_err(e),
            }
        }
        if pending.is_empty() {
            return;
        }

        let uris: Vec<RedisUri> = pending.iter().map(|(_, uri)| uri.clone()).collect();
        info!("adding {} replica(s)", uris.len());
        add_nodes_to_cluster(&self.ctx.client, &uris).await;
        tokio::time::sleep(self.ctx.config.pipeline.refresh_timeout).await;

        let nodes = match self.ctx.client.topology().await {
            Ok(nodes) => nodes,
            Err(e) => {
                for (mut task, _) in pending {
                    task.reply_err(&e);
                }
                return;
            }
        };
        // Resolve each new node against the settled topology.
        let mut resolved: Vec<(Task, NodeInfo)> = Vec::new();
        for (mut task, uri) in pending {
            match topology::canonicalize(&uri, &nodes) {
                Ok(node) => resolved.push((task, node)),
                Err(e) => task.reply_err(e),
            }
        }
        if resolved.is_empty() {
            return;
        }

        // Candidate masters exclude the nodes being placed right now: a
        // freshly-met node reports as an empty master until it replicates.
        let placing: HashSet<&str> = resolved.iter().map(|(_, n)| n.id.as_str()).collect();
        let masters: Vec<NodeInfo> = topology::masters(&nodes)
            .into_iter()
            .filter(|m| !placing.contains(m.id.as_str()))
            .collect();
        if masters.is_empty() {
            for (mut task, _) in resolved {
                task.reply_err("cluster has no masters to follow");
            }
            return;
        }

        // Replica counts per master at the start of the batch; the nodes
        // being placed right now are not counted.
        let mut replica_counts: HashMap<&str, usize> = HashMap::new();
        for node in &nodes {
            if placing.contains(node.id.as_str()) {
                continue;
            }
            if let Some(master_id) = &node.replica_of {
                *replica_counts.entry(master_id.as_str()).or_default() += 1;
            }
        }

        let mut poorest = PoorestN::new(resolved.len().min(masters.len()));
        for master in &masters {
            poorest.offer(
                &master.id,
                replica_counts.get(master.id.as_str()).copied().unwrap_or(0),
            );
        }
        let selected = poorest.into_sorted();

        let mut outcomes: Vec<(Task, Result<String, ShepherdError>)> = Vec::new();
        for (i, (task, node)) in resolved.into_iter().enumerate() {
            let master_id = &selected[i % selected.len()];
            let outcome = async {
                let conn = self.ctx.client.connection(&node).await?;
                conn.cluster_replicate(master_id).await?;
                Ok::<_, ShepherdError>(node.host.clone())
            }
            .await;
            if outcome.is_ok() {
                info!("{} now replicates {}", node.addr(), master_id);
            }
            outcomes.push((task, outcome));
        }

        tokio::time::sleep(self.ctx.config.pipeline.refresh_timeout).await;
        for (mut task, outcome) in outcomes {
            match outcome {
                Ok(host) => task.reply_ok("replica", &host),
                Err(e) => task.reply_err(e),
            }
        }
    }
}

/// Decides what removing a node means: masters must drain through a
/// synthesized reshard before they can be forgotten, replicas go straight
/// to the removal stage.
pub struct RemoveNodeStage {
    pub ctx: StageContext,
    pub remove_replica: mpsc::Sender<Task>,
}

impl RemoveNodeStage {
    pub async fn run(self, mut rx: mpsc::Receiver<Task>, mut shutdown: broadcast::Receiver<()>) {
        info!("remove-node stage started");
        loop {
            let task = tokio::select! {
                _ = shutdown.recv() => {
                    info!("remove-node stage shutting down");
                    return;
                }
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => return,
                },
            };
            self.handle(task).await;
        }
    }

    async fn handle(&self, mut task: Task) {
        let uri = match RedisUri::parse(&task.target, self.ctx.config.cluster.server_port) {
            Ok(uri) => uri,
            Err(e) => {
                task.reply_err(e);
                return;
            }
        };
        let nodes = match self.ctx.client.topology().await {
            Ok(nodes) => nodes,
            Err(e) => {
                task.reply_err(e);
                return;
            }
        };
        let node = match topology::canonicalize(&uri, &nodes) {
            Ok(node) => node,
            Err(e) => {
                task.reply_err(e);
                return;
            }
        };

        if node.is_master() {
            info!(
                "removing master {} requires draining {} slot(s) first",
                node.addr(),
                node.slots.len()
            );
            let reshard = Task {
                op: TaskOp::Reshard.to_string(),
                target: task.target.clone(),
                reply_to: task.reply_to.take(),
                new_master_uri: None,
                retiring_uri: Some(node.uri()),
            };
            if self.ctx.feedback.send(reshard).await.is_err() {
                warn!("pipeline closed; dropped synthesized drain reshard");
            }
        } else if self.remove_replica.send(task).await.is_err() {
            warn!("remove-replica stage closed; dropping task");
        }
    }
}

/// Removes a batch of replicas: reset each, then fan the forget out to
/// every remaining node.
pub struct RemoveReplicaStage {
    pub ctx: StageContext,
}

impl RemoveReplicaStage {
    pub async fn run(self, mut rx: mpsc::Receiver<Task>, mut shutdown: broadcast::Receiver<()>) {
        info!("remove-replica stage started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("remove-replica stage shutting down");
                    return;
                }
                batch = next_batch(&mut rx, REMOVE_REPLICA_BATCH, self.ctx.config.pipeline.batch_period) => {
                    let Some(batch) = batch else { return };
                    self.handle(batch).await;
                }
            }
        }
    }

    async fn handle(&self, batch: Vec<Task>) {
        let nodes = match self.ctx.client.topology().await {
            Ok(nodes) => nodes,
            Err(e) => {
                for mut task in batch {
                    task.reply_err(&e);
                }
                return;
            }
        };

        let mut departing: Vec<NodeInfo> = Vec::new();
        for mut task in batch {
            let uri = match RedisUri::parse(&task.target, self.ctx.config.cluster.server_port) {
                Ok(uri) => uri,
                Err(e) => {
                    task.reply_err(e);
                    continue;
                }
            };
            match topology::canonicalize(&uri, &nodes) {
                Ok(node) => departing.push(node),
                Err(e) => task.reply_err(e),
            }
            // Replica removal has no terminal signal; the handle drops here.
        }
        if departing.is_empty() {
            return;
        }

        info!("removing {} replica(s)", departing.len());
        forget_nodes(&self.ctx.client, &nodes, &departing).await;
        tokio::time::sleep(self.ctx.config.pipeline.refresh_timeout).await;

        match self.ctx.client.topology().await {
            Ok(after) => {
                let masters = topology::masters(&after).len();
                info!(
                    "topology after removal: {} node(s), {} master(s), {} replica(s)",
                    after.len(),
                    masters,
                    after.len() - masters
                );
            }
            Err(e) => warn!("could not re-read topology after removal: {}", e),
        }
    }
}

/// Runs reshards one at a time, shaped to the configured interval. Handles
/// both directions: rebalancing toward a new master and draining a
/// retiring one before it is forgotten.
pub struct ReshardStage {
    pub ctx: StageContext,
}

impl ReshardStage {
    pub async fn run(self, mut rx: mpsc::Receiver<Task>, mut shutdown: broadcast::Receiver<()>) {
        info!("reshard stage started");
        let mut last_reshard: Option<Instant> = None;
        loop {
            let task = tokio::select! {
                _ = shutdown.recv() => {
                    info!("reshard stage shutting down");
                    return;
                }
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => return,
                },
            };

            // Shaping, not dropping: hold the task until the interval since
            // the previous reshard has elapsed.
            if let Some(previous) = last_reshard {
                let interval = self.ctx.config.pipeline.reshard_interval;
                let elapsed = previous.elapsed();
                if elapsed < interval {
                    debug!("holding reshard for {:?}", interval - elapsed);
                    tokio::time::sleep(interval - elapsed).await;
                }
            }
            last_reshard = Some(Instant::now());

            self.handle(task).await;
        }
    }

    async fn handle(&self, mut task: Task) {
        let result = if let Some(retiring) = task.retiring_uri.clone() {
            self.drain_retiring(&retiring).await
        } else {
            let uri = match task.new_master_uri.clone() {
                Some(uri) => Ok(uri),
                None => RedisUri::parse(&task.target, self.ctx.config.cluster.server_port),
            };
            match uri {
                Ok(uri) => self.rebalance(&uri).await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(host) => task.reply_ok("master", &host),
            Err(e) => {
                warn!("reshard failed: {}", e);
                task.reply_err(e);
            }
        }
    }

    /// A rejected plan usually means the topology has not settled yet;
    /// re-running the whole reshard re-reads it. Anything else surfaces.
    async fn rebalance(&self, uri: &RedisUri) -> Result<String, ShepherdError> {
        loop {
            match self.try_rebalance(uri).await {
                Err(ShepherdError::ReshardTable(reason)) => {
                    warn!("reshard plan rejected ({}); retrying", reason);
                    tokio::time::sleep(RESHARD_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn try_rebalance(&self, uri: &RedisUri) -> Result<String, ShepherdError> {
        let nodes = self.ctx.client.topology().await?;
        let target = topology::canonicalize(uri, &nodes)?;
        let masters = with_node(topology::masters(&nodes), &target);

        let cache = Arc::new(ConnectionCache::build(&self.ctx.client, &masters).await?);
        self.await_cluster_ok(&target).await?;

        let table = rebalance_toward(&masters, &target.id)?;
        info!(
            "resharding {} slot(s) from {} source(s) toward {}",
            table.slot_count(),
            table.moves.len(),
            target.addr()
        );
        self.route(table.into_moves(&target), cache, masters).await?;
        Ok(target.host)
    }

    async fn drain_retiring(&self, uri: &RedisUri) -> Result<String, ShepherdError> {
        loop {
            match self.try_drain(uri).await {
                Err(ShepherdError::ReshardTable(reason)) => {
                    warn!("drain plan rejected ({}); retrying", reason);
                    tokio::time::sleep(RESHARD_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn try_drain(&self, uri: &RedisUri) -> Result<String, ShepherdError> {
        let nodes = self.ctx.client.topology().await?;
        let retiring = topology::canonicalize(uri, &nodes)?;
        let masters = topology::masters(&nodes);
        let remaining: Vec<NodeInfo> = masters
            .iter()
            .filter(|n| n.id != retiring.id)
            .cloned()
            .collect();

        let moves = drain(&retiring, &remaining)?;
        info!(
            "draining {} slot(s) from retiring master {}",
            moves.len(),
            retiring.addr()
        );

        let cache = Arc::new(ConnectionCache::build(&self.ctx.client, &masters).await?);
        self.route(moves, cache, masters).await?;

        tokio::time::sleep(self.ctx.config.pipeline.refresh_timeout).await;
        forget_nodes(&self.ctx.client, &nodes, std::slice::from_ref(&retiring)).await;
        Ok(retiring.host)
    }

    async fn route(
        &self,
        moves: Vec<SlotMove>,
        cache: Arc<ConnectionCache>,
        masters: Vec<NodeInfo>,
    ) -> Result<usize, ShepherdError> {
        let migrator = Arc::new(SlotMigrator::new(
            cache,
            masters,
            self.ctx.config.pipeline.migrate_slot_timeout,
        ));
        let router = MigrationRouter::new(self.ctx.config.pipeline.reshard_timeout);
        router
            .run(moves, move |slot_move| {
                let migrator = migrator.clone();
                async move {
                    migrator
                        .migrate_slot(
                            slot_move.slot,
                            &slot_move.source_id,
                            &slot_move.destination_id,
                            &slot_move.destination,
                        )
                        .await
                }
            })
            .await
    }

    /// Blocks until the node reports `cluster_state:ok`, polling CLUSTER
    /// INFO. A node fresh out of MEET needs a few gossip rounds before it
    /// agrees with the rest of the cluster.
    async fn await_cluster_ok(&self, node: &NodeInfo) -> Result<(), ShepherdError> {
        let conn = self.ctx.client.connection(node).await?;
        let mut polls = 0u32;
        loop {
            match conn.cluster_info().await {
                Ok(info) if info.get("cluster_state").map(String::as_str) == Some("ok") => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!("CLUSTER INFO on {} failed while settling: {}", node.addr(), e),
            }
            polls += 1;
            if polls % 50 == 0 {
                info!("still waiting for {} to report cluster_state ok", node.addr());
            }
            tokio::time::sleep(CLUSTER_OK_POLL_INTERVAL).await;
        }
    }
}

fn with_node(mut masters: Vec<NodeInfo>, node: &NodeInfo) -> Vec<NodeInfo> {
    if !masters.iter().any(|n| n.id == node.id) {
        masters.push(node.clone());
    }
    masters
}
