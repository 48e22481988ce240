// tests/support/mock_cluster.rs

//! An in-memory cluster double implementing the client traits, with a
//! scriptable failure queue and a full command log for assertions.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use shepherd::config::Config;
use shepherd::core::ShepherdError;
use shepherd::core::cluster::client::{ClusterClient, NodeConnection};
use shepherd::core::cluster::topology::{NodeInfo, NodeRole, RedisUri};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builds a master node owning the given slots.
pub fn master(id: &str, host: &str, port: u16, slots: Vec<u16>) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        host: host.to_string(),
        port,
        role: NodeRole::Master,
        connected: true,
        replica_of: None,
        slots,
    }
}

/// Builds a replica following the given master.
pub fn replica(id: &str, host: &str, port: u16, master_id: &str) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        host: host.to_string(),
        port,
        role: NodeRole::Replica,
        connected: true,
        replica_of: Some(master_id.to_string()),
        slots: Vec::new(),
    }
}

pub fn slot_range(start: u16, end: u16) -> Vec<u16> {
    (start..=end).collect()
}

/// A pipeline configuration with short waits, for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.cluster.seed_servers = vec!["127.0.0.1".to_string()];
    config.cluster.refresh_interval = Duration::from_secs(3600);
    config.pipeline.refresh_timeout = Duration::from_millis(20);
    config.pipeline.batch_period = Duration::from_millis(50);
    config.pipeline.reshard_interval = Duration::from_millis(10);
    config.pipeline.reshard_timeout = Duration::from_secs(5);
    config.pipeline.migrate_slot_timeout = Duration::from_secs(1);
    config
}

#[derive(Default)]
struct MockState {
    nodes: Vec<NodeInfo>,
    /// Nodes reachable on the network but not yet part of the cluster.
    pending: Vec<NodeInfo>,
    /// Keys per (node id, slot).
    keys: HashMap<(String, u16), Vec<Bytes>>,
    /// Scripted topology snapshots served before the live state.
    scripted: VecDeque<Vec<NodeInfo>>,
    /// One-shot failures keyed by (node id, command name).
    failures: HashMap<(String, String), VecDeque<ShepherdError>>,
    /// Every command issued, as (node id, rendered command).
    log: Vec<(String, String)>,
}

impl MockState {
    fn take_failure(&mut self, node_id: &str, command: &str) -> Option<ShepherdError> {
        self.failures
            .get_mut(&(node_id.to_string(), command.to_string()))
            .and_then(VecDeque::pop_front)
    }

    fn record(&mut self, node_id: &str, command: String) {
        self.log.push((node_id.to_string(), command));
    }
}

/// The shared cluster double. Connections mutate the same state, so a
/// SETSLOT NODE issued anywhere is visible to every later topology read.
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
}

impl MockCluster {
    pub fn new(nodes: Vec<NodeInfo>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState {
                nodes,
                ..MockState::default()
            })),
        })
    }

    /// Registers a node that joins the cluster once someone MEETs it.
    pub fn add_pending(&self, node: NodeInfo) {
        self.state.lock().unwrap().pending.push(node);
    }

    /// Queues a topology snapshot to serve before the live state.
    pub fn push_topology(&self, snapshot: Vec<NodeInfo>) {
        self.state.lock().unwrap().scripted.push_back(snapshot);
    }

    /// Arms a one-shot failure for the next `command` on `node_id`.
    pub fn inject_failure(&self, node_id: &str, command: &str, error: ShepherdError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry((node_id.to_string(), command.to_string()))
            .or_default()
            .push_back(error);
    }

    pub fn set_keys(&self, node_id: &str, slot: u16, keys: Vec<&str>) {
        self.state.lock().unwrap().keys.insert(
            (node_id.to_string(), slot),
            keys.into_iter().map(|k| Bytes::from(k.to_string())).collect(),
        );
    }

    pub fn keys_of(&self, node_id: &str, slot: u16) -> Vec<Bytes> {
        self.state
            .lock()
            .unwrap()
            .keys
            .get(&(node_id.to_string(), slot))
            .cloned()
            .unwrap_or_default()
    }

    pub fn log(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().log.clone()
    }

    /// Commands issued on one node, rendered.
    pub fn commands_for(&self, node_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Number of log entries whose rendered command starts with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(_, cmd)| cmd.starts_with(prefix))
            .count()
    }

    pub fn topology_now(&self) -> Vec<NodeInfo> {
        self.state.lock().unwrap().nodes.clone()
    }

    pub fn node(&self, node_id: &str) -> Option<NodeInfo> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
    }

    pub fn slots_of(&self, node_id: &str) -> usize {
        self.node(node_id).map(|n| n.slots.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn topology(&self) -> Result<Vec<NodeInfo>, ShepherdError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.take_failure("seed", "topology") {
            return Err(error);
        }
        if let Some(snapshot) = state.scripted.pop_front() {
            return Ok(snapshot);
        }
        Ok(state.nodes.clone())
    }

    async fn connection(
        &self,
        node: &NodeInfo,
    ) -> Result<Arc<dyn NodeConnection>, ShepherdError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.take_failure(&node.id, "connect") {
            return Err(error);
        }
        Ok(Arc::new(MockConnection {
            node_id: node.id.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    node_id: String,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Records the command, then either fails with an armed error or runs
    /// `apply` against the shared state.
    fn perform<T>(
        &self,
        command: &str,
        rendered: String,
        apply: impl FnOnce(&mut MockState) -> T,
    ) -> Result<T, ShepherdError> {
        let mut state = self.state.lock().unwrap();
        state.record(&self.node_id, rendered);
        if let Some(error) = state.take_failure(&self.node_id, command) {
            return Err(error);
        }
        Ok(apply(&mut state))
    }
}

#[async_trait]
impl NodeConnection for MockConnection {
    async fn cluster_meet(&self, host: &str, port: u16) -> Result<(), ShepherdError> {
        self.perform("meet", format!("meet {host}:{port}"), |state| {
            if state.nodes.iter().any(|n| n.host == host && n.port == port) {
                return;
            }
            if let Some(pos) = state
                .pending
                .iter()
                .position(|n| n.host == host && n.port == port)
            {
                let node = state.pending.remove(pos);
                state.nodes.push(node);
            }
        })
    }

    async fn cluster_forget(&self, node_id: &str) -> Result<(), ShepherdError> {
        self.perform("forget", format!("forget {node_id}"), |state| {
            state.nodes.retain(|n| n.id != node_id);
        })
    }

    async fn cluster_reset_hard(&self) -> Result<(), ShepherdError> {
        let node_id = self.node_id.clone();
        self.perform("reset", "reset hard".to_string(), move |state| {
            if let Some(node) = state.nodes.iter_mut().find(|n| n.id == node_id) {
                node.slots.clear();
                node.replica_of = None;
            }
        })
    }

    async fn cluster_replicate(&self, master_id: &str) -> Result<(), ShepherdError> {
        let node_id = self.node_id.clone();
        let master_id = master_id.to_string();
        self.perform("replicate", format!("replicate {master_id}"), move |state| {
            if let Some(node) = state.nodes.iter_mut().find(|n| n.id == node_id) {
                node.role = NodeRole::Replica;
                node.replica_of = Some(master_id);
                node.slots.clear();
            }
        })
    }

    async fn cluster_setslot_importing(
        &self,
        slot: u16,
        source_id: &str,
    ) -> Result<(), ShepherdError> {
        self.perform(
            "setslot_importing",
            format!("setslot_importing {slot} {source_id}"),
            |_| (),
        )
    }

    async fn cluster_setslot_migrating(
        &self,
        slot: u16,
        destination_id: &str,
    ) -> Result<(), ShepherdError> {
        self.perform(
            "setslot_migrating",
            format!("setslot_migrating {slot} {destination_id}"),
            |_| (),
        )
    }

    async fn cluster_setslot_node(&self, slot: u16, owner_id: &str) -> Result<(), ShepherdError> {
        let owner_id = owner_id.to_string();
        self.perform(
            "setslot_node",
            format!("setslot_node {slot} {owner_id}"),
            move |state| {
                for node in state.nodes.iter_mut() {
                    node.slots.retain(|s| *s != slot);
                }
                if let Some(owner) = state.nodes.iter_mut().find(|n| n.id == owner_id) {
                    owner.slots.push(slot);
                    owner.slots.sort_unstable();
                }
            },
        )
    }

    async fn cluster_count_keys_in_slot(&self, slot: u16) -> Result<i64, ShepherdError> {
        let node_id = self.node_id.clone();
        self.perform("countkeys", format!("countkeys {slot}"), move |state| {
            state
                .keys
                .get(&(node_id, slot))
                .map(|keys| keys.len() as i64)
                .unwrap_or(0)
        })
    }

    async fn cluster_get_keys_in_slot(
        &self,
        slot: u16,
        _count: i64,
    ) -> Result<Vec<Bytes>, ShepherdError> {
        let node_id = self.node_id.clone();
        self.perform("getkeys", format!("getkeys {slot}"), move |state| {
            state.keys.get(&(node_id, slot)).cloned().unwrap_or_default()
        })
    }

    async fn migrate(
        &self,
        destination: &RedisUri,
        keys: Vec<Bytes>,
        replace: bool,
        _timeout: Duration,
    ) -> Result<(), ShepherdError> {
        let node_id = self.node_id.clone();
        let destination = destination.clone();
        self.perform(
            "migrate",
            format!("migrate {destination} keys={} replace={replace}", keys.len()),
            move |state| {
                let destination_id = state
                    .nodes
                    .iter()
                    .find(|n| n.host == destination.host && n.port == destination.port)
                    .map(|n| n.id.clone());
                let Some(destination_id) = destination_id else {
                    return;
                };
                // Move the requested keys out of this node's slots.
                let slots: Vec<u16> = state
                    .keys
                    .keys()
                    .filter(|(id, _)| *id == node_id)
                    .map(|(_, slot)| *slot)
                    .collect();
                for slot in slots {
                    let moved: Vec<Bytes> = {
                        let held = state.keys.get_mut(&(node_id.clone(), slot)).unwrap();
                        let moved = held
                            .iter()
                            .filter(|k| keys.contains(k))
                            .cloned()
                            .collect::<Vec<_>>();
                        held.retain(|k| !keys.contains(k));
                        moved
                    };
                    if !moved.is_empty() {
                        state
                            .keys
                            .entry((destination_id.clone(), slot))
                            .or_default()
                            .extend(moved);
                    }
                }
            },
        )
    }

    async fn cluster_info(&self) -> Result<HashMap<String, String>, ShepherdError> {
        self.perform("cluster_info", "cluster_info".to_string(), |_| {
            let mut info = HashMap::new();
            info.insert("cluster_state".to_string(), "ok".to_string());
            info
        })
    }
}
