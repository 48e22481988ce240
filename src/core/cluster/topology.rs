// src/core/cluster/topology.rs

//! The cluster topology model: node descriptions parsed from `CLUSTER NODES`
//! output, plus the URI handling used to match caller-supplied addresses
//! against live topology entries.

use crate::core::ShepherdError;
use std::fmt;

/// Total number of hash slots in a Redis Cluster.
pub const NUM_SLOTS: u16 = 16384;

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Replica,
}

/// A resolved `host:port` address of a cluster node.
///
/// Accepts the forms `host`, `host:port`, and `redis://host[:port]`; a bare
/// host takes the cluster-wide default port. `localhost` is normalized to
/// `127.0.0.1` so equality checks against topology entries succeed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedisUri {
    pub host: String,
    pub port: u16,
}

impl RedisUri {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: normalize_host(&host.into()),
            port,
        }
    }

    /// Parses a caller-supplied address, falling back to `default_port` when
    /// the input carries no port of its own.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, ShepherdError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ShepherdError::InvalidUri(input.to_string()));
        }

        if trimmed.contains("://") {
            let parsed = url::Url::parse(trimmed)
                .map_err(|_| ShepherdError::InvalidUri(input.to_string()))?;
            if parsed.scheme() != "redis" {
                return Err(ShepherdError::InvalidUri(input.to_string()));
            }
            let host = parsed
                .host_str()
                .ok_or_else(|| ShepherdError::InvalidUri(input.to_string()))?;
            return Ok(Self::new(host, parsed.port().unwrap_or(default_port)));
        }

        match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ShepherdError::InvalidUri(input.to_string()))?;
                if host.is_empty() {
                    return Err(ShepherdError::InvalidUri(input.to_string()));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(trimmed, default_port)),
        }
    }
}

impl fmt::Display for RedisUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn normalize_host(host: &str) -> String {
    if host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

/// An immutable snapshot of one node as reported by `CLUSTER NODES`.
/// Stages re-read the topology whenever they need a fresh view; a snapshot
/// is never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The unique 40-character hexadecimal run ID of the node.
    pub id: String,
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    /// Whether the reporting node's link to this node is up.
    pub connected: bool,
    /// For replicas, the node ID of the master being followed.
    pub replica_of: Option<String>,
    /// Hash slots this node owns, in ascending order.
    pub slots: Vec<u16>,
}

impl NodeInfo {
    pub fn uri(&self) -> RedisUri {
        RedisUri::new(self.host.clone(), self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

/// Filters a topology snapshot down to its masters.
pub fn masters(topology: &[NodeInfo]) -> Vec<NodeInfo> {
    topology.iter().filter(|n| n.is_master()).cloned().collect()
}

/// Rewrites a caller-supplied URI to the canonical topology entry it names.
/// Fails with `NodeNotInCluster` when no entry matches, so callers can relay
/// the failure verbatim.
pub fn canonicalize(uri: &RedisUri, topology: &[NodeInfo]) -> Result<NodeInfo, ShepherdError> {
    topology
        .iter()
        .find(|n| n.host == uri.host && n.port == uri.port)
        .cloned()
        .ok_or_else(|| ShepherdError::NodeNotInCluster(uri.to_string()))
}

/// Parses the bulk reply of `CLUSTER NODES` into a topology snapshot.
///
/// Line format:
/// `<id> <ip:port@busport> <flags> <master|-> <ping> <pong> <epoch> <state> <slot>...`
/// Bracketed slot tokens describe in-flight migrations and are skipped.
pub fn parse_cluster_nodes(raw: &str) -> Result<Vec<NodeInfo>, ShepherdError> {
    let mut nodes = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(ShepherdError::Protocol(format!(
                "malformed CLUSTER NODES line '{line}'"
            )));
        }

        let id = fields[0].to_string();
        let addr = fields[1].split('@').next().unwrap_or(fields[1]);
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (
                normalize_host(host),
                port.parse::<u16>().map_err(|_| {
                    ShepherdError::Protocol(format!("invalid node address '{addr}'"))
                })?,
            ),
            None => {
                return Err(ShepherdError::Protocol(format!(
                    "invalid node address '{addr}'"
                )));
            }
        };

        let flags = fields[2];
        let role = if flags.split(',').any(|f| f == "master") {
            NodeRole::Master
        } else {
            NodeRole::Replica
        };

        let replica_of = match fields[3] {
            "-" => None,
            master_id => Some(master_id.to_string()),
        };

        let connected = fields[7] == "connected";

        let mut slots = Vec::new();
        for token in &fields[8..] {
            // Importing/migrating markers like `[93->-<id>]` are transient.
            if token.starts_with('[') {
                continue;
            }
            match token.split_once('-') {
                Some((start, end)) => {
                    let start = parse_slot(start, line)?;
                    let end = parse_slot(end, line)?;
                    slots.extend(start..=end);
                }
                None => slots.push(parse_slot(token, line)?),
            }
        }
        slots.sort_unstable();

        nodes.push(NodeInfo {
            id,
            host,
            port,
            role,
            connected,
            replica_of,
            slots,
        });
    }

    Ok(nodes)
}

fn parse_slot(token: &str, line: &str) -> Result<u16, ShepherdError> {
    let slot = token
        .parse::<u16>()
        .map_err(|_| ShepherdError::Protocol(format!("invalid slot token in '{line}'")))?;
    if slot >= NUM_SLOTS {
        return Err(ShepherdError::Protocol(format!(
            "slot {slot} out of range in '{line}'"
        )));
    }
    Ok(slot)
}
