// src/core/cluster/client.rs

//! The `ClusterClient` capability: a thin, connection-pooling adapter over
//! the RESP wire exposing exactly the commands the control plane issues.
//! Retry policy is never implemented here; it belongs to the callers.

use crate::config::ClusterConfig;
use crate::core::ShepherdError;
use crate::core::cluster::topology::{NodeInfo, RedisUri, parse_cluster_nodes};
use crate::core::protocol::{RespFrame, RespFrameCodec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

// Timeout constants for robust network operations.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// A live command connection to one cluster node.
///
/// Implementations must be safe for concurrent use: the migration router
/// shares connections across its workers.
#[async_trait]
pub trait NodeConnection: Send + Sync {
    async fn cluster_meet(&self, host: &str, port: u16) -> Result<(), ShepherdError>;
    async fn cluster_forget(&self, node_id: &str) -> Result<(), ShepherdError>;
    async fn cluster_reset_hard(&self) -> Result<(), ShepherdError>;
    async fn cluster_replicate(&self, master_id: &str) -> Result<(), ShepherdError>;
    async fn cluster_setslot_importing(
        &self,
        slot: u16,
        source_id: &str,
    ) -> Result<(), ShepherdError>;
    async fn cluster_setslot_migrating(
        &self,
        slot: u16,
        destination_id: &str,
    ) -> Result<(), ShepherdError>;
    async fn cluster_setslot_node(&self, slot: u16, owner_id: &str) -> Result<(), ShepherdError>;
    async fn cluster_count_keys_in_slot(&self, slot: u16) -> Result<i64, ShepherdError>;
    async fn cluster_get_keys_in_slot(
        &self,
        slot: u16,
        count: i64,
    ) -> Result<Vec<Bytes>, ShepherdError>;
    /// Moves `keys` to `destination` in a single `MIGRATE` call, bounded by
    /// `timeout`. Exhausting the deadline is a `SlotMigration` error, which
    /// deliberately falls outside the classified recovery set.
    async fn migrate(
        &self,
        destination: &RedisUri,
        keys: Vec<Bytes>,
        replace: bool,
        timeout: Duration,
    ) -> Result<(), ShepherdError>;
    async fn cluster_info(&self) -> Result<HashMap<String, String>, ShepherdError>;
}

/// The abstract cluster capability the pipeline is written against.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Current cluster view, re-read from a seed node on every call.
    async fn topology(&self) -> Result<Vec<NodeInfo>, ShepherdError>;
    /// Idempotent, pooled connection to the given topology entry.
    async fn connection(&self, node: &NodeInfo) -> Result<Arc<dyn NodeConnection>, ShepherdError>;
}

/// Per-reshard connection cache keyed by node ID.
///
/// Built once at reshard start and read-only afterwards, so the migration
/// workers can share it without synchronization.
pub struct ConnectionCache {
    connections: HashMap<String, Arc<dyn NodeConnection>>,
}

impl ConnectionCache {
    pub async fn build(
        client: &Arc<dyn ClusterClient>,
        nodes: &[NodeInfo],
    ) -> Result<Self, ShepherdError> {
        let mut connections = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let conn = client.connection(node).await?;
            connections.insert(node.id.clone(), conn);
        }
        Ok(Self { connections })
    }

    /// A cache miss means the migration was handed a node the reshard never
    /// connected to; that is unrecoverable from the slot's perspective.
    pub fn get(&self, node_id: &str) -> Result<Arc<dyn NodeConnection>, ShepherdError> {
        self.connections
            .get(node_id)
            .cloned()
            .ok_or_else(|| {
                ShepherdError::SlotMigration(format!("no cached connection for node {node_id}"))
            })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// The wire-level state behind one pooled connection.
struct RespStream {
    stream: TcpStream,
    codec: RespFrameCodec,
    read_buf: BytesMut,
}

/// A RESP connection to a single node. All commands serialize through an
/// internal mutex, which makes the handle safe to share between workers.
pub struct RespConnection {
    addr: String,
    inner: Mutex<RespStream>,
}

impl RespConnection {
    /// Creates a TCP connection to the target node's address with a timeout.
    /// Hostnames resolve through the standard lookup.
    pub async fn connect(addr: String) -> Result<Self, ShepherdError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ShepherdError::ClusterClient(format!("connect timeout for {addr}"))
            })??;
        Ok(Self {
            addr,
            inner: Mutex::new(RespStream {
                stream,
                codec: RespFrameCodec,
                read_buf: BytesMut::with_capacity(4096),
            }),
        })
    }

    /// Sends a single command frame and waits for a single reply frame.
    /// An error reply from the node surfaces as `ClusterClient` carrying the
    /// node's own error string, which is what the recovery tables match on.
    async fn request(&self, frame: RespFrame) -> Result<RespFrame, ShepherdError> {
        let mut guard = self.inner.lock().await;

        // 1. Encode the command into a byte buffer.
        let mut write_buf = BytesMut::new();
        guard.codec.encode(frame, &mut write_buf)?;

        // 2. Send the buffer to the target node with a write timeout.
        let write_fut = guard.stream.write_all(&write_buf);
        tokio::time::timeout(WRITE_TIMEOUT, write_fut)
            .await
            .map_err(|_| {
                ShepherdError::ClusterClient(format!("write timeout for {}", self.addr))
            })??;

        // 3. Read the reply in a loop until a full frame decodes.
        loop {
            if let Some(reply) = {
                let RespStream { codec, read_buf, .. } = &mut *guard;
                codec.decode(read_buf)?
            } {
                return match reply {
                    RespFrame::Error(e) => Err(ShepherdError::ClusterClient(e)),
                    other => Ok(other),
                };
            }

            let RespStream { stream, read_buf, .. } = &mut *guard;
            match tokio::time::timeout(READ_TIMEOUT, stream.read_buf(read_buf)).await {
                Ok(Ok(0)) => {
                    return Err(ShepherdError::ClusterClient(format!(
                        "connection to {} closed by peer",
                        self.addr
                    )));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(ShepherdError::ClusterClient(format!(
                        "read timeout for {}",
                        self.addr
                    )));
                }
            }
        }
    }

    async fn request_ok(&self, frame: RespFrame) -> Result<(), ShepherdError> {
        match self.request(frame).await? {
            RespFrame::SimpleString(s) if s.eq_ignore_ascii_case("OK") => Ok(()),
            other => Err(ShepherdError::ClusterClient(format!(
                "unexpected reply: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl NodeConnection for RespConnection {
    async fn cluster_meet(&self, host: &str, port: u16) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"MEET"),
            Bytes::from(host.to_string()),
            Bytes::from(port.to_string()),
        ]))
        .await
    }

    async fn cluster_forget(&self, node_id: &str) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"FORGET"),
            Bytes::from(node_id.to_string()),
        ]))
        .await
    }

    async fn cluster_reset_hard(&self) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"RESET"),
            Bytes::from_static(b"HARD"),
        ]))
        .await
    }

    async fn cluster_replicate(&self, master_id: &str) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"REPLICATE"),
            Bytes::from(master_id.to_string()),
        ]))
        .await
    }

    async fn cluster_setslot_importing(
        &self,
        slot: u16,
        source_id: &str,
    ) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"SETSLOT"),
            Bytes::from(slot.to_string()),
            Bytes::from_static(b"IMPORTING"),
            Bytes::from(source_id.to_string()),
        ]))
        .await
    }

    async fn cluster_setslot_migrating(
        &self,
        slot: u16,
        destination_id: &str,
    ) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"SETSLOT"),
            Bytes::from(slot.to_string()),
            Bytes::from_static(b"MIGRATING"),
            Bytes::from(destination_id.to_string()),
        ]))
        .await
    }

    async fn cluster_setslot_node(&self, slot: u16, owner_id: &str) -> Result<(), ShepherdError> {
        self.request_ok(RespFrame::command([
            Bytes::from_static(b"CLUSTER"),
            Bytes::from_static(b"SETSLOT"),
            Bytes::from(slot.to_string()),
            Bytes::from_static(b"NODE"),
            Bytes::from(owner_id.to_string()),
        ]))
        .await
    }

    async fn cluster_count_keys_in_slot(&self, slot: u16) -> Result<i64, ShepherdError> {
        match self
            .request(RespFrame::command([
                Bytes::from_static(b"CLUSTER"),
                Bytes::from_static(b"COUNTKEYSINSLOT"),
                Bytes::from(slot.to_string()),
            ]))
            .await?
        {
            RespFrame::Integer(count) => Ok(count),
            other => Err(ShepherdError::ClusterClient(format!(
                "unexpected COUNTKEYSINSLOT reply: {other:?}"
            ))),
        }
    }

    async fn cluster_get_keys_in_slot(
        &self,
        slot: u16,
        count: i64,
    ) -> Result<Vec<Bytes>, ShepherdError> {
        match self
            .request(RespFrame::command([
                Bytes::from_static(b"CLUSTER"),
                Bytes::from_static(b"GETKEYSINSLOT"),
                Bytes::from(slot.to_string()),
                Bytes::from(count.to_string()),
            ]))
            .await?
        {
            RespFrame::Array(frames) => frames
                .into_iter()
                .map(|frame| match frame {
                    RespFrame::BulkString(key) => Ok(key),
                    other => Err(ShepherdError::ClusterClient(format!(
                        "unexpected GETKEYSINSLOT element: {other:?}"
                    ))),
                })
                .collect(),
            other => Err(ShepherdError::ClusterClient(format!(
                "unexpected GETKEYSINSLOT reply: {other:?}"
            ))),
        }
    }

    async fn migrate(
        &self,
        destination: &RedisUri,
        keys: Vec<Bytes>,
        replace: bool,
        timeout: Duration,
    ) -> Result<(), ShepherdError> {
        let mut parts = vec![
            Bytes::from_static(b"MIGRATE"),
            Bytes::from(destination.host.clone()),
            Bytes::from(destination.port.to_string()),
            // Empty key plus a KEYS clause selects the multi-key form.
            Bytes::from_static(b""),
            Bytes::from_static(b"0"),
            Bytes::from(timeout.as_millis().to_string()),
        ];
        if replace {
            parts.push(Bytes::from_static(b"REPLACE"));
        }
        parts.push(Bytes::from_static(b"KEYS"));
        parts.extend(keys);

        let reply = tokio::time::timeout(timeout, self.request(RespFrame::command(parts)))
            .await
            .map_err(|_| {
                ShepherdError::SlotMigration(format!(
                    "MIGRATE to {destination} did not finish within {timeout:?}"
                ))
            })?;

        match reply? {
            // NOKEY means the keys vanished between GETKEYS and MIGRATE,
            // which counts as moved.
            RespFrame::SimpleString(s)
                if s.eq_ignore_ascii_case("OK") || s.eq_ignore_ascii_case("NOKEY") =>
            {
                Ok(())
            }
            other => Err(ShepherdError::ClusterClient(format!(
                "unexpected MIGRATE reply: {other:?}"
            ))),
        }
    }

    async fn cluster_info(&self) -> Result<HashMap<String, String>, ShepherdError> {
        match self
            .request(RespFrame::command([
                Bytes::from_static(b"CLUSTER"),
                Bytes::from_static(b"INFO"),
            ]))
            .await?
        {
            RespFrame::BulkString(raw) => {
                let text = String::from_utf8_lossy(&raw);
                let mut info = HashMap::new();
                for line in text.lines() {
                    if let Some((key, value)) = line.split_once(':') {
                        info.insert(key.trim().to_string(), value.trim().to_string());
                    }
                }
                Ok(info)
            }
            other => Err(ShepherdError::ClusterClient(format!(
                "unexpected CLUSTER INFO reply: {other:?}"
            ))),
        }
    }
}

/// The production `ClusterClient`: reads topology from the first reachable
/// seed and keeps one pooled connection per node ID.
pub struct RespClusterClient {
    seeds: Vec<RedisUri>,
    pool: DashMap<String, Arc<RespConnection>>,
}

impl RespClusterClient {
    pub fn new(seeds: Vec<RedisUri>) -> Self {
        Self {
            seeds,
            pool: DashMap::new(),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self, ShepherdError> {
        let seeds = config
            .seed_servers
            .iter()
            .map(|s| RedisUri::parse(s, config.server_port))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(seeds))
    }

    async fn connect(&self, key: &str, uri: &RedisUri) -> Result<Arc<RespConnection>, ShepherdError> {
        if let Some(conn) = self.pool.get(key) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(RespConnection::connect(uri.to_string()).await?);
        debug!("connected to {} ({})", key, uri);
        self.pool.insert(key.to_string(), conn.clone());
        Ok(conn)
    }

    async fn seed_connection(&self) -> Result<Arc<RespConnection>, ShepherdError> {
        let mut last_err = None;
        for seed in &self.seeds {
            match self.connect(&format!("seed:{seed}"), seed).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("seed {} unreachable: {}", seed, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ShepherdError::ClusterClient("no seed servers configured".into())))
    }
}

#[async_trait]
impl ClusterClient for RespClusterClient {
    async fn topology(&self) -> Result<Vec<NodeInfo>, ShepherdError> {
        let seed = self.seed_connection().await?;
        match seed
            .request(RespFrame::command([
                Bytes::from_static(b"CLUSTER"),
                Bytes::from_static(b"NODES"),
            ]))
            .await
        {
            Ok(RespFrame::BulkString(raw)) => {
                parse_cluster_nodes(&String::from_utf8_lossy(&raw))
            }
            Ok(other) => Err(ShepherdError::ClusterClient(format!(
                "unexpected CLUSTER NODES reply: {other:?}"
            ))),
            Err(e) => {
                // A dead seed connection should not wedge every later call.
                self.pool.retain(|key, _| !key.starts_with("seed:"));
                Err(e)
            }
        }
    }

    async fn connection(&self, node: &NodeInfo) -> Result<Arc<dyn NodeConnection>, ShepherdError> {
        let conn = self.connect(&node.id, &node.uri()).await?;
        Ok(conn)
    }
}
