// src/core/cluster/mod.rs

//! Cluster-facing building blocks: the topology model and the client
//! adapter the rest of the control plane is written against.

pub mod client;
pub mod topology;

pub use client::{ClusterClient, ConnectionCache, NodeConnection, RespClusterClient};
pub use topology::{NUM_SLOTS, NodeInfo, NodeRole, RedisUri};
