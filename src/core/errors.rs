// src/core/errors.rs

//! Defines the primary error type for the entire control plane.

use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing all failure classes the control plane
/// distinguishes. Using `thiserror` keeps the definitions clean and gives
/// every variant the human-readable form that is relayed to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShepherdError {
    /// Transport or command-level failure from a cluster node. Whether to
    /// retry is the caller's decision, never the adapter's.
    #[error("Cluster client error: {0}")]
    ClusterClient(String),

    /// The canonicalized URI does not match any topology entry.
    #[error("Node {0} is not a member of the cluster")]
    NodeNotInCluster(String),

    /// The submitted operation key is not one the pipeline recognizes.
    #[error("Unsupported operation {op} for {target}")]
    IllegalOperation { op: String, target: String },

    /// The reshard planner rejected its input.
    #[error("Reshard table error: {0}")]
    ReshardTable(String),

    /// A slot migration failed outside the classified recovery set.
    #[error("Slot migration error: {0}")]
    SlotMigration(String),

    /// The migration router did not settle every slot within the deadline.
    #[error("Reshard did not complete within {0:?}")]
    ReshardTimeout(Duration),

    #[error("Invalid Redis URI '{0}'")]
    InvalidUri(String),

    /// A RESP frame was cut short; the codec waits for more data.
    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ShepherdError {
    fn from(e: std::io::Error) -> Self {
        ShepherdError::ClusterClient(e.to_string())
    }
}
