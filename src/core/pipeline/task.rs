// src/core/pipeline/task.rs

//! The task model: what ingress submits, how it classifies, and how the
//! terminal outcome travels back to the originating caller.

use crate::core::cluster::topology::RedisUri;
use std::fmt::Display;
use strum_macros::{Display, EnumString};
use tokio::sync::oneshot;
use tracing::debug;

/// Recognized task operations. Any other key classifies as `Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskOp {
    AddMaster,
    AddReplica,
    RemoveNode,
    Reshard,
    Unsupported,
}

/// Maps an operation key to exactly one `TaskOp` after trim + lowercase.
pub fn classify_key(key: &str) -> TaskOp {
    key.trim()
        .to_lowercase()
        .parse()
        .unwrap_or(TaskOp::Unsupported)
}

/// Terminal outcome delivered on a task's reply handle: the role and host
/// of the node acted on, or a human-readable failure.
pub type TaskReply = Result<(String, String), String>;

/// A unit of work moving through the pipeline. Consumed exactly once by the
/// stage it classifies into.
#[derive(Debug)]
pub struct Task {
    /// Raw operation key as submitted; `classify` decides the route.
    pub op: String,
    /// Host or host:port the operation applies to. Empty only on reshard
    /// tasks synthesized by a completed add-master, which carry
    /// `new_master_uri` instead.
    pub target: String,
    pub reply_to: Option<oneshot::Sender<TaskReply>>,
    /// Set only on reshard tasks synthesized by a completed add-master.
    pub new_master_uri: Option<RedisUri>,
    /// Set only on reshard tasks synthesized by a master removal; the
    /// node's slots drain before it is forgotten.
    pub retiring_uri: Option<RedisUri>,
}

impl Task {
    /// Builds an ingress task, returning the receiver for its terminal
    /// reply.
    pub fn new(op: &str, target: &str) -> (Self, oneshot::Receiver<TaskReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                op: op.to_string(),
                target: target.to_string(),
                reply_to: Some(tx),
                new_master_uri: None,
                retiring_uri: None,
            },
            rx,
        )
    }

    pub fn classify(&self) -> TaskOp {
        classify_key(&self.op)
    }

    /// Signals the caller that the operation finished, naming the role and
    /// host of the node acted on. A dropped receiver is not an error.
    pub fn reply_ok(&mut self, role: &str, host: &str) {
        if let Some(tx) = self.reply_to.take() {
            if tx.send(Ok((role.to_string(), host.to_string()))).is_err() {
                debug!("reply receiver dropped before success for {}", self.target);
            }
        }
    }

    /// Signals the caller that the operation failed.
    pub fn reply_err(&mut self, error: impl Display) {
        if let Some(tx) = self.reply_to.take() {
            if tx.send(Err(error.to_string())).is_err() {
                debug!("reply receiver dropped before failure for {}", self.target);
            }
        }
    }
}
