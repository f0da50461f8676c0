//! Typed error taxonomy for the core crate. Call sites that need to
//! distinguish failure modes (e.g. the HTTP surface mapping to status
//! codes) match on these; everything else propagates via `anyhow`.

use thiserror::Error;

use crate::model::{NodeId, PoolShareId};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown pool-share {0}")]
    UnknownPoolShare(PoolShareId),
    #[error("graph submission invalid: {0}")]
    InvalidSubmission(String),
    #[error("dependency path not found: {0}")]
    UnknownDependencyPath(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("render node {0} unreachable: {1}")]
    Unreachable(String, #[source] reqwest::Error),
    #[error("render node {0} rejected assignment with status {1}")]
    RejectedAssignment(String, reqwest::StatusCode),
}
