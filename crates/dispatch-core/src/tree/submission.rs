use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::NodeStatus;

/// A client-submitted job graph (spec §6 `POST /graphs/`), before ids are
/// assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSubmission {
    pub name: String,
    pub pool: String,
    /// Cap on the submission's root entry-point; `None` leaves it
    /// auto-managed by the scheduler's fair-share pass.
    pub max_rn: Option<i64>,
    pub tags: HashMap<String, String>,
    pub root: SubmittedNode,
}

/// One node in a submitted graph: a folder grouping children, or a task
/// that expands into commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmittedNode {
    Folder {
        name: String,
        #[serde(default)]
        dispatch_key: i64,
        children: Vec<SubmittedNode>,
    },
    Task {
        name: String,
        #[serde(default)]
        dispatch_key: i64,
        runner: String,
        #[serde(default)]
        arguments: HashMap<String, Value>,
        #[serde(default)]
        environment: HashMap<String, String>,
        #[serde(default)]
        requirements: HashMap<String, Value>,
        #[serde(default)]
        min_cores: u32,
        #[serde(default)]
        max_cores: u32,
        #[serde(default)]
        ram_use: u64,
        #[serde(default)]
        license: Option<String>,
        #[serde(default)]
        validation_expression: Option<String>,
        /// Commands expand from `start..=end` partitioned into chunks of
        /// `packet_size` frames each.
        start: i64,
        end: i64,
        #[serde(default = "default_packet_size")]
        packet_size: i64,
        /// Paths (relative to the submission root, `/`-joined by node
        /// name) of nodes this one depends on, with their acceptable
        /// statuses.
        #[serde(default)]
        dependencies: Vec<(String, Vec<NodeStatus>)>,
        #[serde(default)]
        paused: bool,
    },
}

fn default_packet_size() -> i64 {
    1
}

impl SubmittedNode {
    pub fn name(&self) -> &str {
        match self {
            Self::Folder { name, .. } => name,
            Self::Task { name, .. } => name,
        }
    }
}
