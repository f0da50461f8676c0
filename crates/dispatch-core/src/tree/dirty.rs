use serde::{Deserialize, Serialize};

use crate::model::{NodeId, PoolId, PoolShareId, RenderNodeId};

/// Tags a dirty id with the table it belongs to, so the persistence
/// collaborator (§6 "four archives") can route each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirtyRecord {
    /// A node, and transitively the commands owned by its task (commands
    /// are archived together with their owning node, not separately).
    Node(NodeId),
    Pool(PoolId),
    PoolShare(PoolShareId),
    RenderNode(RenderNodeId),
}

/// Accumulated create/modify/archive sets collected by mutation listeners
/// between persistence flushes.
#[derive(Debug, Default, Clone)]
pub struct DirtySets {
    pub to_create: Vec<DirtyRecord>,
    pub to_modify: Vec<DirtyRecord>,
    pub to_archive: Vec<DirtyRecord>,
}

impl DirtySets {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_modify.is_empty() && self.to_archive.is_empty()
    }

    pub fn clear(&mut self) {
        self.to_create.clear();
        self.to_modify.clear();
        self.to_archive.clear();
    }
}
