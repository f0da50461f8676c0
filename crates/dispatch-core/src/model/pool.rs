use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ids::{NodeId, PoolId, PoolShareId, RenderNodeId};

/// A named set of render nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub render_nodes: HashSet<RenderNodeId>,
}

impl Pool {
    pub fn new(id: PoolId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            render_nodes: HashSet::new(),
        }
    }
}

/// A (pool, entry-point node) binding with a capacity cap.
///
/// `max_rn`: `-1` means unbounded, `0` means disabled. At most one
/// [`PoolShare`] exists per (pool, node) pair -- enforced by the dispatch
/// tree at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolShare {
    pub id: PoolShareId,
    pub pool: PoolId,
    pub node: NodeId,
    pub max_rn: i64,
    pub allocated_rn: i64,
    pub user_defined_max_rn: bool,
}

impl PoolShare {
    pub fn new(id: PoolShareId, pool: PoolId, node: NodeId, max_rn: i64) -> Self {
        Self {
            id,
            pool,
            node,
            max_rn,
            allocated_rn: 0,
            user_defined_max_rn: max_rn != 0,
        }
    }

    /// Whether this pool-share currently admits one more assignment.
    pub fn has_render_nodes_available(&self) -> bool {
        self.max_rn == -1 || self.allocated_rn < self.max_rn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_always_available() {
        let ps = PoolShare::new(PoolShareId(1), PoolId(1), NodeId(1), -1);
        assert!(ps.has_render_nodes_available());
    }

    #[test]
    fn disabled_never_available() {
        let mut ps = PoolShare::new(PoolShareId(1), PoolId(1), NodeId(1), 0);
        ps.allocated_rn = 0;
        assert!(!ps.has_render_nodes_available());
    }

    #[test]
    fn capped_available_until_allocated_reaches_max() {
        let mut ps = PoolShare::new(PoolShareId(1), PoolId(1), NodeId(1), 2);
        assert!(ps.has_render_nodes_available());
        ps.allocated_rn = 2;
        assert!(!ps.has_render_nodes_available());
    }
}
