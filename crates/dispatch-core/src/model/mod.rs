//! The entity model: nodes, tasks, commands, pools, pool-shares, render
//! nodes, and the license manager. Plain data + the invariant-preserving
//! operations that belong on a single entity; cross-entity orchestration
//! (dirty tracking, completion propagation, scheduling) lives in
//! [`crate::tree`], [`crate::rn_lifecycle`] and [`crate::scheduler`].

pub mod enums;
pub mod ids;
pub mod license;
pub mod node;
pub mod pool;
pub mod render_node;

pub use enums::{CommandStatus, NodeStatus, RenderNodeStatus};
pub use ids::{CommandId, NodeId, PoolId, PoolShareId, RenderNodeId};
pub use license::{License, LicenseError, LicenseManager};
pub use node::{Command, Dependency, DispatchStrategy, Node, NodeKind, Task};
pub use pool::{Pool, PoolShare};
pub use render_node::RenderNode;
