//! The dispatch tree (C3): owns every node, task, command, pool,
//! pool-share and render node by id, propagates completion/status,
//! validates dependencies, and collects dirty sets for the persistence
//! collaborator.

mod dirty;
mod submission;

pub use dirty::{DirtyRecord, DirtySets};
pub use submission::{GraphSubmission, SubmittedNode};

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::debug;

use crate::model::{
    Command, CommandId, CommandStatus, Dependency, Node, NodeId, NodeKind, NodeStatus, Pool,
    PoolId, PoolShare, PoolShareId, RenderNode, RenderNodeId, Task,
};

/// Name of the folder directly under root that holds every submitted
/// graph. Excluded from the scheduler's entry-point set by name (spec
/// §4.3 Step A).
pub const GRAPHS_FOLDER: &str = "graphs";

#[derive(Debug)]
pub struct DispatchTree {
    nodes: HashMap<NodeId, Node>,
    commands: HashMap<CommandId, Command>,
    pools: HashMap<PoolId, Pool>,
    pool_shares: HashMap<PoolShareId, PoolShare>,
    render_nodes: HashMap<RenderNodeId, RenderNode>,

    root: NodeId,
    graphs: NodeId,

    next_node_id: u64,
    next_command_id: u64,
    next_pool_id: u64,
    next_pool_share_id: u64,

    dirty: DirtySets,
}

impl DispatchTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let root_id = NodeId(1);
        let graphs_id = NodeId(2);

        let mut root = Node::new_folder(root_id, "", None);
        if let NodeKind::Folder { children, .. } = &mut root.kind {
            children.push(graphs_id);
        }
        root.status = NodeStatus::Ready;
        nodes.insert(root_id, root);

        let mut graphs = Node::new_folder(graphs_id, GRAPHS_FOLDER, Some(root_id));
        graphs.status = NodeStatus::Ready;
        nodes.insert(graphs_id, graphs);

        Self {
            nodes,
            commands: HashMap::new(),
            pools: HashMap::new(),
            pool_shares: HashMap::new(),
            render_nodes: HashMap::new(),
            root: root_id,
            graphs: graphs_id,
            next_node_id: 3,
            next_command_id: 1,
            next_pool_id: 1,
            next_pool_share_id: 1,
            dirty: DirtySets::default(),
        }
    }

    /// Rehydrates a tree from a startup [`crate::persistence::PersistedState`]
    /// snapshot (spec §6 "recovers its in-memory state from the persisted
    /// archive on restart"). An empty snapshot (fresh deployment) falls back
    /// to [`Self::new`].
    pub fn from_persisted(state: crate::persistence::PersistedState) -> Self {
        if state.nodes.is_empty() {
            return Self::new();
        }

        let root = state
            .nodes
            .iter()
            .find(|n| n.parent.is_none())
            .map(|n| n.id)
            .unwrap_or(NodeId(1));
        let graphs = state
            .nodes
            .iter()
            .find(|n| n.parent == Some(root) && n.name == GRAPHS_FOLDER)
            .map(|n| n.id)
            .unwrap_or(NodeId(2));

        let next_node_id = state.nodes.iter().map(|n| n.id.0).max().unwrap_or(0) + 1;
        let next_command_id = state.commands.iter().map(|c| c.id.0).max().unwrap_or(0) + 1;
        let next_pool_id = state.pools.iter().map(|p| p.id.0).max().unwrap_or(0) + 1;
        let next_pool_share_id = state.pool_shares.iter().map(|p| p.id.0).max().unwrap_or(0) + 1;

        Self {
            nodes: state.nodes.into_iter().map(|n| (n.id, n)).collect(),
            commands: state.commands.into_iter().map(|c| (c.id, c)).collect(),
            pools: state.pools.into_iter().map(|p| (p.id, p)).collect(),
            pool_shares: state.pool_shares.into_iter().map(|p| (p.id, p)).collect(),
            render_nodes: state.render_nodes.into_iter().map(|r| (r.id, r)).collect(),
            root,
            graphs,
            next_node_id,
            next_command_id,
            next_pool_id,
            next_pool_share_id,
            dirty: DirtySets::default(),
        }
    }

    fn fresh_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    fn fresh_command_id(&mut self) -> CommandId {
        let id = CommandId(self.next_command_id);
        self.next_command_id += 1;
        id
    }

    fn fresh_pool_share_id(&mut self) -> PoolShareId {
        let id = PoolShareId(self.next_pool_share_id);
        self.next_pool_share_id += 1;
        id
    }

    // -- accessors ----------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn command(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn command_mut(&mut self, id: CommandId) -> Option<&mut Command> {
        self.commands.get_mut(&id)
    }

    pub fn commands(&self) -> &HashMap<CommandId, Command> {
        &self.commands
    }

    pub fn pool(&self, id: PoolId) -> Option<&Pool> {
        self.pools.get(&id)
    }

    pub fn pool_mut(&mut self, id: PoolId) -> Option<&mut Pool> {
        self.pools.get_mut(&id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn pool_share(&self, id: PoolShareId) -> Option<&PoolShare> {
        self.pool_shares.get(&id)
    }

    pub fn pool_share_mut(&mut self, id: PoolShareId) -> Option<&mut PoolShare> {
        self.pool_shares.get_mut(&id)
    }

    pub fn pool_shares(&self) -> impl Iterator<Item = &PoolShare> {
        self.pool_shares.values()
    }

    pub fn render_node(&self, id: RenderNodeId) -> Option<&RenderNode> {
        self.render_nodes.get(&id)
    }

    pub fn render_node_mut(&mut self, id: RenderNodeId) -> Option<&mut RenderNode> {
        self.render_nodes.get_mut(&id)
    }

    pub fn render_nodes(&self) -> impl Iterator<Item = &RenderNode> {
        self.render_nodes.values()
    }

    pub fn render_nodes_mut(&mut self) -> impl Iterator<Item = &mut RenderNode> {
        self.render_nodes.values_mut()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    // -- dirty tracking -------------------------------------------------

    /// Drain the accumulated dirty sets for a persistence flush.
    pub fn take_dirty(&mut self) -> DirtySets {
        std::mem::take(&mut self.dirty)
    }

    pub fn reset_dirty(&mut self) {
        self.dirty.clear();
    }

    fn mark_node_created(&mut self, id: NodeId) {
        self.dirty.to_create.push(DirtyRecord::Node(id));
    }

    fn mark_node_modified(&mut self, id: NodeId) {
        self.dirty.to_modify.push(DirtyRecord::Node(id));
    }

    fn mark_pool_share_created(&mut self, id: PoolShareId) {
        self.dirty.to_create.push(DirtyRecord::PoolShare(id));
    }

    // -- pools ------------------------------------------------------------

    /// Look up a pool by name, creating it (with no render nodes) if absent.
    pub fn get_or_create_pool(&mut self, name: &str) -> PoolId {
        if let Some(p) = self.pools.values().find(|p| p.name == name) {
            return p.id;
        }
        let id = PoolId(self.next_pool_id);
        self.next_pool_id += 1;
        self.pools.insert(id, Pool::new(id, name));
        self.dirty.to_create.push(DirtyRecord::Pool(id));
        id
    }

    pub fn register_render_node(&mut self, mut rn: RenderNode) -> RenderNodeId {
        let id = rn.id;
        for pool_id in &rn.pools {
            if let Some(pool) = self.pools.get_mut(pool_id) {
                pool.render_nodes.insert(id);
            }
        }
        rn.id = id;
        self.render_nodes.insert(id, rn);
        self.dirty.to_create.push(DirtyRecord::RenderNode(id));
        id
    }

    /// Create a pool-share, rejecting a duplicate (pool, node) pair (spec
    /// invariant, enforced the same way `poolshares.py` enforces it --
    /// at construction, not just by convention).
    pub fn create_pool_share(
        &mut self,
        pool: PoolId,
        node: NodeId,
        max_rn: i64,
    ) -> Result<PoolShareId> {
        if !self.pools.contains_key(&pool) {
            bail!("unknown pool {pool}");
        }
        if !self.nodes.contains_key(&node) {
            bail!("unknown node {node}");
        }
        let duplicate = self
            .pool_shares
            .values()
            .any(|ps| ps.pool == pool && ps.node == node);
        if duplicate {
            bail!("pool-share for pool {pool} and node {node} already exists");
        }

        let id = self.fresh_pool_share_id();
        let ps = PoolShare::new(id, pool, node, max_rn);
        self.pool_shares.insert(id, ps);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.pool_shares.insert(pool.0, id);
        }
        self.mark_pool_share_created(id);
        Ok(id)
    }

    // -- graph submission -------------------------------------------------

    /// Register a submitted graph under `/graphs`. Returns the ids of the
    /// created leaf task-nodes, in submission order, so the caller can
    /// apply post-creation flags (e.g. pausing specific tasks).
    pub fn register_graph(&mut self, submission: GraphSubmission) -> Result<Vec<NodeId>> {
        let pool_id = self.get_or_create_pool(&submission.pool);
        let mut leaves = Vec::new();
        let mut path_index: HashMap<String, NodeId> = HashMap::new();

        let root_id = self.build_node(
            &submission.root,
            Some(self.graphs),
            "",
            &mut leaves,
            &mut path_index,
        )?;

        if let Some(n) = self.nodes.get_mut(&root_id) {
            n.tags = submission.tags.clone();
        }
        if let Some(parent) = self.nodes.get_mut(&self.graphs) {
            if let NodeKind::Folder { children, .. } = &mut parent.kind {
                children.push(root_id);
            }
        }

        let max_rn = submission.max_rn.unwrap_or(-1);
        self.create_pool_share(pool_id, root_id, max_rn)
            .context("creating default pool-share for submitted graph")?;

        // Resolve dependency paths now that every node in this submission has an id.
        self.resolve_dependencies(&submission.root, "", &path_index)?;

        Ok(leaves)
    }

    fn build_node(
        &mut self,
        spec: &SubmittedNode,
        parent: Option<NodeId>,
        path_prefix: &str,
        leaves: &mut Vec<NodeId>,
        path_index: &mut HashMap<String, NodeId>,
    ) -> Result<NodeId> {
        let path = if path_prefix.is_empty() {
            spec.name().to_owned()
        } else {
            format!("{path_prefix}/{}", spec.name())
        };

        match spec {
            SubmittedNode::Folder {
                name,
                dispatch_key,
                children,
            } => {
                let id = self.fresh_node_id();
                let mut node = Node::new_folder(id, name, parent);
                node.dispatch_key = *dispatch_key;
                self.nodes.insert(id, node);
                self.mark_node_created(id);
                path_index.insert(path.clone(), id);

                let mut child_ids = Vec::with_capacity(children.len());
                for child in children {
                    child_ids.push(self.build_node(child, Some(id), &path, leaves, path_index)?);
                }
                if let Some(n) = self.nodes.get_mut(&id) {
                    if let NodeKind::Folder { children, .. } = &mut n.kind {
                        *children = child_ids;
                    }
                }
                Ok(id)
            }
            SubmittedNode::Task {
                name,
                dispatch_key,
                runner,
                arguments,
                environment,
                requirements,
                min_cores,
                max_cores,
                ram_use,
                license,
                validation_expression,
                start,
                end,
                packet_size,
                paused,
                ..
            } => {
                let id = self.fresh_node_id();
                let mut task = Task::new(runner.clone());
                task.arguments = arguments.clone();
                task.environment = environment.clone();
                task.requirements = requirements.clone();
                task.min_cores = *min_cores;
                task.max_cores = *max_cores;
                task.ram_use = *ram_use;
                task.license = license.clone();
                task.validation_expression = validation_expression.clone();

                let packet_size = (*packet_size).max(1);
                let mut frame = *start;
                while frame <= *end {
                    let packet_end = (frame + packet_size - 1).min(*end);
                    let cmd_id = self.fresh_command_id();
                    let description = format!("{name} [{frame}-{packet_end}]");
                    let mut command = Command::new(cmd_id, id, description);
                    command
                        .arguments
                        .insert("start".into(), serde_json::json!(frame));
                    command
                        .arguments
                        .insert("end".into(), serde_json::json!(packet_end));
                    self.commands.insert(cmd_id, command);
                    task.commands.push(cmd_id);
                    frame = packet_end + 1;
                }

                let mut node = Node::new_task(id, name, parent, task);
                node.dispatch_key = *dispatch_key;
                node.paused = *paused;
                self.nodes.insert(id, node);
                self.mark_node_created(id);
                path_index.insert(path.clone(), id);
                leaves.push(id);
                Ok(id)
            }
        }
    }

    fn resolve_dependencies(
        &mut self,
        spec: &SubmittedNode,
        path_prefix: &str,
        path_index: &HashMap<String, NodeId>,
    ) -> Result<()> {
        let path = if path_prefix.is_empty() {
            spec.name().to_owned()
        } else {
            format!("{path_prefix}/{}", spec.name())
        };

        match spec {
            SubmittedNode::Folder { children, .. } => {
                for child in children {
                    self.resolve_dependencies(child, &path, path_index)?;
                }
            }
            SubmittedNode::Task {
                dependencies, name, ..
            } => {
                let Some(&node_id) = path_index.get(&path) else {
                    bail!("internal error: task {name} missing from path index");
                };
                let mut deps = Vec::with_capacity(dependencies.len());
                for (dep_path, acceptable) in dependencies {
                    let dep_id = path_index
                        .get(dep_path)
                        .copied()
                        .with_context(|| format!("unknown dependency path {dep_path}"))?;
                    deps.push(Dependency {
                        on: dep_id,
                        acceptable: acceptable.clone(),
                    });
                }
                if let Some(n) = self.nodes.get_mut(&node_id) {
                    n.dependencies = deps;
                }
            }
        }
        Ok(())
    }

    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let node = self.nodes.get(&current)?;
            let children = node.children();
            let next = children
                .iter()
                .find(|&&cid| self.nodes.get(&cid).map(|n| n.name.as_str()) == Some(segment))?;
            current = *next;
        }
        Some(current)
    }

    // -- completion / status propagation ----------------------------------

    /// Bottom-up recomputation of completion and status for every node.
    /// Leaves (task-nodes) derive from their commands; folders roll up
    /// from children per the folder's dispatch strategy.
    pub fn update_completion_and_status(&mut self) {
        let order = self.post_order(self.root);
        for id in order {
            self.recompute_node(id);
        }
    }

    fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, visited)) = stack.pop() {
            if visited {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            if let Some(node) = self.nodes.get(&id) {
                for &child in node.children() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    fn recompute_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };

        let (new_completion, new_status) = match &node.kind {
            NodeKind::Task(task) => self.recompute_task_node(node.status, node.paused, task),
            NodeKind::Folder { children, .. } => {
                self.recompute_folder_node(node.status, node.paused, children)
            }
        };

        let node = self.nodes.get_mut(&id).expect("checked above");
        if node.paused {
            if node.status != NodeStatus::Paused {
                node.status = NodeStatus::Paused;
                node.update_time = Utc::now();
                self.mark_node_modified(id);
            }
            return;
        }

        if (node.completion - new_completion).abs() > f64::EPSILON || node.status != new_status {
            node.completion = new_completion;
            let was_running = node.status == NodeStatus::Running;
            node.status = new_status;
            node.update_time = Utc::now();
            if new_status == NodeStatus::Running && !was_running {
                node.start_time.get_or_insert(Utc::now());
            }
            if new_status.is_final() {
                node.end_time.get_or_insert(Utc::now());
            }
            self.mark_node_modified(id);
            debug!(node = id.0, status = %new_status, "node status updated");
        }
    }

    fn recompute_task_node(&self, current: NodeStatus, paused: bool, task: &Task) -> (f64, NodeStatus) {
        if paused {
            return (0.0, NodeStatus::Paused);
        }
        if task.commands.is_empty() {
            return (1.0, NodeStatus::Done);
        }

        let statuses: Vec<CommandStatus> = task
            .commands
            .iter()
            .filter_map(|cid| self.commands.get(cid).map(|c| c.status))
            .collect();
        let completion: f64 = task
            .commands
            .iter()
            .filter_map(|cid| self.commands.get(cid).map(|c| c.completion))
            .sum::<f64>()
            / task.commands.len() as f64;

        let any_running = statuses.iter().any(|s| *s == CommandStatus::Running);
        let all_done = statuses.iter().all(|s| *s == CommandStatus::Done);
        let any_error = statuses.iter().any(|s| s.is_error_like());
        let all_canceled = statuses.iter().all(|s| *s == CommandStatus::Canceled);

        let status = if any_running {
            NodeStatus::Running
        } else if all_done {
            NodeStatus::Done
        } else if any_error {
            NodeStatus::Error
        } else if all_canceled {
            NodeStatus::Canceled
        } else if current == NodeStatus::Error || current == NodeStatus::Canceled {
            current
        } else {
            NodeStatus::Ready
        };

        (completion, status)
    }

    fn recompute_folder_node(
        &self,
        current: NodeStatus,
        paused: bool,
        children: &[NodeId],
    ) -> (f64, NodeStatus) {
        if paused {
            return (0.0, NodeStatus::Paused);
        }
        if children.is_empty() {
            return (1.0, NodeStatus::Done);
        }

        let child_nodes: Vec<&Node> = children.iter().filter_map(|c| self.nodes.get(c)).collect();
        let total_leaves: usize = child_nodes
            .iter()
            .map(|n| match &n.kind {
                NodeKind::Task(t) => t.commands.len().max(1),
                NodeKind::Folder { .. } => 1,
            })
            .sum();
        let weighted: f64 = child_nodes
            .iter()
            .map(|n| {
                let weight = match &n.kind {
                    NodeKind::Task(t) => t.commands.len().max(1),
                    NodeKind::Folder { .. } => 1,
                } as f64;
                n.completion * weight
            })
            .sum();
        let completion = if total_leaves == 0 {
            0.0
        } else {
            weighted / total_leaves as f64
        };

        let any_running = child_nodes.iter().any(|n| n.status == NodeStatus::Running);
        let all_done = child_nodes.iter().all(|n| n.status == NodeStatus::Done);
        let any_error = child_nodes.iter().any(|n| n.status == NodeStatus::Error);
        let all_canceled = child_nodes
            .iter()
            .all(|n| n.status == NodeStatus::Canceled);

        let status = if any_running {
            NodeStatus::Running
        } else if all_done {
            NodeStatus::Done
        } else if any_error {
            NodeStatus::Error
        } else if all_canceled {
            NodeStatus::Canceled
        } else if current == NodeStatus::Error || current == NodeStatus::Canceled {
            current
        } else {
            NodeStatus::Ready
        };

        (completion, status)
    }

    /// For each BLOCKED node with declared dependencies, transition to
    /// READY iff every dependency's current status is in its declared
    /// acceptable-status set. Idempotent.
    pub fn validate_dependencies(&mut self) {
        let candidates: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Blocked && !n.dependencies.is_empty())
            .map(|(id, _)| *id)
            .collect();

        for id in candidates {
            let node = &self.nodes[&id];
            let satisfied = node.dependencies.iter().all(|dep| {
                self.nodes
                    .get(&dep.on)
                    .map(|n| dep.is_satisfied(n.status))
                    .unwrap_or(false)
            });
            if satisfied {
                let node = self.nodes.get_mut(&id).expect("checked above");
                node.status = NodeStatus::Ready;
                node.update_time = Utc::now();
                self.mark_node_modified(id);
            }
        }

        // Nodes without declared dependencies start READY once created;
        // BLOCKED-with-no-deps is only reachable transiently right after
        // construction, so sweep those too.
        let no_dep_blocked: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Blocked && n.dependencies.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in no_dep_blocked {
            let node = self.nodes.get_mut(&id).expect("checked above");
            node.status = NodeStatus::Ready;
            node.update_time = Utc::now();
            self.mark_node_modified(id);
        }
    }

    /// Administratively cancel or pause a node (spec §5 Cancellation).
    pub fn set_node_status(&mut self, id: NodeId, status: NodeStatus) -> Result<()> {
        let node = self.nodes.get_mut(&id).context("unknown node")?;
        node.status = status;
        node.update_time = Utc::now();
        if status.is_final() {
            node.end_time.get_or_insert(Utc::now());
        }
        self.mark_node_modified(id);
        Ok(())
    }

    pub fn set_node_paused(&mut self, id: NodeId, paused: bool) -> Result<()> {
        let node = self.nodes.get_mut(&id).context("unknown node")?;
        node.paused = paused;
        node.update_time = Utc::now();
        self.mark_node_modified(id);
        Ok(())
    }

    pub fn set_dispatch_key(&mut self, id: NodeId, dispatch_key: i64) -> Result<()> {
        let node = self.nodes.get_mut(&id).context("unknown node")?;
        node.dispatch_key = dispatch_key;
        self.mark_node_modified(id);
        Ok(())
    }

    pub fn set_max_rn(&mut self, id: PoolShareId, max_rn: i64) -> Result<()> {
        let ps = self.pool_shares.get_mut(&id).context("unknown pool-share")?;
        ps.max_rn = max_rn;
        ps.user_defined_max_rn = true;
        self.dirty.to_modify.push(DirtyRecord::PoolShare(id));
        Ok(())
    }

    /// Archive a finished submission root: removes it and its whole
    /// subtree from the live tree, appending archive records.
    pub fn archive_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                if let NodeKind::Task(task) = &node.kind {
                    for cmd_id in &task.commands {
                        self.commands.remove(cmd_id);
                    }
                }
                if let NodeKind::Folder { children, .. } = &node.kind {
                    stack.extend(children.iter().copied());
                }
                self.dirty.to_archive.push(DirtyRecord::Node(current));
            }
        }
    }
}

impl Default for DispatchTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn single_task_submission(name: &str, count: i64) -> GraphSubmission {
        GraphSubmission {
            name: name.to_owned(),
            pool: "default".to_owned(),
            max_rn: None,
            tags: Map::new(),
            root: SubmittedNode::Task {
                name: name.to_owned(),
                dispatch_key: 0,
                runner: "maya".to_owned(),
                arguments: Map::new(),
                environment: Map::new(),
                requirements: Map::new(),
                min_cores: 0,
                max_cores: 0,
                ram_use: 0,
                license: None,
                validation_expression: None,
                start: 1,
                end: count,
                packet_size: 1,
                dependencies: Vec::new(),
                paused: false,
            },
        }
    }

    #[test]
    fn register_graph_expands_commands_per_packet_size() {
        let mut tree = DispatchTree::new();
        let leaves = tree.register_graph(single_task_submission("job1", 3)).unwrap();
        assert_eq!(leaves.len(), 1);
        let task = tree.node(leaves[0]).unwrap().task().unwrap();
        assert_eq!(task.commands.len(), 3);
    }

    #[test]
    fn from_persisted_empty_snapshot_matches_fresh_tree() {
        let tree = DispatchTree::from_persisted(crate::persistence::PersistedState::default());
        assert_eq!(tree.root(), NodeId(1));
        assert!(tree.find_by_path("graphs").is_some());
    }

    #[test]
    fn from_persisted_rebuilds_commands_and_id_counters() {
        let mut tree = DispatchTree::new();
        let leaves = tree.register_graph(single_task_submission("job1", 2)).unwrap();
        let task_node = tree.node(leaves[0]).unwrap().clone();
        let commands: Vec<Command> = task_node
            .task()
            .unwrap()
            .commands
            .iter()
            .map(|id| tree.command(*id).unwrap().clone())
            .collect();

        let state = crate::persistence::PersistedState {
            nodes: tree.nodes().cloned().collect(),
            commands,
            pools: Vec::new(),
            pool_shares: Vec::new(),
            render_nodes: Vec::new(),
        };

        let restored = DispatchTree::from_persisted(state);
        assert_eq!(restored.node(task_node.id).unwrap().name, "job1");
        assert_eq!(restored.commands().len(), 2);

        // the next-id counters must continue past whatever was loaded, so a
        // fresh submission after recovery never collides with an archived id.
        let mut restored = restored;
        let new_leaves = restored
            .register_graph(single_task_submission("job2", 1))
            .unwrap();
        let new_task = restored.node(new_leaves[0]).unwrap();
        assert!(new_task.id.0 > task_node.id.0);
    }

    #[test]
    fn find_by_path_walks_from_root() {
        let mut tree = DispatchTree::new();
        let leaves = tree.register_graph(single_task_submission("job1", 1)).unwrap();
        let found = tree.find_by_path("graphs/job1").unwrap();
        assert_eq!(found, leaves[0]);
    }

    #[test]
    fn update_completion_and_status_rolls_up_from_commands() {
        let mut tree = DispatchTree::new();
        let leaves = tree.register_graph(single_task_submission("job1", 2)).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();
        assert_eq!(tree.node(leaves[0]).unwrap().status, NodeStatus::Ready);

        let task = tree.node(leaves[0]).unwrap().task().unwrap().clone();
        for cid in &task.commands {
            tree.command_mut(*cid).unwrap().status = CommandStatus::Done;
            tree.command_mut(*cid).unwrap().completion = 1.0;
        }
        tree.update_completion_and_status();
        assert_eq!(tree.node(leaves[0]).unwrap().status, NodeStatus::Done);
        assert_eq!(tree.node(leaves[0]).unwrap().completion, 1.0);
    }

    #[test]
    fn duplicate_pool_share_rejected() {
        let mut tree = DispatchTree::new();
        let pool = tree.get_or_create_pool("default");
        let node = tree.root();
        tree.create_pool_share(pool, node, -1).unwrap();
        assert!(tree.create_pool_share(pool, node, -1).is_err());
    }

    #[test]
    fn dirty_sets_collect_and_reset() {
        let mut tree = DispatchTree::new();
        tree.register_graph(single_task_submission("job1", 1)).unwrap();
        let dirty = tree.take_dirty();
        assert!(!dirty.to_create.is_empty());
        let dirty_again = tree.take_dirty();
        assert!(dirty_again.is_empty());
    }
}
