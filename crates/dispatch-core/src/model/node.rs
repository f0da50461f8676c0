use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enums::{CommandStatus, NodeStatus};
use super::ids::{CommandId, NodeId, PoolShareId, RenderNodeId};

/// Per-folder policy selecting which child (and then which command) the
/// scheduler should consider next. Default is FIFO by child id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    Fifo,
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        Self::Fifo
    }
}

/// A dependency declaration: a node becomes READY only once `on` reaches a
/// status in `acceptable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub on: NodeId,
    pub acceptable: Vec<NodeStatus>,
}

impl Dependency {
    pub fn is_satisfied(&self, current: NodeStatus) -> bool {
        self.acceptable.contains(&current)
    }
}

/// The folder- or task-specific payload of a [`Node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Folder {
        children: Vec<NodeId>,
        strategy: DispatchStrategy,
    },
    Task(Task),
}

/// A node in the dispatch tree: either a folder (groups children) or a task
/// (a leaf owning commands). Common fields live on [`Node`]; the specific
/// payload is the tagged [`NodeKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub status: NodeStatus,
    pub completion: f64,
    pub dispatch_key: i64,
    /// pool id -> pool-share id, at most one per pool (spec invariant).
    pub pool_shares: HashMap<u64, PoolShareId>,
    pub tags: HashMap<String, String>,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub paused: bool,
    pub dependencies: Vec<Dependency>,
    pub kind: NodeKind,
}

impl Node {
    pub fn new_folder(id: NodeId, name: impl Into<String>, parent: Option<NodeId>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            parent,
            status: NodeStatus::Blocked,
            completion: 0.0,
            dispatch_key: 0,
            pool_shares: HashMap::new(),
            tags: HashMap::new(),
            creation_time: now,
            start_time: None,
            update_time: now,
            end_time: None,
            paused: false,
            dependencies: Vec::new(),
            kind: NodeKind::Folder {
                children: Vec::new(),
                strategy: DispatchStrategy::Fifo,
            },
        }
    }

    pub fn new_task(id: NodeId, name: impl Into<String>, parent: Option<NodeId>, task: Task) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            parent,
            status: NodeStatus::Blocked,
            completion: 0.0,
            dispatch_key: 0,
            pool_shares: HashMap::new(),
            tags: HashMap::new(),
            creation_time: now,
            start_time: None,
            update_time: now,
            end_time: None,
            paused: false,
            dependencies: Vec::new(),
            kind: NodeKind::Task(task),
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    pub fn task(&self) -> Option<&Task> {
        match &self.kind {
            NodeKind::Task(t) => Some(t),
            NodeKind::Folder { .. } => None,
        }
    }

    pub fn task_mut(&mut self) -> Option<&mut Task> {
        match &mut self.kind {
            NodeKind::Task(t) => Some(t),
            NodeKind::Folder { .. } => None,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Folder { children, .. } => children,
            NodeKind::Task(_) => &[],
        }
    }

    /// Number of commands on this node (0 for folders) currently READY for
    /// assignment. Used to build the scheduler's entry-point set (spec §4.3
    /// Step A).
    pub fn ready_command_count(&self, commands: &HashMap<CommandId, Command>) -> usize {
        match self.task() {
            Some(task) => task
                .commands
                .iter()
                .filter(|cid| {
                    commands
                        .get(cid)
                        .map(|c| c.status == CommandStatus::Ready)
                        .unwrap_or(false)
                })
                .count(),
            None => 0,
        }
    }
}

/// A parameterized unit of work: one or more commands sharing arguments,
/// environment, requirements and resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identifier of the executor plug-in resolved on the render node.
    pub runner: String,
    pub arguments: HashMap<String, Value>,
    pub environment: HashMap<String, String>,
    /// key -> scalar, [lo, hi] range, or list (e.g. `"softs"`).
    pub requirements: HashMap<String, Value>,
    pub min_cores: u32,
    pub max_cores: u32,
    pub ram_use: u64,
    pub license: Option<String>,
    pub validation_expression: Option<String>,
    pub commands: Vec<CommandId>,
}

impl Task {
    pub fn new(runner: impl Into<String>) -> Self {
        Self {
            runner: runner.into(),
            arguments: HashMap::new(),
            environment: HashMap::new(),
            requirements: HashMap::new(),
            min_cores: 0,
            max_cores: 0,
            ram_use: 0,
            license: None,
            validation_expression: None,
            commands: Vec::new(),
        }
    }
}

/// The smallest dispatchable unit: one frame-range of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub description: String,
    /// Owning task-node. Non-owning back-reference.
    pub task_node: NodeId,
    pub arguments: HashMap<String, Value>,
    pub status: CommandStatus,
    pub completion: f64,
    pub message: String,
    pub stats: Option<Value>,
    pub render_node: Option<RenderNodeId>,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub retry_rn_list: Vec<String>,
}

impl Command {
    pub fn new(id: CommandId, task_node: NodeId, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            description: description.into(),
            task_node,
            arguments: HashMap::new(),
            status: CommandStatus::Ready,
            completion: 0.0,
            message: String::new(),
            stats: None,
            render_node: None,
            creation_time: now,
            start_time: None,
            update_time: now,
            end_time: None,
            retry_count: 0,
            retry_rn_list: Vec::new(),
        }
    }

    /// Reset to the state reached after a clean clear-assignment (spec L4).
    pub fn clear_assignment(&mut self) {
        self.status = CommandStatus::Ready;
        self.completion = 0.0;
        self.render_node = None;
        self.message.clear();
        self.update_time = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_assignment_matches_law_l4() {
        let mut cmd = Command::new(CommandId(1), NodeId(1), "render frame 1");
        cmd.status = CommandStatus::Assigned;
        cmd.render_node = Some(RenderNodeId(7));
        cmd.completion = 0.4;
        cmd.message = "crashed".into();

        cmd.clear_assignment();

        assert_eq!(cmd.status, CommandStatus::Ready);
        assert_eq!(cmd.completion, 0.0);
        assert_eq!(cmd.render_node, None);
        assert_eq!(cmd.message, "");
    }

    #[test]
    fn ready_command_count_counts_only_ready() {
        let mut commands = HashMap::new();
        commands.insert(CommandId(1), Command::new(CommandId(1), NodeId(1), "a"));
        let mut running = Command::new(CommandId(2), NodeId(1), "b");
        running.status = CommandStatus::Running;
        commands.insert(CommandId(2), running);

        let mut task = Task::new("maya");
        task.commands = vec![CommandId(1), CommandId(2)];
        let node = Node::new_task(NodeId(1), "job", None, task);

        assert_eq!(node.ready_command_count(&commands), 1);
    }
}
