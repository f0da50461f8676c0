use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------

/// Status of a [`Node`](super::node::Node) -- folder or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Blocked,
    Ready,
    Running,
    Done,
    Error,
    Canceled,
    Paused,
}

impl NodeStatus {
    /// Final statuses admit no further scheduling for the node.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            "paused" => Ok(Self::Paused),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`Command`](super::node::Command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ready,
    Assigned,
    Running,
    Finishing,
    Done,
    Error,
    Canceled,
    Timeout,
}

impl CommandStatus {
    /// Final statuses: nothing further can happen to the command.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }

    /// `render_node != null` is only a valid state while the command holds
    /// one of these statuses (spec invariant on [`Command`](super::node::Command)).
    pub fn holds_render_node(self) -> bool {
        matches!(self, Self::Assigned | Self::Running | Self::Finishing)
    }

    /// TIMEOUT is a recoverable error, eligible for autoretry like ERROR.
    pub fn is_error_like(self) -> bool {
        matches!(self, Self::Error | Self::Timeout)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Finishing => "finishing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for CommandStatus {
    type Err = CommandStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "finishing" => Ok(Self::Finishing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            "timeout" => Ok(Self::Timeout),
            other => Err(CommandStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CommandStatus`] string.
#[derive(Debug, Clone)]
pub struct CommandStatusParseError(pub String);

impl fmt::Display for CommandStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid command status: {:?}", self.0)
    }
}

impl std::error::Error for CommandStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`RenderNode`](super::render_node::RenderNode).
///
/// Declaration order doubles as the `isAvailable` comparison order (`status
/// >= Idle`), matching the original's integer status constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderNodeStatus {
    Unknown,
    Paused,
    Booting,
    Idle,
    Assigned,
    Working,
    Finishing,
}

impl fmt::Display for RenderNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Paused => "paused",
            Self::Booting => "booting",
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Working => "working",
            Self::Finishing => "finishing",
        };
        f.write_str(s)
    }
}

impl FromStr for RenderNodeStatus {
    type Err = RenderNodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "paused" => Ok(Self::Paused),
            "booting" => Ok(Self::Booting),
            "idle" => Ok(Self::Idle),
            "assigned" => Ok(Self::Assigned),
            "working" => Ok(Self::Working),
            "finishing" => Ok(Self::Finishing),
            other => Err(RenderNodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RenderNodeStatus`] string.
#[derive(Debug, Clone)]
pub struct RenderNodeStatusParseError(pub String);

impl fmt::Display for RenderNodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid render node status: {:?}", self.0)
    }
}

impl std::error::Error for RenderNodeStatusParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_display_roundtrip() {
        let variants = [
            NodeStatus::Blocked,
            NodeStatus::Ready,
            NodeStatus::Running,
            NodeStatus::Done,
            NodeStatus::Error,
            NodeStatus::Canceled,
            NodeStatus::Paused,
        ];
        for v in &variants {
            let parsed: NodeStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn node_status_invalid() {
        assert!("bogus".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn command_status_display_roundtrip() {
        let variants = [
            CommandStatus::Ready,
            CommandStatus::Assigned,
            CommandStatus::Running,
            CommandStatus::Finishing,
            CommandStatus::Done,
            CommandStatus::Error,
            CommandStatus::Canceled,
            CommandStatus::Timeout,
        ];
        for v in &variants {
            let parsed: CommandStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn command_status_invalid() {
        assert!("nope".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn command_status_holds_render_node() {
        assert!(CommandStatus::Assigned.holds_render_node());
        assert!(CommandStatus::Running.holds_render_node());
        assert!(CommandStatus::Finishing.holds_render_node());
        assert!(!CommandStatus::Ready.holds_render_node());
        assert!(!CommandStatus::Done.holds_render_node());
    }

    #[test]
    fn render_node_status_display_roundtrip() {
        let variants = [
            RenderNodeStatus::Unknown,
            RenderNodeStatus::Paused,
            RenderNodeStatus::Booting,
            RenderNodeStatus::Idle,
            RenderNodeStatus::Assigned,
            RenderNodeStatus::Working,
            RenderNodeStatus::Finishing,
        ];
        for v in &variants {
            let parsed: RenderNodeStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn render_node_status_invalid() {
        assert!("sleeping".parse::<RenderNodeStatus>().is_err());
    }
}
