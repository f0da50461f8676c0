//! Render-node lifecycle (C4): heartbeat timeout, status derivation from
//! assigned commands, finishing-status release, and quarantine.

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::model::{CommandId, CommandStatus, NodeId, RenderNode, RenderNodeStatus};

/// Seconds of heartbeat silence before a render node is considered offline
/// (original `RN_TIMEOUT`).
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 1200;

/// Error/timeout commands tolerated within the timeout window before a
/// render node is quarantined (original `RN_NB_ERRORS_TOLERANCE`).
pub const ERROR_TOLERANCE: usize = 5;

/// Ring-buffer capacity for the error-timestamp history: four error
/// windows' worth, so an old burst cannot still be influencing quarantine
/// decisions long after it scrolled out of the tolerance window.
pub const ERROR_HISTORY_CAPACITY: usize = ERROR_TOLERANCE * 4;

/// Derive the next render-node status from its heartbeat freshness and the
/// statuses of its assigned commands. Mirrors the original's three-rule,
/// two-early-return `updateStatus`.
///
/// Returns the command ids that should be force-marked TIMEOUT as a side
/// effect of declaring the node unreachable (rule 1) -- applying that to
/// the tree is the caller's job, this function only computes it.
pub fn update_status(
    rn: &mut RenderNode,
    command_statuses: &[(CommandId, CommandStatus)],
    now: DateTime<Utc>,
) -> Vec<CommandId> {
    if (now - rn.last_alive_time).num_seconds() > HEARTBEAT_TIMEOUT_SECS {
        if rn.status != RenderNodeStatus::Unknown {
            info!(rendernode = %rn.name, "render node is not responding");
            rn.status = RenderNodeStatus::Unknown;
            return command_statuses.iter().map(|(id, _)| *id).collect();
        }
        return Vec::new();
    }

    if rn.commands.is_empty() && !matches!(rn.status, RenderNodeStatus::Paused | RenderNodeStatus::Booting)
    {
        rn.status = RenderNodeStatus::Idle;
        release_current_pool_share(rn);
        return Vec::new();
    }

    if command_statuses.iter().any(|(_, s)| *s == CommandStatus::Running) {
        rn.status = RenderNodeStatus::Working;
    } else if command_statuses.iter().any(|(_, s)| *s == CommandStatus::Error) {
        rn.status = RenderNodeStatus::Working;
    } else if command_statuses
        .iter()
        .any(|(_, s)| *s == CommandStatus::Finishing)
    {
        rn.status = RenderNodeStatus::Finishing;
    } else if command_statuses
        .iter()
        .any(|(_, s)| *s == CommandStatus::Assigned)
    {
        rn.status = RenderNodeStatus::Assigned;
    } else if rn.status == RenderNodeStatus::Unknown {
        rn.status = RenderNodeStatus::Idle;
    } else if command_statuses.iter().any(|(_, s)| *s == CommandStatus::Done) {
        // Finishing rather than Idle, so the node keeps its place in the
        // scheduler's priority ordering until the command is cleared.
        rn.status = RenderNodeStatus::Finishing;
    } else if !matches!(
        rn.status,
        RenderNodeStatus::Idle
            | RenderNodeStatus::Booting
            | RenderNodeStatus::Unknown
            | RenderNodeStatus::Paused
    ) {
        error!(
            rendernode = %rn.name,
            status = %rn.status,
            "unable to compute new status for render node"
        );
    }

    Vec::new()
}

/// Release a node stuck in FINISHING or BOOTING back to IDLE once the
/// dispatch loop has cleared the commands that held it there.
pub fn release_finishing_status(rn: &mut RenderNode) {
    if matches!(rn.status, RenderNodeStatus::Finishing | RenderNodeStatus::Booting) {
        rn.status = RenderNodeStatus::Idle;
        release_current_pool_share(rn);
    }
}

fn release_current_pool_share(rn: &mut RenderNode) {
    rn.current_pool_share = None;
}

/// Record a command error/timeout against the node's quarantine history. A
/// given task-node only counts once, so retrying the same task repeatedly
/// on this node cannot itself trigger quarantine.
pub fn record_error(rn: &mut RenderNode, task_node: NodeId, now: DateTime<Utc>) {
    if !rn.tasks_history.insert(task_node) {
        return;
    }
    if rn.history.len() == ERROR_HISTORY_CAPACITY {
        rn.history.pop_front();
    }
    rn.history.push_back(now);
}

/// Re-evaluate quarantine status: trips when at least [`ERROR_TOLERANCE`]
/// errors landed within the last [`HEARTBEAT_TIMEOUT_SECS`] window. Once
/// tripped, quarantine is sticky -- only [`clear_quarantine`] lifts it.
pub fn check_quarantine(rn: &mut RenderNode, now: DateTime<Utc>) {
    if rn.quarantined {
        return;
    }
    let recent = rn
        .history
        .iter()
        .filter(|t| (now - **t).num_seconds() <= HEARTBEAT_TIMEOUT_SECS)
        .count();
    if recent >= ERROR_TOLERANCE {
        rn.quarantined = true;
    }
}

/// Administrative override (`/rendernodes/<name>/clear-quarantine/`).
pub fn clear_quarantine(rn: &mut RenderNode) {
    rn.quarantined = false;
    rn.history.clear();
    rn.tasks_history.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PoolShareId, RenderNodeId};
    use chrono::Duration;

    fn idle_node() -> RenderNode {
        let mut rn = RenderNode::new(RenderNodeId(1), "rn01:3000", "rn01", 3000, 8, 16_000, 1.0);
        rn.is_registered = true;
        rn.status = RenderNodeStatus::Idle;
        rn.last_alive_time = Utc::now();
        rn
    }

    #[test]
    fn heartbeat_timeout_sets_unknown_and_times_out_commands() {
        let mut rn = idle_node();
        rn.last_alive_time = Utc::now() - Duration::seconds(HEARTBEAT_TIMEOUT_SECS + 1);
        rn.commands.insert(CommandId(1));
        let timed_out = update_status(&mut rn, &[(CommandId(1), CommandStatus::Running)], Utc::now());
        assert_eq!(rn.status, RenderNodeStatus::Unknown);
        assert_eq!(timed_out, vec![CommandId(1)]);
    }

    #[test]
    fn no_commands_reverts_to_idle_and_frees_pool_share() {
        let mut rn = idle_node();
        rn.status = RenderNodeStatus::Finishing;
        rn.current_pool_share = Some(PoolShareId(1));
        update_status(&mut rn, &[], Utc::now());
        assert_eq!(rn.status, RenderNodeStatus::Idle);
        assert_eq!(rn.current_pool_share, None);
    }

    #[test]
    fn running_command_wins_priority_over_assigned() {
        let mut rn = idle_node();
        rn.commands.insert(CommandId(1));
        rn.commands.insert(CommandId(2));
        update_status(
            &mut rn,
            &[
                (CommandId(1), CommandStatus::Assigned),
                (CommandId(2), CommandStatus::Running),
            ],
            Utc::now(),
        );
        assert_eq!(rn.status, RenderNodeStatus::Working);
    }

    #[test]
    fn done_command_parks_at_finishing_not_idle() {
        let mut rn = idle_node();
        rn.commands.insert(CommandId(1));
        update_status(&mut rn, &[(CommandId(1), CommandStatus::Done)], Utc::now());
        assert_eq!(rn.status, RenderNodeStatus::Finishing);
    }

    #[test]
    fn release_finishing_status_returns_to_idle() {
        let mut rn = idle_node();
        rn.status = RenderNodeStatus::Finishing;
        rn.current_pool_share = Some(PoolShareId(3));
        release_finishing_status(&mut rn);
        assert_eq!(rn.status, RenderNodeStatus::Idle);
        assert_eq!(rn.current_pool_share, None);
    }

    #[test]
    fn quarantine_trips_after_tolerance_errors() {
        let mut rn = idle_node();
        let now = Utc::now();
        for i in 0..ERROR_TOLERANCE {
            record_error(&mut rn, NodeId(i as u64 + 1), now);
            check_quarantine(&mut rn, now);
        }
        assert!(rn.quarantined);
    }

    #[test]
    fn repeated_errors_on_same_task_do_not_double_count() {
        let mut rn = idle_node();
        let now = Utc::now();
        for _ in 0..ERROR_TOLERANCE {
            record_error(&mut rn, NodeId(1), now);
            check_quarantine(&mut rn, now);
        }
        assert!(!rn.quarantined);
    }

    #[test]
    fn old_errors_fall_outside_the_window() {
        let mut rn = idle_node();
        let old = Utc::now() - Duration::seconds(HEARTBEAT_TIMEOUT_SECS + 100);
        for i in 0..ERROR_TOLERANCE {
            record_error(&mut rn, NodeId(i as u64 + 1), old);
        }
        check_quarantine(&mut rn, Utc::now());
        assert!(!rn.quarantined);
    }

    #[test]
    fn clear_quarantine_resets_history() {
        let mut rn = idle_node();
        let now = Utc::now();
        for i in 0..ERROR_TOLERANCE {
            record_error(&mut rn, NodeId(i as u64 + 1), now);
        }
        rn.quarantined = true;
        clear_quarantine(&mut rn);
        assert!(!rn.quarantined);
        assert!(rn.history.is_empty());
        assert!(rn.tasks_history.is_empty());
    }
}
