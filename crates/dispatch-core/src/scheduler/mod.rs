//! Fair-share scheduling engine (C5): picks entry points, divides render
//! node capacity across pools and priority groups, then matches READY
//! commands to available render nodes.
//!
//! Transcribed from `dispatcher.py`'s `computeAssignments` (original
//! source): the priority-group capacity split, the single-node-in-a-
//! priority-group "unbounded" rule, and the two-phase global sort
//! (`dispatch_key` descending, `id` ascending) all mirror the original
//! control flow rather than a generic re-derivation.

use std::collections::HashMap;

use tracing::debug;

use crate::model::{
    CommandId, CommandStatus, LicenseManager, NodeId, PoolId, PoolShareId, RenderNodeId,
    RenderNodeStatus,
};
use crate::tree::{DispatchTree, GRAPHS_FOLDER};

/// One command handed to one render node this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub render_node: RenderNodeId,
    pub command: CommandId,
}

/// Compute this tick's assignments and apply their side effects directly to
/// the tree (command status -> Assigned, resource reservation, pool-share
/// allocation bookkeeping, license reservation). Returns the assignment
/// list for the transport layer to act on.
pub fn compute_assignments(tree: &mut DispatchTree, licenses: &mut LicenseManager) -> Vec<Assignment> {
    if !tree.render_nodes().any(|rn| rn.is_available()) {
        return Vec::new();
    }

    let mut entry_points = entry_points(tree);
    if entry_points.is_empty() {
        return Vec::new();
    }

    // Step A/B: any awake render node in a candidate pool at all?
    let any_awake = entry_points.iter().any(|ep| {
        tree.pool(ep.pool)
            .map(|pool| {
                pool.render_nodes.iter().any(|id| {
                    tree.render_node(*id)
                        .map(|rn| !matches!(rn.status, RenderNodeStatus::Unknown | RenderNodeStatus::Paused | RenderNodeStatus::Working))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    });
    if !any_awake {
        return Vec::new();
    }

    apportion_capacity(tree, &mut entry_points);

    // Global order: id ascending, then dispatch_key descending (stable
    // sort twice, matching the original's two-phase `sorted` calls).
    entry_points.sort_by_key(|ep| ep.node.0);
    entry_points.sort_by(|a, b| b.dispatch_key.cmp(&a.dispatch_key));

    let mut assignments = Vec::new();
    for ep in &entry_points {
        let Some(ps_id) = ep.pool_share else { continue };
        loop {
            let has_capacity = tree
                .pool_share(ps_id)
                .map(|ps| ps.has_render_nodes_available())
                .unwrap_or(false);
            if !has_capacity {
                break;
            }
            match dispatch_one(tree, licenses, ep.node, ep.pool, ps_id) {
                Some(assignment) => assignments.push(assignment),
                None => break,
            }
        }
    }

    assignments
}

struct EntryPoint {
    node: NodeId,
    pool: PoolId,
    pool_share: Option<PoolShareId>,
    dispatch_key: i64,
}

fn entry_points(tree: &DispatchTree) -> Vec<EntryPoint> {
    use crate::model::NodeStatus;

    let mut seen = HashMap::new();
    for ps in tree.pool_shares() {
        let Some(node) = tree.node(ps.node) else { continue };
        if node.name == GRAPHS_FOLDER {
            continue;
        }
        if matches!(
            node.status,
            NodeStatus::Blocked | NodeStatus::Done | NodeStatus::Canceled | NodeStatus::Paused
        ) {
            continue;
        }
        if node.ready_command_count(tree.commands()) == 0 {
            continue;
        }
        seen.entry(ps.node).or_insert_with(|| EntryPoint {
            node: ps.node,
            pool: ps.pool,
            pool_share: Some(ps.id),
            dispatch_key: node.dispatch_key,
        });
    }
    seen.into_values().collect()
}

/// Step B: divide each pool's awake render-node count across the entry
/// points sharing it, honoring user-defined caps and further subdividing
/// by `dispatch_key` priority group.
fn apportion_capacity(tree: &mut DispatchTree, entry_points: &mut [EntryPoint]) {
    let mut by_pool: HashMap<PoolId, Vec<usize>> = HashMap::new();
    for (i, ep) in entry_points.iter().enumerate() {
        by_pool.entry(ep.pool).or_default().push(i);
    }

    for (pool_id, indices) in by_pool {
        let Some(pool) = tree.pool(pool_id) else { continue };
        let mut rn_size: i64 = pool
            .render_nodes
            .iter()
            .filter(|id| {
                tree.render_node(**id)
                    .map(|rn| !matches!(rn.status, RenderNodeStatus::Unknown | RenderNodeStatus::Paused))
                    .unwrap_or(false)
            })
            .count() as i64;

        let mut auto: Vec<usize> = Vec::new();
        for &i in &indices {
            let ps_id = entry_points[i].pool_share;
            let Some(ps_id) = ps_id else { continue };
            let Some(ps) = tree.pool_share(ps_id) else { continue };
            if ps.user_defined_max_rn && !matches!(ps.max_rn, -1 | 0) {
                rn_size -= ps.max_rn;
            } else {
                auto.push(i);
            }
        }

        if auto.is_empty() {
            continue;
        }
        // Ascending node id, so the remainder below lands on the lowest-id
        // entry points first (spec step B.3), matching the original's
        // `sorted(nodesList)` before `groupby(dispatchKey)`.
        auto.sort_by_key(|&i| entry_points[i].node.0);
        let base = rn_size.div_euclid(auto.len() as i64).max(0);
        let mut remainder = rn_size.rem_euclid(auto.len() as i64).max(0);

        // Sub-group by dispatch_key, highest priority first.
        let mut by_priority: HashMap<i64, Vec<usize>> = HashMap::new();
        for &i in &auto {
            by_priority.entry(entry_points[i].dispatch_key).or_default().push(i);
        }
        let mut priorities: Vec<i64> = by_priority.keys().copied().collect();
        priorities.sort_by(|a, b| b.cmp(a));

        for dk in priorities {
            let group = &by_priority[&dk];
            if group.len() == 1 {
                let idx = group[0];
                if let Some(ps_id) = entry_points[idx].pool_share {
                    if let Some(ps) = tree.pool_share_mut(ps_id) {
                        ps.max_rn = -1;
                    }
                }
                continue;
            }

            if dk != 0 {
                let group_base = rn_size.div_euclid(group.len() as i64).max(0);
                let mut group_remainder = rn_size.rem_euclid(group.len() as i64).max(0);
                for &idx in group {
                    let mut share = group_base;
                    if group_remainder > 0 {
                        share += 1;
                        group_remainder -= 1;
                    }
                    if let Some(ps_id) = entry_points[idx].pool_share {
                        if let Some(ps) = tree.pool_share_mut(ps_id) {
                            ps.max_rn = share;
                        }
                    }
                }
            } else {
                for &idx in group {
                    let mut share = base;
                    if remainder > 0 {
                        share += 1;
                        remainder -= 1;
                    }
                    if let Some(ps_id) = entry_points[idx].pool_share {
                        if let Some(ps) = tree.pool_share_mut(ps_id) {
                            ps.max_rn = share;
                        }
                    }
                }
            }
        }
    }
}

/// Step C/D: find one READY command on `node` and one available, matching
/// render node in `pool`, assign them, and apply every side effect.
fn dispatch_one(
    tree: &mut DispatchTree,
    licenses: &mut LicenseManager,
    node: NodeId,
    pool: PoolId,
    pool_share: PoolShareId,
) -> Option<Assignment> {
    let command_id = next_ready_command(tree, node)?;
    let task_node = tree.node(node)?;
    let task = task_node.task()?.clone();

    let candidate_rn = tree
        .pool(pool)?
        .render_nodes
        .iter()
        .copied()
        .find(|id| {
            tree.render_node(*id)
                .map(|rn| rn.is_available() && rn.can_run(&task))
                .unwrap_or(false)
        })?;

    if let Some(license_name) = &task.license {
        if !licenses.reserve(license_name, candidate_rn) {
            return None;
        }
    }

    let rn = tree.render_node_mut(candidate_rn)?;
    rn.reserve_resources(command_id, &task);
    rn.commands.insert(command_id);
    rn.current_pool_share = Some(pool_share);

    let command = tree.command_mut(command_id)?;
    command.status = CommandStatus::Assigned;
    command.render_node = Some(candidate_rn);

    if let Some(ps) = tree.pool_share_mut(pool_share) {
        ps.allocated_rn += 1;
    }

    debug!(node = node.0, command = command_id.0, render_node = candidate_rn.0, "assignment computed");

    Some(Assignment {
        render_node: candidate_rn,
        command: command_id,
    })
}

/// Release a command's resource reservation and license hold and return its
/// render node to the former pool-share's count. Shared by [`clear_assignment`]
/// (which also resets the command to READY) and [`reconcile_finished_commands`]
/// (which leaves a command's final status untouched).
fn release_assignment_resources(tree: &mut DispatchTree, licenses: &mut LicenseManager, rn_id: RenderNodeId, command_id: CommandId) {
    let task_license = tree
        .command(command_id)
        .and_then(|c| tree.node(c.task_node))
        .and_then(|n| n.task())
        .and_then(|t| t.license.clone());

    if let Some(rn) = tree.render_node_mut(rn_id) {
        rn.release_resources(command_id);
        rn.commands.remove(&command_id);
        if let Some(ps_id) = rn.current_pool_share {
            if let Some(ps) = tree.pool_share_mut(ps_id) {
                ps.allocated_rn = (ps.allocated_rn - 1).max(0);
            }
        }
    }

    if let Some(name) = task_license {
        let _ = licenses.release(&name, rn_id);
    }
}

/// Undo everything [`dispatch_one`] did for one command: release its
/// resource reservation and license hold, return it to the render node's
/// former pool-share count, and reset the command to READY. Used on
/// transport failure, cancellation, and render-node timeout alike.
pub fn clear_assignment(tree: &mut DispatchTree, licenses: &mut LicenseManager, rn_id: RenderNodeId, command_id: CommandId) {
    release_assignment_resources(tree, licenses, rn_id, command_id);

    if let Some(command) = tree.command_mut(command_id) {
        command.clear_assignment();
    }
}

/// Reconcile commands that reached a final status (DONE, CANCELED) but are
/// still sitting in their render node's `commands` set: release their
/// resources and license hold, give the pool-share its slot back, and clear
/// the command's `render_node` link. Mirrors the original's
/// `unassign`/`releaseFinishingStatus` (`rendernode.py`), which performed
/// this bookkeeping whenever a command left the node instead of only on
/// reassignment. Called once per tick, ahead of render-node status
/// recomputation, so a finished command doesn't hold its node FINISHING or
/// leak its reservation forever.
pub fn reconcile_finished_commands(tree: &mut DispatchTree, licenses: &mut LicenseManager) {
    let finished: Vec<(RenderNodeId, CommandId)> = tree
        .render_nodes()
        .flat_map(|rn| {
            let rn_id = rn.id;
            rn.commands.iter().copied().map(move |cid| (rn_id, cid))
        })
        .filter(|(_, cid)| tree.command(*cid).map(|c| c.status.is_final()).unwrap_or(false))
        .collect();

    for (rn_id, command_id) in finished {
        release_assignment_resources(tree, licenses, rn_id, command_id);
        if let Some(command) = tree.command_mut(command_id) {
            command.render_node = None;
        }
    }
}

fn next_ready_command(tree: &DispatchTree, node: NodeId) -> Option<CommandId> {
    let task = tree.node(node)?.task()?;
    task.commands
        .iter()
        .copied()
        .find(|cid| {
            tree.command(*cid)
                .map(|c| c.status == CommandStatus::Ready)
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RenderNode, RenderNodeId};
    use crate::tree::{GraphSubmission, SubmittedNode};
    use std::collections::HashMap as Map;

    fn single_task_submission(name: &str, count: i64, dispatch_key: i64) -> GraphSubmission {
        GraphSubmission {
            name: name.to_owned(),
            pool: "default".to_owned(),
            max_rn: None,
            tags: Map::new(),
            root: SubmittedNode::Task {
                name: name.to_owned(),
                dispatch_key,
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

    fn with_one_render_node(tree: &mut DispatchTree) -> RenderNodeId {
        let pool = tree.get_or_create_pool("default");
        let mut rn = RenderNode::new(RenderNodeId(1), "rn01:3000", "rn01", 3000, 8, 16_000, 1.0);
        rn.is_registered = true;
        rn.status = RenderNodeStatus::Idle;
        rn.pools.push(pool);
        tree.register_render_node(rn)
    }

    #[test]
    fn assigns_ready_command_to_available_render_node() {
        let mut tree = DispatchTree::new();
        with_one_render_node(&mut tree);
        let leaves = tree.register_graph(single_task_submission("job1", 1, 0)).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();

        let mut licenses = LicenseManager::new();
        let assignments = compute_assignments(&mut tree, &mut licenses);

        assert_eq!(assignments.len(), 1);
        let task = tree.node(leaves[0]).unwrap().task().unwrap();
        assert_eq!(
            tree.command(task.commands[0]).unwrap().status,
            CommandStatus::Assigned
        );
    }

    #[test]
    fn no_assignment_without_available_render_nodes() {
        let mut tree = DispatchTree::new();
        tree.register_graph(single_task_submission("job1", 1, 0)).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();

        let mut licenses = LicenseManager::new();
        let assignments = compute_assignments(&mut tree, &mut licenses);
        assert!(assignments.is_empty());
    }

    #[test]
    fn single_node_priority_group_gets_unbounded_max_rn() {
        let mut tree = DispatchTree::new();
        with_one_render_node(&mut tree);
        tree.register_graph(single_task_submission("job1", 1, 5)).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();

        let mut licenses = LicenseManager::new();
        compute_assignments(&mut tree, &mut licenses);

        let ps = tree.pool_shares().next().unwrap();
        assert_eq!(ps.max_rn, -1);
    }

    #[test]
    fn higher_dispatch_key_is_served_first() {
        let mut tree = DispatchTree::new();
        with_one_render_node(&mut tree);
        tree.register_graph(single_task_submission("low", 1, 0)).unwrap();
        tree.register_graph(single_task_submission("high", 1, 10)).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();

        let mut licenses = LicenseManager::new();
        let assignments = compute_assignments(&mut tree, &mut licenses);
        assert_eq!(assignments.len(), 1);

        let high_node = tree.find_by_path("graphs/high").unwrap();
        let high_task = tree.node(high_node).unwrap().task().unwrap();
        assert_eq!(
            tree.command(high_task.commands[0]).unwrap().status,
            CommandStatus::Assigned
        );
    }

    #[test]
    fn license_gate_blocks_assignment_when_exhausted() {
        let mut tree = DispatchTree::new();
        with_one_render_node(&mut tree);
        let mut submission = single_task_submission("job1", 1, 0);
        if let SubmittedNode::Task { license, .. } = &mut submission.root {
            *license = Some("maya".to_owned());
        }
        tree.register_graph(submission).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();

        let mut licenses = LicenseManager::new();
        licenses.set_max("maya", 0);
        let assignments = compute_assignments(&mut tree, &mut licenses);
        assert!(assignments.is_empty());
    }

    #[test]
    fn clear_assignment_frees_resources_and_resets_command() {
        let mut tree = DispatchTree::new();
        let rn_id = with_one_render_node(&mut tree);
        let mut submission = single_task_submission("job1", 1, 0);
        if let SubmittedNode::Task { license, .. } = &mut submission.root {
            *license = Some("maya".to_owned());
        }
        let leaves = tree.register_graph(submission).unwrap();
        tree.validate_dependencies();
        tree.update_completion_and_status();

        let mut licenses = LicenseManager::new();
        licenses.set_max("maya", 1);
        let assignments = compute_assignments(&mut tree, &mut licenses);
        assert_eq!(assignments.len(), 1);
        let command_id = assignments[0].command;

        clear_assignment(&mut tree, &mut licenses, rn_id, command_id);

        assert_eq!(tree.command(command_id).unwrap().status, CommandStatus::Ready);
        assert_eq!(tree.render_node(rn_id).unwrap().free_cores, 8);
        assert_eq!(licenses.get("maya").unwrap().used, 0);
        let task = tree.node(leaves[0]).unwrap().task().unwrap();
        assert_eq!(task.commands[0], command_id);
    }
}
