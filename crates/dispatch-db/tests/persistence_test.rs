//! Round-trips entities through `DbPersistence` against a real Postgres
//! instance: create, modify, archive, and startup recovery via `load_all`.

use dispatch_core::model::{
    Command, CommandId, CommandStatus, Node, NodeId, Pool, PoolId, PoolShare, PoolShareId,
    RenderNode, RenderNodeId, Task,
};
use dispatch_core::persistence::Persistence;
use dispatch_core::tree::DirtyRecord;
use dispatch_db::DbPersistence;

use dispatch_test_utils::{create_test_db, drop_test_db};

fn task_node(id: NodeId, name: &str, command: CommandId) -> Node {
    let mut task = Task::new("maya");
    task.commands = vec![command];
    Node::new_task(id, name, Some(NodeId(1)), task)
}

#[tokio::test]
async fn create_then_load_all_recovers_node_and_its_commands() {
    let (pool, db_name) = create_test_db().await;
    let db = DbPersistence::new(pool.clone());

    let node = task_node(NodeId(10), "shot_010", CommandId(100));
    let command = Command::new(CommandId(100), NodeId(10), "render frame 1-10");

    db.create_nodes(&[(&node, vec![&command])]).await.unwrap();

    let state = db.load_all().await.unwrap();
    assert_eq!(state.nodes.len(), 1);
    assert_eq!(state.nodes[0].id, NodeId(10));
    assert_eq!(state.commands.len(), 1);
    assert_eq!(state.commands[0].id, CommandId(100));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn modify_nodes_overwrites_status_and_command_snapshot() {
    let (pool, db_name) = create_test_db().await;
    let db = DbPersistence::new(pool.clone());

    let mut node = task_node(NodeId(11), "shot_011", CommandId(101));
    let mut command = Command::new(CommandId(101), NodeId(11), "render frame 1-10");
    db.create_nodes(&[(&node, vec![&command])]).await.unwrap();

    node.status = dispatch_core::model::NodeStatus::Running;
    command.status = CommandStatus::Running;
    command.completion = 0.5;
    db.modify_nodes(&[(&node, vec![&command])]).await.unwrap();

    let state = db.load_all().await.unwrap();
    assert_eq!(state.nodes[0].status, dispatch_core::model::NodeStatus::Running);
    assert_eq!(state.commands[0].completion, 0.5);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn archive_nodes_excludes_them_from_recovery() {
    let (pool, db_name) = create_test_db().await;
    let db = DbPersistence::new(pool.clone());

    let node = task_node(NodeId(12), "shot_012", CommandId(102));
    let command = Command::new(CommandId(102), NodeId(12), "render frame 1-10");
    db.create_nodes(&[(&node, vec![&command])]).await.unwrap();

    db.archive_nodes(&[DirtyRecord::Node(NodeId(12))])
        .await
        .unwrap();

    let state = db.load_all().await.unwrap();
    assert!(state.nodes.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pools_pool_shares_and_render_nodes_round_trip() {
    let (pool_handle, db_name) = create_test_db().await;
    let db = DbPersistence::new(pool_handle.clone());

    let mut pool = Pool::new(PoolId(1), "farm-a");
    pool.render_nodes.insert(RenderNodeId(1));
    db.create_pools(&[&pool]).await.unwrap();

    let node = Node::new_folder(NodeId(20), "entry", Some(NodeId(1)));
    db.create_nodes(&[(&node, vec![])]).await.unwrap();

    let share = PoolShare::new(PoolShareId(1), PoolId(1), NodeId(20), 4);
    db.create_pool_shares(&[&share]).await.unwrap();

    let rn = RenderNode::new(RenderNodeId(1), "rn01:3000", "rn01", 3000, 8, 16_000, 1.0);
    db.create_render_nodes(&[&rn]).await.unwrap();

    let state = db.load_all().await.unwrap();
    assert_eq!(state.pools.len(), 1);
    assert_eq!(state.pools[0].render_nodes.len(), 1);
    assert_eq!(state.pool_shares.len(), 1);
    assert_eq!(state.pool_shares[0].max_rn, 4);
    assert_eq!(state.render_nodes.len(), 1);
    assert_eq!(state.render_nodes[0].name, "rn01:3000");

    pool_handle.close().await;
    drop_test_db(&db_name).await;
}
