//! CRUD for the `nodes` table. A node row always carries its task's
//! commands alongside it (see [`crate::models::NodeRow`]); commands never
//! get their own table.

use anyhow::{Context, Result};
use dispatch_core::model::{Command, Node};
use sqlx::PgPool;

use crate::models::NodeRow;

fn node_columns(node: &Node, commands: &[&Command]) -> Result<(i64, Option<i64>, String, String, bool, i64, serde_json::Value, serde_json::Value)> {
    let data = serde_json::to_value(node).context("serializing node")?;
    let commands = serde_json::to_value(commands).context("serializing node's commands")?;
    Ok((
        node.id.0 as i64,
        node.parent.map(|p| p.0 as i64),
        node.name.clone(),
        node.status.to_string(),
        node.paused,
        node.dispatch_key,
        data,
        commands,
    ))
}

pub async fn insert(pool: &PgPool, node: &Node, commands: &[&Command]) -> Result<()> {
    let (id, parent, name, status, paused, dispatch_key, data, commands) =
        node_columns(node, commands)?;
    sqlx::query(
        "INSERT INTO nodes (id, parent, name, status, paused, dispatch_key, data, commands) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (id) DO UPDATE SET \
           parent = EXCLUDED.parent, name = EXCLUDED.name, status = EXCLUDED.status, \
           paused = EXCLUDED.paused, dispatch_key = EXCLUDED.dispatch_key, \
           data = EXCLUDED.data, commands = EXCLUDED.commands, updated_at = now()",
    )
    .bind(id)
    .bind(parent)
    .bind(name)
    .bind(status)
    .bind(paused)
    .bind(dispatch_key)
    .bind(data)
    .bind(commands)
    .execute(pool)
    .await
    .context("inserting node")?;
    Ok(())
}

pub async fn update(pool: &PgPool, node: &Node, commands: &[&Command]) -> Result<()> {
    let (id, parent, name, status, paused, dispatch_key, data, commands) =
        node_columns(node, commands)?;
    sqlx::query(
        "UPDATE nodes SET parent = $2, name = $3, status = $4, paused = $5, \
         dispatch_key = $6, data = $7, commands = $8, updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(parent)
    .bind(name)
    .bind(status)
    .bind(paused)
    .bind(dispatch_key)
    .bind(data)
    .bind(commands)
    .execute(pool)
    .await
    .context("updating node")?;
    Ok(())
}

/// Marks the given ids as archived (soft-delete -- the row stays for
/// history, but is excluded from [`load_all`]'s recovery scan).
pub async fn archive(pool: &PgPool, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE nodes SET archived_at = now(), updated_at = now() WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await
        .context("archiving nodes")?;
    Ok(())
}

/// Every non-archived node row, for startup recovery.
pub async fn load_all(pool: &PgPool) -> Result<Vec<NodeRow>> {
    sqlx::query_as::<_, NodeRow>(
        "SELECT id, parent, name, status, paused, dispatch_key, data, commands, \
                archived_at, created_at, updated_at \
         FROM nodes WHERE archived_at IS NULL",
    )
    .fetch_all(pool)
    .await
    .context("loading nodes")
}
