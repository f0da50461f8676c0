use anyhow::{Context, Result};
use dispatch_core::model::RenderNode;
use sqlx::PgPool;

use crate::models::RenderNodeRow;

fn columns(rn: &RenderNode) -> Result<(i64, String, String, i32, String, serde_json::Value)> {
    let data = serde_json::to_value(rn).context("serializing render node")?;
    Ok((
        rn.id.0 as i64,
        rn.name.clone(),
        rn.host.clone(),
        rn.port as i32,
        rn.status.to_string(),
        data,
    ))
}

pub async fn insert(db: &PgPool, rn: &RenderNode) -> Result<()> {
    let (id, name, host, port, status, data) = columns(rn)?;
    sqlx::query(
        "INSERT INTO render_nodes (id, name, host, port, status, data) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (id) DO UPDATE SET \
           name = EXCLUDED.name, host = EXCLUDED.host, port = EXCLUDED.port, \
           status = EXCLUDED.status, data = EXCLUDED.data, updated_at = now()",
    )
    .bind(id)
    .bind(name)
    .bind(host)
    .bind(port)
    .bind(status)
    .bind(data)
    .execute(db)
    .await
    .context("inserting render node")?;
    Ok(())
}

pub async fn update(db: &PgPool, rn: &RenderNode) -> Result<()> {
    let (id, name, host, port, status, data) = columns(rn)?;
    sqlx::query(
        "UPDATE render_nodes SET name = $2, host = $3, port = $4, status = $5, \
         data = $6, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(name)
    .bind(host)
    .bind(port)
    .bind(status)
    .bind(data)
    .execute(db)
    .await
    .context("updating render node")?;
    Ok(())
}

pub async fn load_all(db: &PgPool) -> Result<Vec<RenderNodeRow>> {
    sqlx::query_as::<_, RenderNodeRow>(
        "SELECT id, name, host, port, status, data, created_at, updated_at FROM render_nodes",
    )
    .fetch_all(db)
    .await
    .context("loading render nodes")
}
