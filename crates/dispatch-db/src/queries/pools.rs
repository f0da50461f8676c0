use anyhow::{Context, Result};
use dispatch_core::model::Pool;
use sqlx::PgPool;

use crate::models::PoolRow;

fn render_node_ids(pool: &Pool) -> serde_json::Value {
    let ids: Vec<u64> = pool.render_nodes.iter().map(|id| id.0).collect();
    serde_json::to_value(ids).expect("Vec<u64> always serializes")
}

pub async fn insert(db: &PgPool, pool: &Pool) -> Result<()> {
    sqlx::query(
        "INSERT INTO pools (id, name, render_nodes) VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET \
           name = EXCLUDED.name, render_nodes = EXCLUDED.render_nodes, updated_at = now()",
    )
    .bind(pool.id.0 as i64)
    .bind(&pool.name)
    .bind(render_node_ids(pool))
    .execute(db)
    .await
    .context("inserting pool")?;
    Ok(())
}

pub async fn update(db: &PgPool, pool: &Pool) -> Result<()> {
    sqlx::query("UPDATE pools SET name = $2, render_nodes = $3, updated_at = now() WHERE id = $1")
        .bind(pool.id.0 as i64)
        .bind(&pool.name)
        .bind(render_node_ids(pool))
        .execute(db)
        .await
        .context("updating pool")?;
    Ok(())
}

pub async fn load_all(db: &PgPool) -> Result<Vec<PoolRow>> {
    sqlx::query_as::<_, PoolRow>(
        "SELECT id, name, render_nodes, created_at, updated_at FROM pools",
    )
    .fetch_all(db)
    .await
    .context("loading pools")
}
