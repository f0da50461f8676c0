use anyhow::{Context, Result};
use dispatch_core::model::PoolShare;
use sqlx::PgPool;

use crate::models::PoolShareRow;

pub async fn insert(db: &PgPool, share: &PoolShare) -> Result<()> {
    sqlx::query(
        "INSERT INTO pool_shares (id, pool, node, max_rn, allocated_rn, user_defined_max_rn) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (id) DO UPDATE SET \
           max_rn = EXCLUDED.max_rn, allocated_rn = EXCLUDED.allocated_rn, \
           user_defined_max_rn = EXCLUDED.user_defined_max_rn, updated_at = now()",
    )
    .bind(share.id.0 as i64)
    .bind(share.pool.0 as i64)
    .bind(share.node.0 as i64)
    .bind(share.max_rn)
    .bind(share.allocated_rn)
    .bind(share.user_defined_max_rn)
    .execute(db)
    .await
    .context("inserting pool share")?;
    Ok(())
}

pub async fn update(db: &PgPool, share: &PoolShare) -> Result<()> {
    sqlx::query(
        "UPDATE pool_shares SET max_rn = $2, allocated_rn = $3, \
         user_defined_max_rn = $4, updated_at = now() WHERE id = $1",
    )
    .bind(share.id.0 as i64)
    .bind(share.max_rn)
    .bind(share.allocated_rn)
    .bind(share.user_defined_max_rn)
    .execute(db)
    .await
    .context("updating pool share")?;
    Ok(())
}

pub async fn load_all(db: &PgPool) -> Result<Vec<PoolShareRow>> {
    sqlx::query_as::<_, PoolShareRow>(
        "SELECT id, pool, node, max_rn, allocated_rn, user_defined_max_rn, \
                created_at, updated_at \
         FROM pool_shares",
    )
    .fetch_all(db)
    .await
    .context("loading pool shares")
}
