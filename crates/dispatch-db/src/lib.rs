//! Postgres-backed implementation of `dispatch_core::Persistence`: the
//! archival store the dispatch loop flushes its dirty sets into every tick,
//! and the recovery source it loads from on startup.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

use async_trait::async_trait;
use dispatch_core::model::{
    Command, CommandId, Node, NodeId, Pool, PoolId, PoolShare, PoolShareId, RenderNode,
    RenderNodeId,
};
use dispatch_core::persistence::{NodeWithCommands, PersistedState, Persistence};
use dispatch_core::tree::DirtyRecord;
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;

/// Everything that can go wrong talking to the archive. Wraps `sqlx::Error`
/// for query failures and `serde_json::Error` for the `data`-column
/// (de)serialization that stands between the wire model and the row shapes
/// in [`models`].
#[derive(Debug, Error)]
pub enum DbPersistenceError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed archive row: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `dispatch_core::Persistence` implementation over a `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct DbPersistence {
    pool: PgPool,
}

impl DbPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Persistence for DbPersistence {
    type Error = DbPersistenceError;

    #[instrument(skip(self, nodes))]
    async fn create_nodes(&self, nodes: &[NodeWithCommands<'_>]) -> Result<(), Self::Error> {
        for (node, commands) in nodes {
            queries::nodes::insert(&self.pool, node, commands).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, nodes))]
    async fn modify_nodes(&self, nodes: &[NodeWithCommands<'_>]) -> Result<(), Self::Error> {
        for (node, commands) in nodes {
            queries::nodes::update(&self.pool, node, commands).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn archive_nodes(&self, records: &[DirtyRecord]) -> Result<(), Self::Error> {
        let ids: Vec<i64> = records
            .iter()
            .filter_map(|r| match r {
                DirtyRecord::Node(id) => Some(id.0 as i64),
                _ => None,
            })
            .collect();
        queries::nodes::archive(&self.pool, &ids).await?;
        Ok(())
    }

    async fn create_pools(&self, pools: &[&Pool]) -> Result<(), Self::Error> {
        for pool in pools {
            queries::pools::insert(&self.pool, pool).await?;
        }
        Ok(())
    }

    async fn modify_pools(&self, pools: &[&Pool]) -> Result<(), Self::Error> {
        for pool in pools {
            queries::pools::update(&self.pool, pool).await?;
        }
        Ok(())
    }

    async fn create_pool_shares(&self, shares: &[&PoolShare]) -> Result<(), Self::Error> {
        for share in shares {
            queries::pool_shares::insert(&self.pool, share).await?;
        }
        Ok(())
    }

    async fn modify_pool_shares(&self, shares: &[&PoolShare]) -> Result<(), Self::Error> {
        for share in shares {
            queries::pool_shares::update(&self.pool, share).await?;
        }
        Ok(())
    }

    async fn create_render_nodes(&self, nodes: &[&RenderNode]) -> Result<(), Self::Error> {
        for rn in nodes {
            queries::render_nodes::insert(&self.pool, rn).await?;
        }
        Ok(())
    }

    async fn modify_render_nodes(&self, nodes: &[&RenderNode]) -> Result<(), Self::Error> {
        for rn in nodes {
            queries::render_nodes::update(&self.pool, rn).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> Result<PersistedState, Self::Error> {
        let node_rows = queries::nodes::load_all(&self.pool).await?;
        let pool_rows = queries::pools::load_all(&self.pool).await?;
        let pool_share_rows = queries::pool_shares::load_all(&self.pool).await?;
        let render_node_rows = queries::render_nodes::load_all(&self.pool).await?;

        let mut nodes = Vec::with_capacity(node_rows.len());
        let mut commands = Vec::new();
        for row in node_rows {
            let node: Node = serde_json::from_value(row.data)?;
            let row_commands: Vec<Command> = serde_json::from_value(row.commands)?;
            commands.extend(row_commands);
            nodes.push(node);
        }

        let pools = pool_rows
            .into_iter()
            .map(|row| {
                let render_node_ids: Vec<u64> = serde_json::from_value(row.render_nodes)?;
                Ok(Pool {
                    id: PoolId(row.id as u64),
                    name: row.name,
                    render_nodes: render_node_ids.into_iter().map(RenderNodeId).collect(),
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let pool_shares = pool_share_rows
            .into_iter()
            .map(|row| PoolShare {
                id: PoolShareId(row.id as u64),
                pool: PoolId(row.pool as u64),
                node: NodeId(row.node as u64),
                max_rn: row.max_rn,
                allocated_rn: row.allocated_rn,
                user_defined_max_rn: row.user_defined_max_rn,
            })
            .collect();

        let render_nodes = render_node_rows
            .into_iter()
            .map(|row| serde_json::from_value::<RenderNode>(row.data))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PersistedState {
            nodes,
            commands,
            pools,
            pool_shares,
            render_nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ids are stored in a signed `BIGINT` column; as long as the dispatch
    /// tree never hands out more than `i64::MAX` ids (it never will -- it's
    /// a `u64` counter incrementing once per submitted node) the cast back
    /// and forth is lossless.
    #[test]
    fn command_id_roundtrips_through_u64_cast() {
        let id = CommandId(42);
        assert_eq!(id.0 as i64 as u64, id.0);
    }
}
