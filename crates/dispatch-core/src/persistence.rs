//! The named interface the persistence collaborator implements. Core
//! never depends on a concrete store; `dispatch-db` implements this trait
//! against Postgres.

use async_trait::async_trait;

use crate::model::{Command, Node, Pool, PoolShare, RenderNode};
use crate::tree::DirtyRecord;

/// A node paired with the full command rows its task currently owns, since
/// commands are archived together with their node rather than as a table of
/// their own -- `Node`'s own `commands: Vec<CommandId>` is only a lookup key
/// into the tree's live command map.
pub type NodeWithCommands<'a> = (&'a Node, Vec<&'a Command>);

/// Archival and recovery contract for the dispatch tree's four tables
/// (nodes -- commands travel with their owning node --, pools, pool-shares,
/// render nodes).
#[async_trait]
pub trait Persistence: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create_nodes(&self, nodes: &[NodeWithCommands<'_>]) -> Result<(), Self::Error>;
    async fn modify_nodes(&self, nodes: &[NodeWithCommands<'_>]) -> Result<(), Self::Error>;
    async fn archive_nodes(&self, ids: &[DirtyRecord]) -> Result<(), Self::Error>;

    async fn create_pools(&self, pools: &[&Pool]) -> Result<(), Self::Error>;
    async fn modify_pools(&self, pools: &[&Pool]) -> Result<(), Self::Error>;

    async fn create_pool_shares(&self, shares: &[&PoolShare]) -> Result<(), Self::Error>;
    async fn modify_pool_shares(&self, shares: &[&PoolShare]) -> Result<(), Self::Error>;

    async fn create_render_nodes(&self, nodes: &[&RenderNode]) -> Result<(), Self::Error>;
    async fn modify_render_nodes(&self, nodes: &[&RenderNode]) -> Result<(), Self::Error>;

    /// Load the full tree state on startup recovery (spec §6 "recovers its
    /// in-memory state from the persisted archive on restart"). A fresh
    /// deployment returns the empty default.
    async fn load_all(&self) -> Result<PersistedState, Self::Error>;
}

/// Snapshot returned by [`Persistence::load_all`], used to rehydrate a
/// [`crate::tree::DispatchTree`] on startup.
#[derive(Debug, Default, Clone)]
pub struct PersistedState {
    pub nodes: Vec<Node>,
    /// Every command owned by a task node in `nodes`, flattened -- a node's
    /// own `Task::commands` field only carries ids.
    pub commands: Vec<Command>,
    pub pools: Vec<Pool>,
    pub pool_shares: Vec<PoolShare>,
    pub render_nodes: Vec<RenderNode>,
}

/// No-op persistence, useful for tests and for running the dispatch loop
/// without a configured database.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

#[derive(Debug, thiserror::Error)]
#[error("null persistence never fails")]
pub struct NullPersistenceError;

#[async_trait]
impl Persistence for NullPersistence {
    type Error = NullPersistenceError;

    async fn create_nodes(&self, _: &[NodeWithCommands<'_>]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn modify_nodes(&self, _: &[NodeWithCommands<'_>]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn archive_nodes(&self, _: &[DirtyRecord]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn create_pools(&self, _: &[&Pool]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn modify_pools(&self, _: &[&Pool]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn create_pool_shares(&self, _: &[&PoolShare]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn modify_pool_shares(&self, _: &[&PoolShare]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn create_render_nodes(&self, _: &[&RenderNode]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn modify_render_nodes(&self, _: &[&RenderNode]) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn load_all(&self) -> Result<PersistedState, Self::Error> {
        Ok(PersistedState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_persistence_accepts_everything() {
        let p = NullPersistence;
        assert!(p.create_nodes(&[]).await.is_ok());
        assert!(p.load_all().await.unwrap().nodes.is_empty());
    }
}
