//! Row shapes for the four archive tables. Each row carries a handful of
//! queryable columns (status, parent, host/port) plus a `data` JSONB blob
//! holding the `dispatch_core` model struct verbatim, so a schema change in
//! `dispatch-core` never forces a migration here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A dispatch-tree node row. `data` deserializes to `dispatch_core::model::Node`
/// and `commands` to `Vec<dispatch_core::model::Command>`.
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: i64,
    pub parent: Option<i64>,
    pub name: String,
    pub status: String,
    pub paused: bool,
    pub dispatch_key: i64,
    pub data: serde_json::Value,
    pub commands: serde_json::Value,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pool row. `render_nodes` deserializes to `Vec<u64>`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PoolRow {
    pub id: i64,
    pub name: String,
    pub render_nodes: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pool-share row: the (pool, entry-point node) binding with its capacity cap.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PoolShareRow {
    pub id: i64,
    pub pool: i64,
    pub node: i64,
    pub max_rn: i64,
    pub allocated_rn: i64,
    pub user_defined_max_rn: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A render-node row. `data` deserializes to `dispatch_core::model::RenderNode`.
#[derive(Debug, Clone, FromRow)]
pub struct RenderNodeRow {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub status: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
