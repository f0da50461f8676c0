//! `dispatchd status` command: summarize the persisted dispatch tree.
//!
//! Runs against the archive directly rather than the live loop -- there is
//! no IPC into a running `dispatchd serve` process, and the archive is kept
//! current every tick (spec §6), so it is an accurate-enough view between
//! heartbeats.

use std::collections::BTreeMap;

use anyhow::Result;
use dispatch_core::Persistence;
use dispatch_db::DbPersistence;
use sqlx::PgPool;

/// Run the status command: load the archive and print per-status counts
/// for nodes, commands, render nodes, and pools.
pub async fn run_status(pool: &PgPool) -> Result<()> {
    let persistence = DbPersistence::new(pool.clone());
    let state = persistence.load_all().await?;

    println!("Nodes: {}", state.nodes.len());
    print_counts(state.nodes.iter().map(|n| n.status.to_string()));
    println!();

    println!("Commands: {}", state.commands.len());
    print_counts(state.commands.iter().map(|c| c.status.to_string()));
    println!();

    println!("Render nodes: {}", state.render_nodes.len());
    print_counts(state.render_nodes.iter().map(|rn| rn.status.to_string()));
    println!();

    println!("Pools: {}", state.pools.len());
    println!("Pool shares: {}", state.pool_shares.len());

    Ok(())
}

fn print_counts(statuses: impl Iterator<Item = String>) {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for status in statuses {
        *counts.entry(status).or_default() += 1;
    }
    for (status, count) in &counts {
        println!("  {status}: {count}");
    }
}
