mod config;
mod http;
mod status_cmd;
#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use dispatch_core::ingress;
use dispatch_core::loop_driver::DispatchLoop;
use dispatch_core::model::LicenseManager;
use dispatch_core::persistence::NullPersistence;
use dispatch_core::tree::DispatchTree;
use dispatch_core::Persistence;
use dispatch_db::DbPersistence;

use config::DispatcherConfig;

#[derive(Parser)]
#[command(name = "dispatchd", about = "render-farm job dispatcher")]
struct Cli {
    /// Database URL (overrides DISPATCHD_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a dispatchd config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/dispatchd")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the dispatchd database (requires config file or env vars)
    DbInit,
    /// Run the dispatch loop and HTTP server
    Serve,
    /// Show counts of nodes, commands, and render nodes by status
    Status,
}

/// Execute the `dispatchd init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    cfg.database.url = db_url.to_string();

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `dispatchd db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `dispatchd db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DispatcherConfig::resolve(cli_db_url)?;

    println!("Initializing dispatchd database...");

    dispatch_db::pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = dispatch_db::pool::create_pool(&resolved.db_config).await?;

    let migrations_path = dispatch_db::pool::default_migrations_path();
    dispatch_db::pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = dispatch_db::pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("dispatchd db-init complete.");
    Ok(())
}

/// Execute the `dispatchd serve` command: recover state, then run the tick
/// loop and HTTP server side by side until a shutdown signal arrives.
async fn cmd_serve(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DispatcherConfig::resolve(cli_db_url)?;

    let cancel = CancellationToken::new();

    let (tree, license_manager) = (DispatchTree::new(), LicenseManager::new());

    if resolved.db_enable {
        let db_pool = dispatch_db::pool::create_pool(&resolved.db_config).await?;
        let persistence = Arc::new(DbPersistence::new(db_pool));

        let tree = if resolved.db_clean_data {
            tree
        } else {
            let state = persistence
                .load_all()
                .await
                .context("failed to recover dispatch tree from the archive")?;
            DispatchTree::from_persisted(state)
        };

        run_loop_and_server(tree, license_manager, persistence, resolved, cancel).await
    } else {
        run_loop_and_server(tree, license_manager, Arc::new(NullPersistence), resolved, cancel).await
    }
}

async fn run_loop_and_server<P>(
    tree: DispatchTree,
    license_manager: LicenseManager,
    persistence: Arc<P>,
    config: DispatcherConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    P: dispatch_core::Persistence + 'static,
{
    let (ingress_tx, ingress_rx) = ingress::channel(ingress::DEFAULT_INGRESS_CAPACITY);

    let loop_driver = DispatchLoop::new(tree, license_manager, persistence, config.dispatch_config);

    let loop_cancel = cancel.clone();
    let loop_handle = tokio::spawn(async move { loop_driver.run(ingress_rx, loop_cancel).await });

    // `run_serve` installs its own Ctrl+C listener for axum's graceful
    // shutdown (tokio's signal handler supports multiple independent
    // listeners), so the server half needs no cancellation wiring here.
    let bind_address = config.bind_address.clone();
    let port = config.port;
    let server_handle =
        tokio::spawn(async move { http::run_serve(ingress_tx, &bind_address, port).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    loop_handle.await.context("dispatch loop task panicked")??;
    server_handle.await.context("http server task panicked")??;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve => {
            cmd_serve(cli.database_url.as_deref()).await?;
        }
        Commands::Status => {
            let resolved = DispatcherConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = dispatch_db::pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
