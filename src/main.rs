mod demo;

use crate::demo::Env;
use anyhow::Result;
use clap::{Parser, Subcommand};
use persistkit::{InMemoryGrid, PersistenceUnit};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "persistkit")]
#[command(about = "CRUD scenarios over the in-memory persistence engine")]
struct Cli {
    /// Upper bound of pooled units of work
    #[arg(long, default_value_t = 10)]
    max_units: usize,
    /// Seconds to wait for a free unit of work
    #[arg(long, default_value_t = 30)]
    acquire_timeout: u64,
    #[arg(long, default_value = "node-1")]
    node: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One create, update, read, search and delete cycle
    Simple,
    /// Batched inserts followed by batched updates
    Batch {
        #[arg(long, default_value_t = 100)]
        count: usize,
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
    },
    /// Many simple cycles running at the same time
    Concurrent {
        #[arg(long, default_value_t = 50)]
        tasks: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let unit = PersistenceUnit::new("testUnit")
        .entity("Post")
        .max_units(cli.max_units)
        .acquire_timeout(Duration::from_secs(cli.acquire_timeout));

    let grid = InMemoryGrid::new();
    let env = Env::start(unit, &grid, &cli.node).await?;

    let outcome = match cli.command {
        Command::Simple => env.simple_crud().await,
        Command::Batch { count, batch_size } => {
            env.batch_crud(count, batch_size).await.map(|_| ())
        }
        Command::Concurrent { tasks } => env.concurrent_crud(tasks).await,
    };

    env.report().await?;
    env.shutdown().await?;
    outcome
}
