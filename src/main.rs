use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clusterpool::{cli, config, Core};

#[derive(Parser)]
#[command(name = "clusterpool")]
#[command(version, about = "Resilient load-balanced transport for memcache and search clusters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to CLUSTER_* / TRANSPORT_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the discovered cluster topology
    Endpoints,

    /// Show connection pool health
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send liveness requests through the transport
    Ping {
        /// Number of requests
        #[arg(short, long, default_value = "1")]
        count: usize,
    },

    /// Fetch an item (memcache)
    Get {
        key: String,
    },

    /// Store an item (memcache)
    Set {
        key: String,

        value: String,

        /// Expiration in seconds (0 = never)
        #[arg(long, default_value = "0")]
        ttl: u32,
    },

    /// Delete an item (memcache)
    Delete {
        key: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One-shot commands: current_thread is enough to drive the worker task
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let core = Core::new(config).await?;

    let outcome = match cli.command {
        Commands::Endpoints => cli::commands::cmd_endpoints(&core).await,
        Commands::Stats { json } => cli::commands::cmd_stats(&core, json).await,
        Commands::Ping { count } => cli::commands::cmd_ping(&core, count).await,
        Commands::Get { key } => cli::commands::cmd_get(&core, &key).await,
        Commands::Set { key, value, ttl } => cli::commands::cmd_set(&core, &key, &value, ttl).await,
        Commands::Delete { key } => cli::commands::cmd_delete(&core, &key).await,
    };

    core.shutdown().await?;
    outcome
}
