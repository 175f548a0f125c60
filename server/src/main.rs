use clap::Parser;
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use server::catalog::Catalog;
use server::lobby::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Path to the pictures directory
    #[arg(long)]
    path: PathBuf,

    /// Milliseconds between revealed lines
    #[arg(short, long, default_value = "1000")]
    tick_ms: u64,

    /// Maximum number of connected players
    #[arg(short, long, default_value = "32")]
    max_players: usize,

    /// Seed for picture selection
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = ServerConfig {
        address: format!("{}:{}", args.host, args.port),
        catalog_path: args.path,
        tick: Duration::from_millis(args.tick_ms),
        max_players: args.max_players,
    };

    let catalog = match Catalog::load(&config.catalog_path) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!("Cannot start: {}", e);
            return Err(e.into());
        }
    };

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let cancel = CancellationToken::new();
    let server = Server::bind(&config, catalog, rng, cancel.clone()).await?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    });

    match server.run().await? {
        Some(round) => info!("Round over ({:?})", round.status),
        None => info!("No round was played"),
    }

    Ok(())
}
