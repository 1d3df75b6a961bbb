use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use tree_db::{cli::Cli, console, server::Server};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout is reserved for tree dumps.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let server = Server::bind(cli.listen).await?;
    let running = server.start()?;
    info!("database listening on {}", running.local_addr());

    let console_result = console::run(BufReader::new(tokio::io::stdin()), running.context()).await;
    if let Err(err) = &console_result {
        warn!("console exited with error: {err:?}");
    }

    running.shutdown().await?;
    console_result
}
