//! kmm - shared control-plane PKI bootstrap

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kmm::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.log_json.then(|| fmt::layer().json()))
        .with((!cli.log_json).then(|| fmt::layer().with_target(false)))
        .init();

    cli.run().await?;
    Ok(())
}
