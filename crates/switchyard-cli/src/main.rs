//! Switchyard CLI main entry point

use anyhow::Result;
use clap::Parser;
use switchyard_cli::commands::{Cli, CommandExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let executor = CommandExecutor::new(&cli.backend);
    let result = executor.execute(cli.command).await?;
    tracing::debug!("{}", result.message);

    // Exit with appropriate code
    if result.success {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
