//! # runner-exec
//!
//! Run a program on a runner server from the command line.
//!
//! ```text
//! runner-exec [OPTIONS] <PROGRAM> [ARGS]...
//! ```
//!
//! Logs go to stderr; program output goes to stdout and stderr unchanged.

use clap::Parser;
use runner_cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        "runner-exec v{} starting {}",
        env!("CARGO_PKG_VERSION"),
        args.program
    );

    let code = runner_cli::run(&args, &config).await.map_err(|e| {
        tracing::error!("{:#}", e);
        e
    })?;

    tracing::info!("{} exited with code {}", args.program, code);

    // Blocking stdin reads would otherwise hold the runtime open
    std::process::exit(code);
}
