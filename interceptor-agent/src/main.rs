//! Interceptor Agent Binary Entry Point

use clap::Parser;
use interceptor_agent::logging::{init_logging, LoggingConfig};
use interceptor_agent::{run_agent, Args};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&LoggingConfig::default().with_interceptor_level(&args.log_level))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping interceptor...");
            signal.cancel();
        }
    });

    if let Err(e) = run_agent(args, shutdown).await {
        tracing::error!("Interceptor agent failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
