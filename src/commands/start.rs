use anyhow::Result;
use colored::Colorize;
use dbmon::{config::Config, server};
use tracing::info;

/// Execute the start command
///
/// Blocks until SIGTERM/SIGINT.
pub async fn execute(cfg: Config) -> Result<()> {
    println!("{}", "Starting dbmon in foreground mode...".green());
    info!(
        targets = cfg.targets.len(),
        "Starting dbmon v{}",
        env!("CARGO_PKG_VERSION")
    );

    server::start_server(cfg).await?;

    Ok(())
}
