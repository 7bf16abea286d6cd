use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use dbmon::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    if let cli::Commands::Version = args.get_command() {
        println!("dbmon v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Log settings live in the config file, so load it before anything else
    let cfg = config::load_config(&args.config)?;
    init_tracing(&cfg.server.log_level, &cfg.server.log_format);

    match args.get_command() {
        cli::Commands::Start => commands::start::execute(cfg).await?,
        cli::Commands::Test => commands::test::execute(&cfg)?,
        cli::Commands::Version => {}
    }

    Ok(())
}
