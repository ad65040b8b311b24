//! unimem CLI - inspect memory providers and adapters

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("unimem=debug")
    } else {
        EnvFilter::new("unimem=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Providers(args) => commands::providers::execute(&config, args),
        Commands::Adapters => commands::adapters::execute(&config),
        Commands::Probe(args) => commands::probe::execute(&config, args),
        Commands::IpcOpen(args) => commands::ipc_open::execute(&config, args),
    }
}
