mod cli;
mod commands;
mod config;
mod daemon;
mod errors;
mod git;
mod http;
mod ipc;
mod logging;
mod manifest;
mod notify;
mod process;
mod service;
mod storage;
mod store;
mod supervisor;
mod systemd;
mod unit;
mod updater;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    commands::run(cli.command, &config).await
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
