use std::path::Path;

use clap::{
    Parser,
    builder::{Styles, styling},
};

use crate::VERSION;
use crate::compress::compress_old_logs;
use crate::local_logger::init_local_logger;
use crate::monitor::Monitor;
use crate::prelude::*;
use crate::process::SystemProcessSource;

/// Receives the per-run log files and their gzip archives.
pub const LOG_DIR: &str = "/var/log/processes";

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Blue.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(
    name = "procwatch",
    about = "Logs newly observed system processes",
    styles = create_styles()
)]
pub struct Cli {
    /// Print version information
    #[arg(short = 'v', long)]
    version: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("procwatch - logs newly observed system processes");
        println!("{} - version {}", env!("CARGO_PKG_AUTHORS"), VERSION);
        return Ok(());
    }

    init_local_logger()?;

    let log_dir = Path::new(LOG_DIR);
    tokio::fs::create_dir_all(log_dir)
        .await
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    compress_old_logs(log_dir).await;

    let mut monitor = Monitor::start(Box::new(SystemProcessSource::new()), log_dir).await?;
    monitor.run().await
}
