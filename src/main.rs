mod commands;

use clap::Parser;
use color_eyre::Result;
use lifelines::{config, logging};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lifelines")]
#[command(about = "Offline-aware sync for the Lifelines API: cached reads, queued writes, edge cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lifelines/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Bypass the edge cache proxy
  #[arg(long, global = true)]
  direct: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;

  // Keep the guard alive so file logs are flushed on exit
  let _log_guard = logging::init(&config.logging)?;

  let ctx = commands::Context::build(config, args.direct).await?;
  args.command.execute(ctx).await
}
