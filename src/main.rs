mod api;
mod app;
mod cache;
mod commands;
mod config;
mod event;
mod filter;
mod realtime;
mod session;
mod store;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tkt")]
#[command(about = "A terminal client for the support desk, with cached and live-updating views")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tkt/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: app::Cli,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Logs go to a file so they never interleave with command output
  let log_dir = cache::SqliteStorage::data_dir()?.join("logs");
  let (writer, _guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "tkt.log"));
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_env("TKT_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  let config = config::Config::load(args.config.as_deref())?;

  let app = app::App::new(config).await?;
  app.run(args.command).await?;

  Ok(())
}
