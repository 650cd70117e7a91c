mod demo;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use querycache::{Config, QueryClient};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "querycache")]
#[command(about = "Runs caching scenarios against an in-memory families backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./querycache.yaml, then $XDG_CONFIG_HOME/querycache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Simulated backend latency in milliseconds
  #[arg(long, default_value_t = 200)]
  latency_ms: u64,

  #[command(subcommand)]
  scenario: Scenario,
}

#[derive(Subcommand, Debug)]
enum Scenario {
  /// Read a family detail before and after its stale time
  Staleness {
    #[arg(long, default_value_t = 2000)]
    stale_ms: u64,
  },
  /// Kick a member and watch the family views refetch
  Kick {
    #[arg(long, default_value = "F1")]
    family: String,
    #[arg(long, default_value = "P9")]
    player: String,
  },
  /// Fail the first fetches with 503s and watch the backoff
  Retry {
    #[arg(long, default_value_t = 2)]
    failures: usize,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = querycache::logging::init_logging(&config.logging)?;

  let api = demo::FamiliesApi::new(Duration::from_millis(args.latency_ms));
  let client: QueryClient<Value> = QueryClient::new(config.cache);

  match args.scenario {
    Scenario::Staleness { stale_ms } => {
      demo::staleness(&client, &api, Duration::from_millis(stale_ms)).await?
    }
    Scenario::Kick { family, player } => demo::kick(&client, &api, &family, &player).await?,
    Scenario::Retry { failures } => demo::retry(&client, &api, failures).await?,
  }

  Ok(())
}
