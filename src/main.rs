use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use visit_counter::config::{parse_shard_list, CliArgs, Config};

#[derive(Parser)]
#[command(name = "visit-counter")]
#[command(about = "Sharded visit counters with buffered writes and cached reads")]
struct Cli {
    /// Config file (TOML or JSON); default locations are searched otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Comma separated shard addresses, overriding the config
    #[arg(long, global = true, value_name = "ADDRS")]
    shards: Option<String>,

    #[arg(short, long, global = true, help = "Increase verbosity")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record visits of a page
    Visit {
        page: String,
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Show the visit count of a page
    Count {
        page: String,
        #[arg(long)]
        json: bool,
    },
    /// Show which shard holds each page's counter
    Locate {
        #[arg(required = true)]
        pages: Vec<String>,
    },
    /// Record one visit per page id read from stdin
    Ingest,
    /// Ping every shard
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cli_args = CliArgs {
        config_file: cli.config.clone(),
        shards: cli.shards.as_deref().map(parse_shard_list),
        log_level: cli.verbose.then(|| "debug".to_string()),
    };
    let config = Config::load_with_cli(&cli_args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let level = tracing::Level::from_str(&config.logging.level).unwrap_or(tracing::Level::INFO);
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!(config = ?config, "Configuration loaded");

    match cli.command {
        Command::Visit { page, count } => {
            let reading = visit_counter::record_visits(&config, &page, count).await?;
            println!("{}", reading.value);
        }
        Command::Count { page, json } => {
            let reading = visit_counter::show_count(&config, &page).await?;
            if json {
                println!("{}", serde_json::to_string(&reading)?);
            } else {
                println!("{} (from {})", reading.value, reading.source);
            }
        }
        Command::Locate { pages } => {
            for placement in visit_counter::locate(&config, &pages)? {
                println!("{}\t{}\t{}", placement.page, placement.key, placement.shard);
            }
        }
        Command::Ingest => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let summary = visit_counter::ingest(&config, stdin).await?;
            println!(
                "accepted={} rejected={} flushed={} unsent={}",
                summary.accepted,
                summary.rejected,
                summary.final_flush.increments_flushed,
                summary.final_flush.increments_requeued
            );
            if !summary.final_flush.is_complete() {
                anyhow::bail!("Some visits could not be written to their shard");
            }
        }
        Command::Health => {
            let mut all_healthy = true;
            for shard in visit_counter::health(&config).await? {
                all_healthy &= shard.healthy;
                match shard.error {
                    None => println!("{}\tok", shard.shard),
                    Some(error) => println!("{}\tdown\t{}", shard.shard, error),
                }
            }
            if !all_healthy {
                anyhow::bail!("One or more shards are unreachable");
            }
        }
    }

    Ok(())
}
