//! # sync-cli
//!
//! Command-line front end for nostr-sync.
//!
//! ## Commands
//!
//! - `timeline`: Page a timeline backward across relays and print it
//! - `publish`: Publish a pre-signed event and report each relay's answer
//!
//! ## Example
//!
//! ```bash
//! # Newest text notes from two relays, three blocks deep
//! sync-cli timeline --relay wss://relay.damus.io --relay wss://nos.lol --kind 1 --pages 3
//!
//! # Publish an event and wait up to 3 seconds for acknowledgements
//! sync-cli publish --relay wss://nos.lol --event note.json --timeout-ms 3000
//!
//! # Try it without a network
//! sync-cli --mock timeline --relay wss://demo.test
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{publish, timeline};

/// Command-line front end for nostr-sync.
#[derive(Parser, Debug)]
#[command(name = "sync-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (block size, timeouts, default relays)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use in-memory demo relays instead of real websockets
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Page a timeline backward and print it
    Timeline {
        /// Relay to read from (repeatable)
        #[arg(long = "relay", short)]
        relays: Vec<String>,

        /// Event kind to include (repeatable)
        #[arg(long = "kind", short)]
        kinds: Vec<u32>,

        /// Author pubkey to include (repeatable)
        #[arg(long = "author", short)]
        authors: Vec<String>,

        /// Blocks to load from each relay
        #[arg(long, default_value = "1")]
        pages: u32,

        /// Seconds to wait for each page
        #[arg(long, default_value = "10")]
        wait_secs: u64,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Publish a pre-signed event
    Publish {
        /// Relay to publish to (repeatable)
        #[arg(long = "relay", short)]
        relays: Vec<String>,

        /// JSON file holding the event
        #[arg(long, short)]
        event: PathBuf,

        /// Acknowledgement deadline (defaults to the config value)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Timeline {
            relays,
            kinds,
            authors,
            pages,
            wait_secs,
            json,
        } => {
            let options = timeline::TimelineOptions {
                relays,
                kinds,
                authors,
                pages,
                page_timeout: Duration::from_secs(wait_secs),
                json,
            };
            timeline::run(&config, &options, cli.mock).await?;
        }
        Commands::Publish {
            relays,
            event,
            timeout_ms,
        } => {
            publish::run(
                &config,
                &relays,
                &event,
                timeout_ms.map(Duration::from_millis),
                cli.mock,
            )
            .await?;
        }
    }

    Ok(())
}
