use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use tokio::{io::AsyncBufReadExt as _, sync::mpsc};

use netclip::{
    engine::TabEvent,
    tap::{Tap, TapBody, TapError},
};

#[derive(Debug, Parser)]
#[command(name = "netclip")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture engine, reading tap feed lines from stdin.
    Serve {
        /// Path to config TOML.
        #[arg(long)]
        config: PathBuf,
        /// Overrides the configured log level.
        #[arg(long)]
        log_level: Option<String>,
    },
}

/// Tap adapter for the NDJSON stdin feed. The feed is one-way, so body
/// retrieval always reports unavailable and entries keep their sizes with
/// the text omitted.
struct StdioTap;

#[async_trait::async_trait]
impl Tap for StdioTap {
    async fn attach(&self, tab_id: i64) -> Result<(), TapError> {
        tracing::debug!(tab_id, "attach requested");
        Ok(())
    }

    async fn detach(&self, tab_id: i64) -> Result<(), TapError> {
        tracing::debug!(tab_id, "detach requested");
        Ok(())
    }

    async fn fetch_response_body(
        &self,
        _tab_id: i64,
        _request_id: &str,
    ) -> Result<TapBody, TapError> {
        Err(TapError::BodyUnavailable(
            "stdin feed cannot answer body retrieval".to_owned(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = netclip::config::Config::from_path(config)?;
            netclip::logging::init(&config, log_level.as_deref())?;

            let handle = netclip::engine::spawn(&config, Arc::new(StdioTap)).await?;
            let feed = tokio::spawn(feed_stdin(handle.event_sender()));
            eprintln!("netclip capturing; feed tap events on stdin");

            tokio::signal::ctrl_c().await?;
            feed.abort();
            handle.shutdown().await;
        }
    }

    Ok(())
}

async fn feed_stdin(events: mpsc::Sender<TabEvent>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TabEvent>(line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "malformed tap feed line"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "read tap feed");
                break;
            }
        }
    }
}
