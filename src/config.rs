use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "bluesky-graph-indexer", about = "Projects the AT Protocol firehose into a graph database")]
pub struct Cli {
    /// Log startup details and periodic events-per-second reports
    #[clap(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub relay_url: String,
    pub appview_url: String,
    pub state_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            relay_url: env::var("RELAY_URL")
                .unwrap_or_else(|_| "wss://bsky.network".to_string()),
            appview_url: env::var("APPVIEW_URL")
                .unwrap_or_else(|_| "https://public.api.bsky.app".to_string()),
            state_dir: env::var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        })
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.state_dir.join("cursor.json")
    }

    pub fn failed_messages_path(&self) -> PathBuf {
        self.state_dir.join("failed-messages.json")
    }
}
