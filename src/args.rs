use clap::Parser;
use std::path::PathBuf;

use roomcall::config::{self, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "roomcall")]
#[command(author = "Roomcall Team")]
#[command(version = "0.2.0")]
#[command(about = "Room-scoped peer-to-peer calling over WebRTC", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "roomcall.toml")]
    pub config: PathBuf,

    /// Room to join at start-up
    #[arg(short, long)]
    pub room: Option<String>,

    /// Display name (stored for the next start)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Signaling relay URL
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Run the signaling relay instead of a participant
    #[arg(long, action)]
    pub serve: bool,

    /// Relay listen port (with --serve)
    #[arg(long)]
    pub relay_port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, ConfigError> {
        config::Config::load(&self.config)
    }

    /// Command line values take precedence over the file
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(url) = &self.relay_url {
            config.signaling.relay_url = url.clone();
        }
        if let Some(port) = self.relay_port {
            config.relay.port = port;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
