use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;

use stream_panel::config;
use stream_panel::settings::{FIELD_DEBUG, FIELD_SERVER_URL, FIELD_STREAM_ID};

#[derive(Parser, Debug)]
#[command(name = "stream-panel")]
#[command(author = "Selkies Team")]
#[command(version = "0.1.0")]
#[command(about = "Watch a Janus streaming gateway stream from the terminal", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stream-panel.toml")]
    pub config: PathBuf,

    /// Persisted panel state file
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Gateway WebSocket URL, overrides the persisted value
    #[arg(long)]
    pub server_url: Option<String>,

    /// Stream to watch, overrides the persisted value
    #[arg(long)]
    pub stream_id: Option<u64>,

    /// Show the connection log in the panel
    #[arg(long, action)]
    pub debug: bool,

    /// Video surface backend (headless or gstreamer)
    #[arg(long)]
    pub surface: Option<config::SurfaceKind>,

    /// Render pass interval in milliseconds
    #[arg(long)]
    pub render_interval_ms: Option<u64>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref path) = self.state_file {
            config.host.state_file = path.clone();
        }
        if let Some(ref url) = self.server_url {
            config.panel.default_server_url = url.clone();
        }
        if let Some(kind) = self.surface {
            config.surface.kind = kind;
        }
        if let Some(ms) = self.render_interval_ms {
            config.host.render_interval_ms = ms;
        }
    }

    /// Panel settings forced over the persisted state
    pub fn state_overrides(&self) -> Vec<(&'static str, Value)> {
        let mut overrides = Vec::new();
        if let Some(ref url) = self.server_url {
            overrides.push((FIELD_SERVER_URL, json!(url)));
        }
        if let Some(stream_id) = self.stream_id {
            overrides.push((FIELD_STREAM_ID, json!(stream_id)));
        }
        if self.debug {
            overrides.push((FIELD_DEBUG, json!(true)));
        }
        overrides
    }
}
