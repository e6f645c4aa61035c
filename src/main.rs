//! stream-panel - Main entry point
//!
//! Mounts the WebRTC stream panel in a terminal host.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use stream_panel::config::Config;
use stream_panel::host::{ConsoleHost, PanelRegistry};
use stream_panel::panel::{self, PANEL_NAME};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}, using defaults", args.config, e);
            Config::default()
        }
    };

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("STREAM_PANEL_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("stream-panel v{}", env!("CARGO_PKG_VERSION"));
    if !args.config.exists() {
        warn!("Config file {:?} not found, using defaults", args.config);
    }

    args.apply_overrides(&mut config);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    // Per-panel flags win over the persisted state
    let mut host = ConsoleHost::new(config.host.clone());
    for (field, value) in args.state_overrides() {
        host = host.with_state_override(field, value);
    }
    let mut registry = PanelRegistry::new();
    panel::register(&mut registry, config);

    let registration = registry
        .get(PANEL_NAME)
        .ok_or("stream panel is not registered")?;
    host.run(registration).await?;

    info!("Shutdown complete");
    Ok(())
}
