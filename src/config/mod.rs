//! Configuration management for stream-panel

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Video surface backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    /// Drain RTP without decoding, sniff VP8 frame size
    #[default]
    Headless,
    /// Decode and display through GStreamer (feature `gstreamer-surface`)
    Gstreamer,
}

impl SurfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceKind::Headless => "headless",
            SurfaceKind::Gstreamer => "gstreamer",
        }
    }
}

impl std::str::FromStr for SurfaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headless" => Ok(SurfaceKind::Headless),
            "gstreamer" | "gst" => Ok(SurfaceKind::Gstreamer),
            other => Err(format!("Unknown surface kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Panel defaults
    #[serde(default)]
    pub panel: PanelConfig,

    /// Gateway client configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Restart and sampling timings
    #[serde(default)]
    pub timing: TimingConfig,

    /// Video surface configuration
    #[serde(default)]
    pub surface: SurfaceConfig,

    /// Console host configuration
    #[serde(default)]
    pub host: HostConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Server URL used when the host has no persisted value
    #[serde(default = "default_server_url")]
    pub default_server_url: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            default_server_url: default_server_url(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Plugin attached for every session
    #[serde(default = "default_plugin")]
    pub plugin: String,

    /// Explicit ICE servers (used when no STUN/TURN host is set)
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// STUN host
    #[serde(default)]
    pub stun_host: String,

    /// STUN port
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN host
    #[serde(default)]
    pub turn_host: String,

    /// TURN port
    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// TURN transport protocol (udp/tcp)
    #[serde(default)]
    pub turn_protocol: String,

    /// Use turns: scheme
    #[serde(default)]
    pub turn_tls: bool,

    /// TURN REST API shared secret
    #[serde(default)]
    pub turn_shared_secret: String,

    /// Static TURN username
    #[serde(default)]
    pub turn_username: String,

    /// Static TURN password
    #[serde(default)]
    pub turn_password: String,

    /// Session keepalive interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            ice_servers: default_ice_servers(),
            stun_host: String::new(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: String::new(),
            turn_tls: false,
            turn_shared_secret: String::new(),
            turn_username: String::new(),
            turn_password: String::new(),
            keepalive_secs: default_keepalive_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay between stopStream and cleanup during a restart
    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,

    /// Delay between cleanup and initialize during a restart
    #[serde(default = "default_reinit_delay_ms")]
    pub reinit_delay_ms: u64,

    /// Delay between receiving a video track and starting playback
    #[serde(default = "default_playback_settle_ms")]
    pub playback_settle_ms: u64,

    /// Bitrate sampler period
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stop_settle_ms: default_stop_settle_ms(),
            reinit_delay_ms: default_reinit_delay_ms(),
            playback_settle_ms: default_playback_settle_ms(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SurfaceConfig {
    /// Surface backend
    #[serde(default)]
    pub kind: SurfaceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Persisted panel state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Render pass interval in milliseconds
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            render_interval_ms: default_render_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.panel.default_server_url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err("Panel default_server_url must be a ws:// or wss:// URL".into());
        }

        if self.gateway.plugin.trim().is_empty() {
            return Err("Gateway plugin name must not be empty".into());
        }

        if self.gateway.keepalive_secs == 0 {
            return Err("Gateway keepalive interval must be non-zero".into());
        }

        if self.gateway.request_timeout_ms == 0 {
            return Err("Gateway request timeout must be non-zero".into());
        }

        for server in &self.gateway.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries must list at least one URL".into());
            }
        }

        if !self.gateway.turn_protocol.is_empty() {
            let proto = self.gateway.turn_protocol.to_ascii_lowercase();
            if proto != "udp" && proto != "tcp" {
                return Err("Gateway turn_protocol must be \"udp\" or \"tcp\"".into());
            }
        }

        if self.timing.sample_interval_ms == 0 {
            return Err("Sample interval must be non-zero".into());
        }

        if self.host.render_interval_ms == 0 {
            return Err("Render interval must be non-zero".into());
        }

        Ok(())
    }
}

fn default_server_url() -> String {
    "ws://localhost:8188/".to_string()
}

fn default_plugin() -> String {
    "janus.plugin.streaming".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_stun_port() -> u16 { 3478 }
fn default_turn_port() -> u16 { 3478 }
fn default_keepalive_secs() -> u64 { 25 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_stop_settle_ms() -> u64 { 500 }
fn default_reinit_delay_ms() -> u64 { 1000 }
fn default_playback_settle_ms() -> u64 { 100 }
fn default_sample_interval_ms() -> u64 { 1000 }
fn default_render_interval_ms() -> u64 { 1000 }

fn default_state_file() -> PathBuf {
    PathBuf::from("stream-panel.state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}
