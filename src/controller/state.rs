//! Connection state model shared between the controller and the view

use serde::Serialize;
use std::fmt;

/// Connection progress of the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session (initial state, after cleanup, after any failure)
    #[default]
    Disconnected,
    /// Gateway library is being initialized
    Initializing,
    /// Signaling session is being opened
    Connecting,
    /// Streaming plugin is being attached
    Attaching,
    /// Watch request sent, waiting for the offer and the first track
    Watching,
    /// Video is playing
    Connected,
    /// Remote side ended the media (track inactive or cleanup notification)
    Stopped,
    /// Gateway reported the session destroyed
    Destroyed,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Initializing => "Initializing...",
            ConnectionState::Connecting => "Connecting to server...",
            ConnectionState::Attaching => "Attaching to stream...",
            ConnectionState::Watching => "Waiting for stream...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Stopped => "Stream stopped",
            ConnectionState::Destroyed => "Session destroyed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a surfaced error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Gateway,
    Plugin,
    Transport,
    Playback,
    Stream,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Gateway => "gateway",
            ErrorSource::Plugin => "plugin",
            ErrorSource::Transport => "transport",
            ErrorSource::Playback => "playback",
            ErrorSource::Stream => "stream",
        }
    }
}

/// Last surfaced error; replaced wholesale by the next one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionError {
    pub source: ErrorSource,
    pub message: String,
}

impl ConnectionError {
    pub fn new(source: ErrorSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.source.as_str(), self.message)
    }
}

/// Snapshot published by the bitrate sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoStats {
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(rename = "type")]
    pub level: LogLevel,
}

/// Everything the presentation layer is allowed to see
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewState {
    pub state: ConnectionState,
    pub error: Option<ConnectionError>,
    pub stats: Option<VideoStats>,
    pub connected: bool,
    pub debug: bool,
    pub logs: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_disconnected() {
        let view = ViewState::default();
        assert_eq!(view.state, ConnectionState::Disconnected);
        assert!(!view.connected);
        assert!(view.stats.is_none());
    }

    #[test]
    fn test_log_entry_serializes_type_field() {
        let entry = LogEntry {
            message: "hello".to_string(),
            level: LogLevel::Warn,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""type":"warn""#));
    }

    #[test]
    fn test_error_display_names_source() {
        let err = ConnectionError::new(ErrorSource::Transport, "ICE failed");
        assert_eq!(err.to_string(), "transport error: ICE failed");
    }
}
