//! Signaling gateway client
//!
//! This module defines the contract the controller drives:
//! - `Gateway`: library init and session creation
//! - `GatewaySession`: plugin attach and session teardown
//! - `PluginHandle`: signaling requests, answer negotiation, media stats
//!
//! Asynchronous notifications are delivered as `GatewayEvent`s through an
//! injected callback. `janus` implements the contract over WebSocket.

pub mod janus;
pub mod peer;
pub mod protocol;

pub use janus::JanusGateway;
pub use protocol::{Jsep, JsepType};

use crate::config::IceServerConfig;
use crate::controller::state::LogLevel;
use crate::media::MediaTrack;
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Gateway-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Library initialization failed
    InitFailed(String),
    /// Could not reach the gateway or the connection dropped
    Transport(String),
    /// Unexpected or malformed reply
    Protocol(String),
    /// Gateway answered with an error
    Server { code: i64, reason: String },
    /// No reply within the request timeout
    Timeout(String),
    /// SDP negotiation failed
    Sdp(String),
    /// Operation not valid in the current state
    InvalidState(String),
    /// Connection already closed
    Closed,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InitFailed(msg) => write!(f, "Gateway init failed: {}", msg),
            GatewayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            GatewayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            GatewayError::Server { code, reason } => write!(f, "Gateway error {}: {}", code, reason),
            GatewayError::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            GatewayError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            GatewayError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            GatewayError::Closed => write!(f, "Gateway connection closed"),
        }
    }
}

impl Error for GatewayError {}

/// Notifications raised by a session or one of its plugin handles
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Session is gone (destroyed or timed out on the server)
    SessionDestroyed,
    /// Session-level failure after creation (e.g. connection lost)
    SessionError(String),
    /// Plugin message, optionally carrying a session description
    Message { body: Value, jsep: Option<Jsep> },
    /// A remote track became active or inactive
    RemoteTrack {
        track: MediaTrack,
        mid: Option<String>,
        active: bool,
    },
    /// Media session of a plugin handle ended
    Cleanup,
}

/// Callback receiving gateway notifications
pub type EventCallback = Arc<dyn Fn(GatewayEvent) + Send + Sync>;

/// Logger injected into the gateway client
pub type GatewayLogger = Arc<dyn Fn(LogLevel, String) + Send + Sync>;

/// Library initialization options
#[derive(Clone, Default)]
pub struct InitOptions {
    /// Verbose gateway diagnostics
    pub debug: bool,
    /// Receives gateway diagnostics when set
    pub logger: Option<GatewayLogger>,
}

impl fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitOptions")
            .field("debug", &self.debug)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// Session teardown options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Send the destroy request without waiting for the reply
    pub unload: bool,
    /// Raise `SessionDestroyed` once destroyed
    pub notify_destroyed: bool,
    /// Hang up and detach every plugin handle first
    pub cleanup_handle: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            unload: false,
            notify_destroyed: true,
            cleanup_handle: true,
        }
    }
}

/// Desired media directions for an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDirections {
    pub audio_send: bool,
    pub video_send: bool,
    pub audio_recv: bool,
    pub video_recv: bool,
}

impl MediaDirections {
    pub fn receive_only() -> Self {
        Self {
            audio_send: false,
            video_send: false,
            audio_recv: true,
            video_recv: true,
        }
    }

    pub fn sends_media(&self) -> bool {
        self.audio_send || self.video_send
    }
}

/// Gateway client library
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Initialize the library; repeated calls only refresh the options
    async fn init(&self, options: InitOptions) -> Result<(), GatewayError>;

    /// Open a signaling session
    async fn create_session(
        &self,
        server_url: &str,
        ice_servers: &[IceServerConfig],
        events: EventCallback,
    ) -> Result<Box<dyn GatewaySession>, GatewayError>;
}

/// An open signaling session
#[async_trait]
pub trait GatewaySession: Send + Sync {
    fn id(&self) -> u64;

    /// Attach a plugin handle
    async fn attach(
        &self,
        plugin: &str,
        opaque_id: &str,
        events: EventCallback,
    ) -> Result<Box<dyn PluginHandle>, GatewayError>;

    /// Tear the session down
    async fn destroy(&self, options: DestroyOptions) -> Result<(), GatewayError>;
}

/// A plugin handle attached to a session
#[async_trait]
pub trait PluginHandle: Send + Sync {
    fn id(&self) -> u64;

    /// Send a plugin request, optionally with a session description
    async fn send(&self, body: Value, jsep: Option<Jsep>) -> Result<(), GatewayError>;

    /// Answer a remote offer
    async fn create_answer(&self, offer: Jsep, media: MediaDirections) -> Result<Jsep, GatewayError>;

    /// End the media session
    async fn hangup(&self) -> Result<(), GatewayError>;

    /// Receive bitrate of a media line in bits per second
    async fn bitrate(&self, media_id: Option<&str>) -> Result<u64, GatewayError>;

    fn is_connected(&self) -> bool;

    /// Detach from the plugin
    async fn detach(&self) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_only_sends_nothing() {
        let media = MediaDirections::receive_only();
        assert!(!media.sends_media());
        assert!(media.video_recv);
    }

    #[test]
    fn test_destroy_defaults_notify() {
        let opts = DestroyOptions::default();
        assert!(opts.notify_destroyed);
        assert!(!opts.unload);
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::Server {
            code: 458,
            reason: "No such session".to_string(),
        };
        assert_eq!(err.to_string(), "Gateway error 458: No such session");
    }
}
