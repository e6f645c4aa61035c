//! stream-panel - WebRTC gateway stream viewer
//!
//! A panel that watches one stream of a Janus streaming gateway: signaling
//! session lifecycle, receive-only WebRTC negotiation, playback on a video
//! surface, bitrate sampling and a host-facing settings tree.

pub mod config;
pub mod controller;
pub mod gateway;
pub mod host;
pub mod media;
pub mod panel;
pub mod settings;
pub mod view;

// Re-exports
pub use config::{Config, SurfaceKind};
pub use controller::{ControllerHandle, StreamController};
pub use controller::state::{ConnectionState, ViewState};
pub use gateway::{Gateway, JanusGateway};
pub use host::{ConsoleHost, PanelRegistry};
pub use panel::{StreamPanel, PANEL_NAME};
pub use settings::StreamSettings;
