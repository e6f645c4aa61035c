//! Presentation of the panel
//!
//! `render` translates controller and settings state into a `PanelView`.

use crate::controller::state::{LogEntry, LogLevel, ViewState};
use crate::settings::StreamSettings;
use serde::Serialize;
use std::fmt;

/// Video surface placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoNode {
    pub label: String,
    pub visible: bool,
}

/// Resolution and bitrate of the playing stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsOverlay {
    pub resolution: String,
    pub bitrate: String,
}

/// Connection status shown while not connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusOverlay {
    pub message: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartControl {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPanel {
    pub entries: Vec<LogEntry>,
}

/// Rendered panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelView {
    pub video: VideoNode,
    pub stats: Option<StatsOverlay>,
    pub status: Option<StatusOverlay>,
    pub restart: RestartControl,
    pub log: Option<LogPanel>,
}

pub fn format_bitrate(bitrate: u64) -> String {
    if bitrate >= 1_000_000 {
        format!("{:.2} Mbps", bitrate as f64 / 1_000_000.0)
    } else if bitrate >= 1_000 {
        format!("{:.2} Kbps", bitrate as f64 / 1_000.0)
    } else {
        format!("{} bps", bitrate)
    }
}

pub fn render(state: &ViewState, settings: &StreamSettings) -> PanelView {
    let stats = state.stats.map(|stats| StatsOverlay {
        resolution: format!("{}x{}", stats.width, stats.height),
        bitrate: format_bitrate(stats.bitrate),
    });

    let status = if state.connected {
        None
    } else {
        Some(match &state.error {
            Some(error) => StatusOverlay {
                message: error.message.clone(),
                is_error: true,
            },
            None => StatusOverlay {
                message: state.state.label().to_string(),
                is_error: false,
            },
        })
    };

    let log = settings.debug.then(|| LogPanel {
        entries: state.logs.clone(),
    });

    PanelView {
        video: VideoNode {
            label: settings.label.clone(),
            visible: settings.visible,
        },
        stats,
        status,
        restart: RestartControl {
            label: "Restart".to_string(),
        },
        log,
    }
}

impl fmt::Display for PanelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.video.label)?;
        if !self.video.visible {
            write!(f, " (hidden)")?;
        }
        if let Some(ref stats) = self.stats {
            write!(f, " {} @ {}", stats.resolution, stats.bitrate)?;
        }
        if let Some(ref status) = self.status {
            if status.is_error {
                write!(f, " error: {}", status.message)?;
            } else {
                write!(f, " {}", status.message)?;
            }
        }
        write!(f, " <{}>", self.restart.label)?;
        if let Some(ref log) = self.log {
            for entry in &log.entries {
                let tag = match entry.level {
                    LogLevel::Info => "INFO",
                    LogLevel::Warn => "WARN",
                    LogLevel::Error => "ERROR",
                };
                write!(f, "\n  {:5} {}", tag, entry.message)?;
            }
        }
        Ok(())
    }
}
