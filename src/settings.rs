//! User settings of the panel and the edit handler behind the settings tree

use crate::host::{FieldInput, SettingsAction, SettingsField, SettingsNode, SettingsTree};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;

/// Settings tree node holding every field
pub const GENERAL_NODE: &str = "general";

pub const FIELD_SERVER_URL: &str = "serverUrl";
pub const FIELD_STREAM_ID: &str = "streamId";
pub const FIELD_DEBUG: &str = "debug";
pub const FIELD_LABEL: &str = "label";
pub const FIELD_VISIBLE: &str = "visible";

fn default_label() -> String {
    "Stream".to_string()
}

fn default_visible() -> bool {
    true
}

fn default_stream_id() -> u64 {
    1
}

/// Persisted panel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub label: String,
    pub visible: bool,
    pub server_url: String,
    pub stream_id: u64,
    pub debug: bool,
}

impl StreamSettings {
    /// Defaults with the given gateway endpoint
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self {
            label: default_label(),
            visible: default_visible(),
            server_url: server_url.into(),
            stream_id: default_stream_id(),
            debug: false,
        }
    }

    /// Merge a partial persisted blob over the defaults. Unknown keys are
    /// ignored, keys with an unusable value keep their default.
    pub fn from_partial(state: Option<&Value>, default_server_url: &str) -> Self {
        let mut settings = Self::with_server_url(default_server_url);
        let Some(state) = state else {
            return settings;
        };
        let Some(object) = state.as_object() else {
            warn!("Ignoring persisted panel state: not an object");
            return settings;
        };

        for (key, value) in object {
            let result = match key.as_str() {
                FIELD_SERVER_URL | FIELD_STREAM_ID | FIELD_DEBUG | FIELD_LABEL | FIELD_VISIBLE => {
                    settings.set_field(key, value).map(|_| ())
                }
                _ => {
                    debug!("Ignoring unknown persisted key {}", key);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("Persisted {}: {}; using default", key, e);
            }
        }
        settings
    }

    /// Full blob handed to the host for persistence
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(FIELD_LABEL.to_string(), Value::from(self.label.clone()));
        map.insert(FIELD_VISIBLE.to_string(), Value::from(self.visible));
        map.insert(FIELD_SERVER_URL.to_string(), Value::from(self.server_url.clone()));
        map.insert(FIELD_STREAM_ID.to_string(), Value::from(self.stream_id));
        map.insert(FIELD_DEBUG.to_string(), Value::from(self.debug));
        Value::Object(map)
    }

    /// Set one field; returns whether the value changed
    fn set_field(&mut self, field: &str, value: &Value) -> Result<bool, SettingsError> {
        match field {
            FIELD_SERVER_URL => {
                let url = expect_string(field, value)?;
                Ok(replace(&mut self.server_url, url))
            }
            FIELD_STREAM_ID => {
                let id = parse_stream_id(value)?;
                Ok(replace(&mut self.stream_id, id))
            }
            FIELD_DEBUG => {
                let debug = expect_bool(field, value)?;
                Ok(replace(&mut self.debug, debug))
            }
            FIELD_LABEL => {
                let label = expect_string(field, value)?;
                Ok(replace(&mut self.label, label))
            }
            FIELD_VISIBLE => {
                let visible = expect_bool(field, value)?;
                Ok(replace(&mut self.visible, visible))
            }
            other => Err(SettingsError::UnknownField(other.to_string())),
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn expect_string(field: &str, value: &Value) -> Result<String, SettingsError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SettingsError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a string, got {}", value),
        })
}

fn expect_bool(field: &str, value: &Value) -> Result<bool, SettingsError> {
    value.as_bool().ok_or_else(|| SettingsError::InvalidValue {
        field: field.to_string(),
        reason: format!("expected a boolean, got {}", value),
    })
}

/// Stream ids arrive as numbers from the editor and as strings from text
/// inputs
fn parse_stream_id(value: &Value) -> Result<u64, SettingsError> {
    let invalid = || SettingsError::InvalidValue {
        field: FIELD_STREAM_ID.to_string(),
        reason: format!("expected a non-negative integer, got {}", value),
    };
    match value {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(id), _) => Ok(id),
            (None, Some(f)) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
            _ => Err(invalid()),
        },
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Settings edit errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Path does not address a field of the settings tree
    InvalidPath(Vec<String>),
    /// Field name not known
    UnknownField(String),
    /// Value has the wrong shape for the field
    InvalidValue { field: String, reason: String },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::InvalidPath(path) => write!(f, "Invalid settings path: {}", path.join(".")),
            SettingsError::UnknownField(field) => write!(f, "Unknown settings field: {}", field),
            SettingsError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for {}: {}", field, reason)
            }
        }
    }
}

impl Error for SettingsError {}

/// Result of applying one batch of edits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditOutcome {
    /// Some field changed; the settings must be persisted
    pub changed: bool,
    /// The connection target changed; one reconnect is due
    pub reconnect: bool,
}

/// Owns the panel settings and applies settings-tree edits
#[derive(Debug, Clone)]
pub struct SettingsStore {
    settings: StreamSettings,
}

impl SettingsStore {
    pub fn new(initial_state: Option<&Value>, default_server_url: &str) -> Self {
        Self {
            settings: StreamSettings::from_partial(initial_state, default_server_url),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Apply one edit; returns whether the value changed
    pub fn apply(&mut self, action: &SettingsAction) -> Result<bool, SettingsError> {
        let field = match action.path.as_slice() {
            [node, field] if node == GENERAL_NODE => field.as_str(),
            _ => return Err(SettingsError::InvalidPath(action.path.clone())),
        };
        self.settings.set_field(field, &action.value)
    }

    /// Apply an edit batch. Invalid edits are logged and skipped; the batch
    /// requests at most one reconnect.
    pub fn apply_batch(&mut self, actions: &[SettingsAction]) -> EditOutcome {
        let mut outcome = EditOutcome::default();
        for action in actions {
            match self.apply(action) {
                Ok(true) => {
                    outcome.changed = true;
                    if matches!(
                        action.path.last().map(String::as_str),
                        Some(FIELD_SERVER_URL) | Some(FIELD_STREAM_ID)
                    ) {
                        outcome.reconnect = true;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Rejected settings edit: {}", e),
            }
        }
        outcome
    }

    /// Tree shown in the host's settings editor
    pub fn settings_tree(&self) -> SettingsTree {
        let s = &self.settings;
        let node = SettingsNode::new(&s.label)
            .renamable(true)
            .visible(s.visible)
            .field(SettingsField::new(
                FIELD_SERVER_URL,
                "Server URL",
                FieldInput::String,
                Value::from(s.server_url.clone()),
            ))
            .field(SettingsField::new(
                FIELD_STREAM_ID,
                "Stream ID",
                FieldInput::Number,
                Value::from(s.stream_id),
            ))
            .field(
                SettingsField::new(FIELD_DEBUG, "Debug", FieldInput::Boolean, Value::from(s.debug))
                    .help("Show the connection log"),
            );
        SettingsTree::new().node(GENERAL_NODE, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const URL: &str = "ws://localhost:8188/";

    fn edit(field: &str, value: Value) -> SettingsAction {
        SettingsAction::update(vec![GENERAL_NODE.to_string(), field.to_string()], value)
    }

    #[test]
    fn test_defaults() {
        let store = SettingsStore::new(None, URL);
        let s = store.settings();
        assert_eq!(s.label, "Stream");
        assert!(s.visible);
        assert_eq!(s.server_url, URL);
        assert_eq!(s.stream_id, 1);
        assert!(!s.debug);
    }

    #[test]
    fn test_partial_state_merges_over_defaults() {
        let state = json!({"streamId": "7", "debug": "yes", "extra": 1, "label": "Cam"});
        let s = StreamSettings::from_partial(Some(&state), URL);
        assert_eq!(s.stream_id, 7);
        // wrong type keeps the default
        assert!(!s.debug);
        assert_eq!(s.label, "Cam");
        assert_eq!(s.server_url, URL);
    }

    #[test]
    fn test_blob_is_camel_case() {
        let s = StreamSettings::with_server_url(URL);
        let value = s.to_value();
        assert_eq!(value["serverUrl"], URL);
        assert_eq!(value["streamId"], 1);
        let parsed: StreamSettings = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn test_one_reconnect_per_batch() {
        let mut store = SettingsStore::new(None, URL);
        let outcome = store.apply_batch(&[
            edit(FIELD_SERVER_URL, json!("ws://gw:8188/")),
            edit(FIELD_STREAM_ID, json!(3)),
        ]);
        assert_eq!(
            outcome,
            EditOutcome {
                changed: true,
                reconnect: true
            }
        );
        assert_eq!(store.settings().stream_id, 3);
    }

    #[test]
    fn test_debug_edit_does_not_reconnect() {
        let mut store = SettingsStore::new(None, URL);
        let outcome = store.apply_batch(&[edit(FIELD_DEBUG, json!(true))]);
        assert!(outcome.changed);
        assert!(!outcome.reconnect);
    }

    #[test]
    fn test_unchanged_value_is_not_a_change() {
        let mut store = SettingsStore::new(None, URL);
        let outcome = store.apply_batch(&[edit(FIELD_STREAM_ID, json!("1"))]);
        assert_eq!(outcome, EditOutcome::default());
    }

    #[test]
    fn test_invalid_edits_are_rejected() {
        let mut store = SettingsStore::new(None, URL);
        assert!(matches!(
            store.apply(&edit(FIELD_STREAM_ID, json!(-4))),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.apply(&SettingsAction::update(vec!["streamId".to_string()], json!(2))),
            Err(SettingsError::InvalidPath(_))
        ));
        assert!(matches!(
            store.apply(&edit("bogus", json!(2))),
            Err(SettingsError::UnknownField(_))
        ));
        let outcome = store.apply_batch(&[edit(FIELD_STREAM_ID, json!("abc"))]);
        assert!(!outcome.changed);
    }

    #[test]
    fn test_rename_and_visibility() {
        let mut store = SettingsStore::new(None, URL);
        store.apply_batch(&[edit(FIELD_LABEL, json!("Front door")), edit(FIELD_VISIBLE, json!(false))]);
        let tree = store.settings_tree();
        let node = tree.nodes.get(GENERAL_NODE).unwrap();
        assert_eq!(node.label, "Front door");
        assert_eq!(node.visible, Some(false));
        let keys: Vec<_> = node.fields.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec![FIELD_SERVER_URL, FIELD_STREAM_ID, FIELD_DEBUG]);
    }
}
