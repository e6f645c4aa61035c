//! Host panel API
//!
//! A host mounts panels registered in a `PanelRegistry`, hands each a
//! `PanelContext`, asks for render passes and forwards settings-editor edits.

pub mod console;

pub use console::ConsoleHost;

use crate::view::PanelView;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Input widget of a settings field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldInput {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsField {
    pub key: String,
    pub label: String,
    pub input: FieldInput,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl SettingsField {
    pub fn new(key: &str, label: &str, input: FieldInput, value: Value) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            input,
            value,
            help: None,
        }
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsNode {
    pub label: String,
    /// The host may offer a rename action on the node
    pub renamable: bool,
    /// Visibility toggle, absent when the node has none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    pub fields: Vec<SettingsField>,
}

impl SettingsNode {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            renamable: false,
            visible: None,
            fields: Vec::new(),
        }
    }

    pub fn renamable(mut self, renamable: bool) -> Self {
        self.renamable = renamable;
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = Some(visible);
        self
    }

    pub fn field(mut self, field: SettingsField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, key: &str) -> Option<&SettingsField> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// Settings tree handed to the host's editor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingsTree {
    pub nodes: BTreeMap<String, SettingsNode>,
}

impl SettingsTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, key: &str, node: SettingsNode) -> Self {
        self.nodes.insert(key.to_string(), node);
        self
    }

    /// Field at `[node, field]`
    pub fn field(&self, node: &str, key: &str) -> Option<&SettingsField> {
        self.nodes.get(node)?.get(key)
    }
}

/// Edit made in the settings editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsAction {
    /// Node key followed by field key
    pub path: Vec<String>,
    pub value: Value,
}

impl SettingsAction {
    pub fn update(path: Vec<String>, value: Value) -> Self {
        Self { path, value }
    }
}

/// Host capabilities available to a mounted panel
pub trait PanelContext: Send + Sync {
    /// Persisted state from a previous run, possibly partial
    fn initial_state(&self) -> Option<Value>;

    fn save_state(&self, state: Value);

    fn update_settings_editor(&self, tree: SettingsTree);

    fn paint(&self, view: &PanelView);
}

/// Acknowledgement a panel sends once a render pass has been painted
pub struct RenderDone {
    tx: Option<oneshot::Sender<()>>,
}

impl RenderDone {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn complete(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for RenderDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderDone")
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

/// A mounted panel
#[async_trait]
pub trait PanelInstance: Send {
    /// Paint the current state, then call `done.complete()`
    fn on_render(&mut self, done: RenderDone);

    /// Apply a batch of settings-editor edits
    fn on_settings_actions(&mut self, actions: Vec<SettingsAction>);

    /// Manual restart
    fn restart(&self);

    /// Tear everything down
    async fn unmount(self: Box<Self>);
}

/// Creates a panel instance for a context
pub type PanelInit = Arc<dyn Fn(Arc<dyn PanelContext>) -> Box<dyn PanelInstance> + Send + Sync>;

#[derive(Clone)]
pub struct PanelRegistration {
    pub name: String,
    init: PanelInit,
}

impl PanelRegistration {
    pub fn mount(&self, context: Arc<dyn PanelContext>) -> Box<dyn PanelInstance> {
        (self.init)(context)
    }
}

impl fmt::Debug for PanelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelRegistration")
            .field("name", &self.name)
            .finish()
    }
}

/// Panels known to a host
#[derive(Debug, Default)]
pub struct PanelRegistry {
    panels: Vec<PanelRegistration>,
}

impl PanelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a panel; a later registration under the same name wins
    pub fn register(&mut self, name: &str, init: PanelInit) {
        self.panels.retain(|p| p.name != name);
        self.panels.push(PanelRegistration {
            name: name.to_string(),
            init,
        });
    }

    pub fn get(&self, name: &str) -> Option<&PanelRegistration> {
        self.panels.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.panels.iter().map(|p| p.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullPanel;

    #[async_trait]
    impl PanelInstance for NullPanel {
        fn on_render(&mut self, done: RenderDone) {
            done.complete();
        }
        fn on_settings_actions(&mut self, _actions: Vec<SettingsAction>) {}
        fn restart(&self) {}
        async fn unmount(self: Box<Self>) {}
    }

    #[tokio::test]
    async fn test_render_done_acknowledges() {
        let (done, rx) = RenderDone::new();
        let mut panel = NullPanel;
        panel.on_render(done);
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = PanelRegistry::new();
        let init: PanelInit =
            Arc::new(|_: Arc<dyn PanelContext>| Box::new(NullPanel) as Box<dyn PanelInstance>);
        registry.register("A", init.clone());
        registry.register("B", init.clone());
        registry.register("A", init);
        assert_eq!(registry.names(), vec!["B", "A"]);
        assert!(registry.get("A").is_some());
        assert!(registry.get("C").is_none());
    }

    #[test]
    fn test_settings_action_deserializes() {
        let action: SettingsAction =
            serde_json::from_str(r#"{"path":["general","streamId"],"value":4}"#).unwrap();
        assert_eq!(action.path, vec!["general", "streamId"]);
        assert_eq!(action.value, 4);
    }
}
