//! The WebRTC stream panel
//!
//! Glues the host API to the settings store and the stream controller:
//! settings edits are persisted and forwarded, render passes paint the
//! current view, unmount shuts the controller down.

use crate::config::{Config, SurfaceKind};
use crate::controller::{ControllerConfig, ControllerHandle, StreamController};
use crate::gateway::{Gateway, JanusGateway};
use crate::host::{PanelContext, PanelInstance, PanelRegistry, RenderDone, SettingsAction};
use crate::media::{HeadlessSurface, VideoSurface};
use crate::settings::SettingsStore;
use crate::view;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Name the panel is registered under
pub const PANEL_NAME: &str = "WebRTC Stream";

/// Create the configured video surface
pub fn build_surface(kind: SurfaceKind) -> Box<dyn VideoSurface> {
    match kind {
        SurfaceKind::Headless => Box::new(HeadlessSurface::new()),
        #[cfg(feature = "gstreamer-surface")]
        SurfaceKind::Gstreamer => Box::new(crate::media::gst::GstSurface::new()),
        #[cfg(not(feature = "gstreamer-surface"))]
        SurfaceKind::Gstreamer => {
            warn!("Built without gstreamer-surface, falling back to the headless surface");
            Box::new(HeadlessSurface::new())
        }
    }
}

pub struct StreamPanel {
    context: Arc<dyn PanelContext>,
    store: SettingsStore,
    controller: ControllerHandle,
    task: Option<JoinHandle<()>>,
}

impl StreamPanel {
    /// Mount with the Janus gateway client and the configured surface
    pub fn mount(context: Arc<dyn PanelContext>, config: &Config) -> Self {
        let gateway: Arc<dyn Gateway> = Arc::new(JanusGateway::new(&config.gateway));
        Self::with_parts(
            context,
            gateway,
            build_surface(config.surface.kind),
            ControllerConfig::from_config(config),
            &config.panel.default_server_url,
        )
    }

    /// Mount with explicit collaborators; must run inside a tokio runtime
    pub fn with_parts(
        context: Arc<dyn PanelContext>,
        gateway: Arc<dyn Gateway>,
        surface: Box<dyn VideoSurface>,
        controller_config: ControllerConfig,
        default_server_url: &str,
    ) -> Self {
        let initial = context.initial_state();
        let store = SettingsStore::new(initial.as_ref(), default_server_url);
        context.update_settings_editor(store.settings_tree());

        let settings = store.settings().clone();
        info!(
            "Stream panel \"{}\" watching stream {} on {}",
            settings.label, settings.stream_id, settings.server_url
        );
        let (controller, handle) =
            StreamController::new(gateway, surface, controller_config, settings);
        let task = controller.spawn();
        handle.initialize();

        Self {
            context,
            store,
            controller: handle,
            task: Some(task),
        }
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }
}

#[async_trait]
impl PanelInstance for StreamPanel {
    fn on_render(&mut self, done: RenderDone) {
        let view = view::render(&self.controller.view(), self.store.settings());
        self.context.paint(&view);
        done.complete();
    }

    fn on_settings_actions(&mut self, actions: Vec<SettingsAction>) {
        let outcome = self.store.apply_batch(&actions);
        if !outcome.changed {
            debug!("Settings batch left everything unchanged");
            return;
        }

        let settings = self.store.settings().clone();
        self.context.save_state(settings.to_value());
        self.context.update_settings_editor(self.store.settings_tree());
        if outcome.reconnect {
            info!(
                "Connection target changed to stream {} on {}",
                settings.stream_id, settings.server_url
            );
            self.controller.reconnect(settings);
        } else {
            self.controller.update_settings(settings);
        }
    }

    fn restart(&self) {
        self.controller.restart();
    }

    async fn unmount(self: Box<Self>) {
        let mut panel = self;
        panel.controller.shutdown().await;
        if let Some(task) = panel.task.take() {
            if let Err(e) = task.await {
                warn!("Stream controller task failed: {}", e);
            }
        }
        info!("Stream panel unmounted");
    }
}

impl Drop for StreamPanel {
    /// Dropped without unmount: stop the controller instead of leaking it
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Register the stream panel with a host
pub fn register(registry: &mut PanelRegistry, config: Config) {
    let config = Arc::new(config);
    registry.register(
        PANEL_NAME,
        Arc::new(move |context: Arc<dyn PanelContext>| {
            Box::new(StreamPanel::mount(context, &config)) as Box<dyn PanelInstance>
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerConfig;
    use crate::controller::state::ConnectionState;
    use crate::gateway::{EventCallback, GatewayError, GatewaySession, InitOptions};
    use crate::host::SettingsTree;
    use crate::settings::GENERAL_NODE;
    use crate::view::PanelView;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingContext {
        initial: Option<Value>,
        saved: Mutex<Vec<Value>>,
        trees: Mutex<Vec<SettingsTree>>,
        painted: Mutex<Vec<PanelView>>,
    }

    impl PanelContext for RecordingContext {
        fn initial_state(&self) -> Option<Value> {
            self.initial.clone()
        }

        fn save_state(&self, state: Value) {
            self.saved.lock().push(state);
        }

        fn update_settings_editor(&self, tree: SettingsTree) {
            self.trees.lock().push(tree);
        }

        fn paint(&self, view: &PanelView) {
            self.painted.lock().push(view.clone());
        }
    }

    /// Gateway that never reaches a server
    #[derive(Default)]
    struct UnreachableGateway {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Gateway for UnreachableGateway {
        async fn init(&self, _options: InitOptions) -> Result<(), GatewayError> {
            self.calls.lock().push("init".to_string());
            Ok(())
        }

        async fn create_session(
            &self,
            server_url: &str,
            _ice_servers: &[IceServerConfig],
            _events: EventCallback,
        ) -> Result<Box<dyn GatewaySession>, GatewayError> {
            self.calls.lock().push(format!("create_session {}", server_url));
            Err(GatewayError::Transport("connection refused".to_string()))
        }
    }

    fn mount(context: Arc<RecordingContext>, gateway: Arc<UnreachableGateway>) -> StreamPanel {
        StreamPanel::with_parts(
            context,
            gateway,
            Box::new(HeadlessSurface::new()),
            ControllerConfig::default(),
            "ws://localhost:8188/",
        )
    }

    fn edit(field: &str, value: Value) -> SettingsAction {
        SettingsAction::update(vec![GENERAL_NODE.to_string(), field.to_string()], value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_publishes_tree_and_connects() {
        let context = Arc::new(RecordingContext {
            initial: Some(json!({"serverUrl": "ws://gw:8188/", "streamId": 4})),
            ..Default::default()
        });
        let gateway = Arc::new(UnreachableGateway::default());
        let panel = mount(context.clone(), gateway.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let tree = context.trees.lock()[0].clone();
        assert_eq!(tree.field(GENERAL_NODE, "streamId").unwrap().value, json!(4));
        assert_eq!(
            *gateway.calls.lock(),
            vec!["init".to_string(), "create_session ws://gw:8188/".to_string()]
        );
        assert_eq!(panel.controller().view().state, ConnectionState::Disconnected);

        Box::new(panel).unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_paints_and_acknowledges() {
        let context = Arc::new(RecordingContext::default());
        let mut panel = mount(context.clone(), Arc::new(UnreachableGateway::default()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (done, rx) = RenderDone::new();
        panel.on_render(done);
        assert!(rx.await.is_ok());

        let painted = context.painted.lock()[0].clone();
        let status = painted.status.unwrap();
        assert!(status.is_error);
        assert!(status.message.contains("connection refused"));
        assert!(painted.log.is_none());

        Box::new(panel).unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_batch_reconnects_once() {
        let context = Arc::new(RecordingContext::default());
        let gateway = Arc::new(UnreachableGateway::default());
        let mut panel = mount(context.clone(), gateway.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        panel.on_settings_actions(vec![
            edit("serverUrl", json!("ws://other:8188/")),
            edit("streamId", json!(12)),
        ]);
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        let calls = gateway.calls.lock().clone();
        assert_eq!(calls.iter().filter(|c| *c == "init").count(), 2);
        assert_eq!(calls.last().unwrap(), "create_session ws://other:8188/");

        let saved = context.saved.lock().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0]["streamId"], json!(12));
        assert_eq!(context.trees.lock().len(), 2);

        Box::new(panel).unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_edit_does_not_reconnect() {
        let context = Arc::new(RecordingContext::default());
        let gateway = Arc::new(UnreachableGateway::default());
        let mut panel = mount(context.clone(), gateway.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        panel.on_settings_actions(vec![edit("debug", json!(true))]);
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(gateway.calls.lock().iter().filter(|c| *c == "init").count(), 1);
        assert!(panel.controller().view().debug);

        let (done, _rx) = RenderDone::new();
        panel.on_render(done);
        assert!(context.painted.lock()[0].log.is_some());

        // unchanged value: nothing persisted
        panel.on_settings_actions(vec![edit("debug", json!(true))]);
        assert_eq!(context.saved.lock().len(), 1);

        Box::new(panel).unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_panel_stops_controller() {
        let context = Arc::new(RecordingContext::default());
        let gateway = Arc::new(UnreachableGateway::default());
        let panel = mount(context, gateway.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let handle = panel.controller().clone();
        assert!(!handle.is_closed());
        drop(panel);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_closed());
        assert_eq!(Arc::strong_count(&gateway), 1);
    }

    #[test]
    fn test_register_uses_panel_name() {
        let mut registry = PanelRegistry::new();
        register(&mut registry, Config::default());
        assert_eq!(registry.names(), vec![PANEL_NAME]);
    }
}
