//! Connection lifecycle controller
//!
//! `StreamController` owns the gateway session, the plugin handle, the media
//! stream attached to the surface and the bitrate sampler. Every input
//! (commands, gateway notifications, timer ticks, scheduled continuations)
//! is a `ControllerEvent` on a single queue, handled one at a time in
//! arrival order. Each handled event publishes a fresh `ViewState`.
//!
//! Gateway calls made while handling an event are abandoned as soon as a
//! restart, reconnect or shutdown is queued behind it.

pub mod state;

use crate::config::{Config, IceServerConfig};
use crate::gateway::peer::build_ice_servers;
use crate::gateway::{
    DestroyOptions, EventCallback, Gateway, GatewayEvent, GatewayLogger, GatewaySession,
    InitOptions, Jsep, JsepType, MediaDirections, PluginHandle,
};
use crate::media::{MediaStream, MediaTrack, VideoSurface};
use crate::settings::StreamSettings;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use state::{ConnectionError, ConnectionState, ErrorSource, LogEntry, LogLevel, VideoStats, ViewState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

/// Controller tunables
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Plugin attached for every session
    pub plugin: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Wait between stopping the stream and cleanup during a restart
    pub stop_settle: Duration,
    /// Wait between cleanup and initialize during a restart
    pub reinit_delay: Duration,
    /// Wait between a new video track and playback
    pub playback_settle: Duration,
    pub sample_interval: Duration,
}

impl ControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            plugin: config.gateway.plugin.clone(),
            ice_servers: build_ice_servers(&config.gateway),
            stop_settle: Duration::from_millis(config.timing.stop_settle_ms),
            reinit_delay: Duration::from_millis(config.timing.reinit_delay_ms),
            playback_settle: Duration::from_millis(config.timing.playback_settle_ms),
            sample_interval: Duration::from_millis(config.timing.sample_interval_ms),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Restart continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStep {
    Cleanup,
    Initialize,
}

/// Controller input
#[derive(Debug)]
pub enum ControllerEvent {
    Initialize,
    /// Manual restart
    Restart,
    /// Connection target changed: adopt the settings, then restart
    Reconnect(StreamSettings),
    /// Settings changed without affecting the connection
    UpdateSettings(StreamSettings),
    /// Tear down and stop; the sender is notified once done
    Shutdown(Option<oneshot::Sender<()>>),
    /// Notification from the session opened in `epoch`
    Gateway { epoch: u64, event: GatewayEvent },
    PlaybackSettled { epoch: u64 },
    SampleTick { epoch: u64 },
    RestartStep { seq: u64, step: RestartStep },
    /// Gateway library diagnostics
    Log(LogLevel, String),
}

/// Command side of a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerEvent>,
    view: watch::Receiver<ViewState>,
    /// Count of restart, reconnect and shutdown commands ever sent
    interrupts: Arc<watch::Sender<u64>>,
}

impl ControllerHandle {
    fn send(&self, event: ControllerEvent) {
        if self.tx.send(event).is_err() {
            debug!("Stream controller is gone");
        }
    }

    /// Queue a command that abandons any gateway call in flight
    fn send_interrupting(&self, event: ControllerEvent) -> bool {
        self.interrupts.send_modify(|sent| *sent += 1);
        self.tx.send(event).is_ok()
    }

    pub fn initialize(&self) {
        self.send(ControllerEvent::Initialize);
    }

    pub fn restart(&self) {
        if !self.send_interrupting(ControllerEvent::Restart) {
            debug!("Stream controller is gone");
        }
    }

    pub fn reconnect(&self, settings: StreamSettings) {
        if !self.send_interrupting(ControllerEvent::Reconnect(settings)) {
            debug!("Stream controller is gone");
        }
    }

    pub fn update_settings(&self, settings: StreamSettings) {
        self.send(ControllerEvent::UpdateSettings(settings));
    }

    /// Tear down and wait until the controller stopped
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if !self.send_interrupting(ControllerEvent::Shutdown(Some(tx))) {
            return;
        }
        let _ = rx.await;
    }

    /// The controller task has ended and dropped its queue
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Latest published view state
    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }
}

/// Abandons a gateway call once an interrupting command is queued behind it
struct Interrupt {
    sent: watch::Receiver<u64>,
    seen: u64,
}

impl Interrupt {
    async fn guard<F: Future>(self, call: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = call => Some(output),
            _ = self.queued() => None,
        }
    }

    async fn queued(mut self) {
        let seen = self.seen;
        let closed = self.sent.wait_for(|sent| *sent > seen).await.is_err();
        if closed {
            // no handle left to send one
            std::future::pending::<()>().await;
        }
    }
}

pub struct StreamController {
    gateway: Arc<dyn Gateway>,
    surface: Box<dyn VideoSurface>,
    config: ControllerConfig,
    settings: StreamSettings,

    tx: mpsc::UnboundedSender<ControllerEvent>,
    rx: mpsc::UnboundedReceiver<ControllerEvent>,
    view_tx: watch::Sender<ViewState>,
    view: ViewState,
    interrupts: watch::Receiver<u64>,
    /// Interrupting commands taken off the queue so far
    interrupts_seen: u64,

    session: Option<Box<dyn GatewaySession>>,
    plugin: Option<Arc<dyn PluginHandle>>,
    media_stream: Option<MediaStream>,
    video_mid: Option<String>,

    /// Bumped whenever a session is opened or cleaned up
    epoch: u64,
    /// Bumped whenever a restart sequence starts or is cancelled
    restart_seq: u64,
    restart_task: Option<JoinHandle<()>>,
    playback_task: Option<JoinHandle<()>>,
    sampler: Option<JoinHandle<()>>,
    finished: bool,
}

impl StreamController {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        surface: Box<dyn VideoSurface>,
        config: ControllerConfig,
        settings: StreamSettings,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let view = ViewState {
            debug: settings.debug,
            ..Default::default()
        };
        let (view_tx, view_rx) = watch::channel(view.clone());
        let (interrupts_tx, interrupts) = watch::channel(0);

        let handle = ControllerHandle {
            tx: tx.clone(),
            view: view_rx,
            interrupts: Arc::new(interrupts_tx),
        };
        let controller = Self {
            gateway,
            surface,
            config,
            settings,
            tx,
            rx,
            view_tx,
            view,
            interrupts,
            interrupts_seen: 0,
            session: None,
            plugin: None,
            media_stream: None,
            video_mid: None,
            epoch: 0,
            restart_seq: 0,
            restart_task: None,
            playback_task: None,
            sampler: None,
            finished: false,
        };
        (controller, handle)
    }

    /// Run the controller on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        self.publish();
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
            if self.finished {
                break;
            }
        }
        debug!("Stream controller stopped");
    }

    pub async fn handle(&mut self, event: ControllerEvent) {
        if matches!(
            event,
            ControllerEvent::Restart | ControllerEvent::Reconnect(_) | ControllerEvent::Shutdown(_)
        ) {
            let sent = *self.interrupts.borrow();
            self.interrupts_seen = (self.interrupts_seen + 1).min(sent);
        }
        match event {
            ControllerEvent::Initialize => self.initialize().await,
            ControllerEvent::Restart => self.restart().await,
            ControllerEvent::Reconnect(settings) => {
                self.apply_settings(settings);
                self.restart().await;
            }
            ControllerEvent::UpdateSettings(settings) => self.apply_settings(settings),
            ControllerEvent::Shutdown(reply) => {
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            ControllerEvent::Gateway { epoch, event } => {
                if epoch == self.epoch {
                    self.on_gateway_event(event).await;
                } else {
                    debug!("Dropping gateway event from session epoch {} (now {})", epoch, self.epoch);
                }
            }
            ControllerEvent::PlaybackSettled { epoch } => {
                if epoch == self.epoch {
                    self.playback_task = None;
                    self.on_playback_settled().await;
                }
            }
            ControllerEvent::SampleTick { epoch } => {
                if epoch == self.epoch && self.sampler.is_some() {
                    self.on_sample_tick().await;
                }
            }
            ControllerEvent::RestartStep { seq, step } => {
                if seq == self.restart_seq {
                    self.on_restart_step(step).await;
                } else {
                    debug!("Dropping stale restart step {:?}", step);
                }
            }
            ControllerEvent::Log(level, message) => {
                if self.settings.debug {
                    self.push_log(level, message);
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view.clone());
    }

    fn apply_settings(&mut self, settings: StreamSettings) {
        self.view.debug = settings.debug;
        self.settings = settings;
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.view.logs.push(LogEntry { message, level });
    }

    /// Controller diagnostics go to the log facade and the log panel
    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.push_log(level, message);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.view.state != state {
            debug!("Connection state {:?} -> {:?}", self.view.state, state);
            self.view.state = state;
        }
    }

    /// Surface an error without touching the connection state
    fn surface_error(&mut self, source: ErrorSource, message: impl Into<String>) {
        let error = ConnectionError::new(source, message);
        self.log(LogLevel::Error, error.to_string());
        self.view.error = Some(error);
    }

    /// Surface an error and force Disconnected
    fn fail(&mut self, source: ErrorSource, message: impl Into<String>) {
        self.surface_error(source, message);
        self.clear_sampler();
        self.cancel_playback();
        self.view.connected = false;
        self.view.stats = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn interrupt(&self) -> Interrupt {
        Interrupt {
            sent: self.interrupts.clone(),
            seen: self.interrupts_seen,
        }
    }

    fn abandoned(&mut self, call: &str) {
        self.log(LogLevel::Warn, format!("Abandoned {} for a newer command", call));
    }

    fn event_callback(&self, epoch: u64) -> EventCallback {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(ControllerEvent::Gateway { epoch, event });
        })
    }

    fn gateway_logger(&self) -> GatewayLogger {
        let tx = self.tx.clone();
        Arc::new(move |level, message| {
            let _ = tx.send(ControllerEvent::Log(level, message));
        })
    }

    async fn initialize(&mut self) {
        self.set_state(ConnectionState::Initializing);
        let options = InitOptions {
            debug: self.settings.debug,
            logger: Some(self.gateway_logger()),
        };
        let result = self.interrupt().guard(self.gateway.init(options)).await;
        match result {
            Some(Ok(())) => self.connect().await,
            Some(Err(e)) => {
                self.fail(ErrorSource::Gateway, format!("Failed to initialize gateway: {}", e))
            }
            None => self.abandoned("gateway init"),
        }
    }

    async fn connect(&mut self) {
        if self.session.is_some() {
            self.cleanup().await;
        }
        self.epoch += 1;
        self.set_state(ConnectionState::Connecting);
        self.log(
            LogLevel::Info,
            format!("Connecting to {}", self.settings.server_url),
        );

        let events = self.event_callback(self.epoch);
        let result = self
            .interrupt()
            .guard(self.gateway.create_session(
                &self.settings.server_url,
                &self.config.ice_servers,
                events,
            ))
            .await;
        match result {
            Some(Ok(session)) => {
                self.log(LogLevel::Info, format!("Session {} created", session.id()));
                self.session = Some(session);
                self.set_state(ConnectionState::Attaching);
                self.attach().await;
            }
            Some(Err(e)) => self.fail(ErrorSource::Gateway, e.to_string()),
            None => self.abandoned("session creation"),
        }
    }

    async fn attach(&mut self) {
        let opaque_id = format!("stream-panel-{}", uuid::Uuid::new_v4().simple());
        let events = self.event_callback(self.epoch);
        let interrupt = self.interrupt();
        let result = match self.session.as_ref() {
            Some(session) => {
                interrupt
                    .guard(session.attach(&self.config.plugin, &opaque_id, events))
                    .await
            }
            None => return,
        };
        match result {
            Some(Ok(handle)) => {
                self.log(
                    LogLevel::Info,
                    format!("Attached to {} (handle {})", self.config.plugin, handle.id()),
                );
                self.plugin = Some(Arc::from(handle));
                self.start_stream().await;
            }
            Some(Err(e)) => {
                self.fail(ErrorSource::Plugin, format!("Failed to attach plugin: {}", e))
            }
            None => self.abandoned("plugin attach"),
        }
    }

    async fn start_stream(&mut self) {
        let Some(plugin) = self.plugin.clone() else {
            self.surface_error(ErrorSource::Plugin, "No plugin handle to start the stream on");
            return;
        };
        self.set_state(ConnectionState::Watching);
        let stream_id = self.settings.stream_id;
        self.log(LogLevel::Info, format!("Watching stream {}", stream_id));
        let request = plugin.send(json!({ "request": "watch", "id": stream_id }), None);
        match self.interrupt().guard(request).await {
            Some(Ok(())) => {}
            Some(Err(e)) => self.fail(ErrorSource::Plugin, format!("Failed to request stream: {}", e)),
            None => self.abandoned("watch request"),
        }
    }

    async fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::SessionDestroyed => {
                self.log(LogLevel::Info, "Session destroyed");
                self.clear_sampler();
                self.set_state(ConnectionState::Destroyed);
                self.view.stats = None;
                self.view.connected = false;
            }
            GatewayEvent::SessionError(message) => self.fail(ErrorSource::Gateway, message),
            GatewayEvent::Message { body, jsep } => self.on_message(body, jsep).await,
            GatewayEvent::RemoteTrack { track, mid, active } => {
                self.on_remote_track(track, mid, active)
            }
            GatewayEvent::Cleanup => self.on_cleanup(),
        }
    }

    async fn on_message(&mut self, body: Value, jsep: Option<Jsep>) {
        if let Some(error) = body.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            self.surface_error(ErrorSource::Stream, message);
        }
        if let Some(status) = body
            .get("result")
            .and_then(|r| r.get("status"))
            .and_then(Value::as_str)
        {
            self.log(LogLevel::Info, format!("Stream status: {}", status));
        }

        let Some(jsep) = jsep else {
            return;
        };
        if jsep.kind != JsepType::Offer {
            debug!("Ignoring {:?} session description", jsep.kind);
            return;
        }
        let Some(plugin) = self.plugin.clone() else {
            return;
        };

        self.log(LogLevel::Info, "Received offer, negotiating answer");
        let answer = plugin.create_answer(jsep, MediaDirections::receive_only());
        let answer = match self.interrupt().guard(answer).await {
            Some(Ok(answer)) => answer,
            Some(Err(e)) => {
                self.fail(ErrorSource::Transport, format!("Failed to negotiate: {}", e));
                return;
            }
            None => {
                self.abandoned("answer negotiation");
                return;
            }
        };
        let start = plugin.send(json!({ "request": "start" }), Some(answer));
        match self.interrupt().guard(start).await {
            Some(Ok(())) => {}
            Some(Err(e)) => self.fail(ErrorSource::Transport, format!("Failed to start stream: {}", e)),
            None => self.abandoned("start request"),
        }
    }

    fn on_remote_track(&mut self, track: MediaTrack, mid: Option<String>, active: bool) {
        if !track.is_video() {
            debug!("Ignoring {} track {}", track.kind().as_str(), track.id());
            return;
        }

        if !active {
            self.log(LogLevel::Info, format!("Video track {} ended", track.id()));
            self.set_state(ConnectionState::Stopped);
            self.view.stats = None;
            self.clear_sampler();
            return;
        }

        self.log(
            LogLevel::Info,
            format!("Video track {} active (mid {:?})", track.id(), mid),
        );
        let stream = self.media_stream.get_or_insert_with(MediaStream::new).clone();
        // Replace, never append: one video track per stream
        for previous in stream.video_tracks() {
            stream.remove_track(&previous);
        }
        stream.add_track(track);

        let attached = self
            .surface
            .src_object()
            .map(|src| src.ptr_eq(&stream))
            .unwrap_or(false);
        if !attached {
            self.surface.set_src_object(Some(stream));
        }
        self.video_mid = mid;

        if !self.view.connected {
            self.schedule_playback();
        }
    }

    fn schedule_playback(&mut self) {
        self.cancel_playback();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let delay = self.config.playback_settle;
        self.playback_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(ControllerEvent::PlaybackSettled { epoch });
        }));
    }

    fn cancel_playback(&mut self) {
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
    }

    async fn on_playback_settled(&mut self) {
        if self.view.connected {
            return;
        }
        match self.surface.play().await {
            Ok(()) => {
                self.view.connected = true;
                self.view.error = None;
                self.set_state(ConnectionState::Connected);
                self.log(LogLevel::Info, "Playback started");
                self.start_sampler();
            }
            Err(e) if e.is_superseded() => {
                self.log(LogLevel::Warn, format!("Playback superseded: {}", e.message()));
            }
            Err(e) => self.fail(ErrorSource::Playback, e.message().to_string()),
        }
    }

    /// Start the bitrate sampler unless one is already running
    fn start_sampler(&mut self) {
        if self.sampler.is_some() {
            warn!("Bitrate sampler already running");
            return;
        }
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let period = self.config.sample_interval;
        self.sampler = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if tx.send(ControllerEvent::SampleTick { epoch }).is_err() {
                    break;
                }
            }
        }));
    }

    fn clear_sampler(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
    }

    async fn on_sample_tick(&mut self) {
        let Some(plugin) = self.plugin.clone() else {
            return;
        };
        let (width, height) = self.surface.video_size();
        match plugin.bitrate(self.video_mid.as_deref()).await {
            Ok(bitrate) => {
                self.view.stats = Some(VideoStats {
                    width,
                    height,
                    bitrate,
                });
            }
            // sampling problems never become connection errors
            Err(e) => debug!("Bitrate sample failed: {}", e),
        }
    }

    fn on_cleanup(&mut self) {
        self.log(LogLevel::Info, "Media session ended");
        self.clear_sampler();
        self.cancel_playback();
        self.surface.set_src_object(None);
        self.media_stream = None;
        self.set_state(ConnectionState::Stopped);
        self.view.stats = None;
        self.view.connected = false;
    }

    async fn stop_stream(&mut self) {
        let Some(plugin) = self.plugin.clone() else {
            return;
        };
        self.cancel_playback();
        self.surface.pause();
        if let Some(stream) = self.surface.src_object() {
            for track in stream.tracks() {
                track.stop();
                stream.remove_track(&track);
            }
        }
        self.surface.set_src_object(None);

        let stop = plugin.send(json!({ "request": "stop" }), None);
        match self.interrupt().guard(stop).await {
            Some(Ok(())) => {}
            Some(Err(e)) => self.log(LogLevel::Warn, format!("Failed to send stop request: {}", e)),
            None => {
                self.abandoned("stop request");
                return;
            }
        }
        match self.interrupt().guard(plugin.hangup()).await {
            Some(Ok(())) => {}
            Some(Err(e)) => self.log(LogLevel::Warn, format!("Failed to hang up: {}", e)),
            None => self.abandoned("hangup"),
        }
    }

    async fn cleanup(&mut self) {
        self.clear_sampler();
        self.cancel_playback();

        if let Some(session) = self.session.take() {
            let options = DestroyOptions {
                unload: true,
                notify_destroyed: false,
                cleanup_handle: true,
            };
            match self.interrupt().guard(session.destroy(options)).await {
                Some(Ok(())) => {}
                Some(Err(e)) => self.log(LogLevel::Warn, format!("Failed to destroy session: {}", e)),
                None => self.abandoned("session destroy"),
            }
        }
        self.plugin = None;
        self.epoch += 1;

        self.media_stream = None;
        self.video_mid = None;
        self.surface.set_src_object(None);
        self.surface.load();

        self.set_state(ConnectionState::Disconnected);
        self.view.connected = false;
        self.view.stats = None;
    }

    fn cancel_restart(&mut self) {
        self.restart_seq += 1;
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }

    fn schedule_restart_step(&mut self, step: RestartStep, delay: Duration) {
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
        let tx = self.tx.clone();
        let seq = self.restart_seq;
        self.restart_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(ControllerEvent::RestartStep { seq, step });
        }));
    }

    async fn restart(&mut self) {
        self.cancel_restart();
        self.log(LogLevel::Info, "Restarting stream");
        self.stop_stream().await;
        self.schedule_restart_step(RestartStep::Cleanup, self.config.stop_settle);
    }

    async fn on_restart_step(&mut self, step: RestartStep) {
        match step {
            RestartStep::Cleanup => {
                self.cleanup().await;
                self.schedule_restart_step(RestartStep::Initialize, self.config.reinit_delay);
            }
            RestartStep::Initialize => {
                self.restart_task = None;
                self.initialize().await;
            }
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_restart();
        self.cancel_playback();
        self.stop_stream().await;
        self.cleanup().await;
        self.finished = true;
        info!("Stream controller shut down");
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.clear_sampler();
        self.cancel_playback();
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }
}
