//! Janus gateway client over WebSocket
//!
//! One WebSocket connection per session. Outgoing frames go through a writer
//! task fed by an mpsc queue; a reader task resolves pending transactions and
//! routes plugin notifications by handle id; a keepalive task keeps the
//! session from timing out on the server.

use super::peer::{self, ReceiverPeer};
use super::protocol::{new_transaction, JanusMessage, JanusRequest};
use super::{
    DestroyOptions, EventCallback, Gateway, GatewayError, GatewayEvent, GatewayLogger,
    GatewaySession, InitOptions, Jsep, MediaDirections, PluginHandle,
};
use crate::config::{GatewayConfig, IceServerConfig};
use crate::controller::state::LogLevel;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use webrtc::api::API;

const SUBPROTOCOL: &str = "janus-protocol";

/// Gateway diagnostics: always to the `log` facade, and to the injected
/// logger when one is installed
#[derive(Default)]
struct Diagnostics {
    debug: AtomicBool,
    logger: Mutex<Option<GatewayLogger>>,
}

impl Diagnostics {
    fn emit(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info if self.debug.load(Ordering::Relaxed) => info!("janus: {}", message),
            LogLevel::Info => debug!("janus: {}", message),
            LogLevel::Warn => warn!("janus: {}", message),
            LogLevel::Error => error!("janus: {}", message),
        }
        let logger = self.logger.lock().clone();
        if let Some(logger) = logger {
            logger(level, message);
        }
    }
}

/// Janus client library
pub struct JanusGateway {
    keepalive: Duration,
    request_timeout: Duration,
    api: Mutex<Option<Arc<API>>>,
    diagnostics: Arc<Diagnostics>,
}

impl JanusGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            keepalive: Duration::from_secs(config.keepalive_secs),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            api: Mutex::new(None),
            diagnostics: Arc::new(Diagnostics::default()),
        }
    }
}

#[async_trait]
impl Gateway for JanusGateway {
    async fn init(&self, options: InitOptions) -> Result<(), GatewayError> {
        self.diagnostics.debug.store(options.debug, Ordering::Relaxed);
        *self.diagnostics.logger.lock() = options.logger;

        let mut api = self.api.lock();
        if api.is_none() {
            *api = Some(Arc::new(peer::build_api()?));
            info!("Gateway library initialized");
        }
        Ok(())
    }

    async fn create_session(
        &self,
        server_url: &str,
        ice_servers: &[IceServerConfig],
        events: EventCallback,
    ) -> Result<Box<dyn GatewaySession>, GatewayError> {
        let api = self
            .api
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::InvalidState("Gateway library not initialized".to_string()))?;

        let conn = Connection::open(
            server_url,
            self.request_timeout,
            self.diagnostics.clone(),
            events,
        )
        .await?;

        let reply = match conn.request(JanusRequest::create()).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };
        let session_id = match reply.created_id() {
            Ok(id) => id,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };
        conn.start_keepalive(session_id, self.keepalive);
        self.diagnostics
            .emit(LogLevel::Info, format!("Created session {} on {}", session_id, server_url));

        Ok(Box::new(JanusSession {
            id: session_id,
            conn,
            api,
            ice_servers: ice_servers.to_vec(),
        }))
    }
}

type PendingReply = oneshot::Sender<Result<JanusMessage, GatewayError>>;

/// Shared state of one plugin handle
struct HandleShared {
    id: u64,
    events: EventCallback,
    peer: Mutex<Option<Arc<ReceiverPeer>>>,
    detached: AtomicBool,
}

impl HandleShared {
    fn emit(&self, event: GatewayEvent) {
        (self.events)(event);
    }

    /// Close the media session; the cleanup notification fires once per
    /// peer connection
    async fn end_media(&self) {
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            peer.close().await;
            self.emit(GatewayEvent::Cleanup);
        }
    }

    fn peer(&self) -> Option<Arc<ReceiverPeer>> {
        self.peer.lock().clone()
    }
}

/// WebSocket connection backing one session
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, PendingReply>>,
    handles: Mutex<HashMap<u64, Arc<HandleShared>>>,
    events: EventCallback,
    closed: AtomicBool,
    request_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    async fn open(
        server_url: &str,
        request_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
        events: EventCallback,
    ) -> Result<Arc<Self>, GatewayError> {
        let mut request = server_url
            .into_client_request()
            .map_err(|e| GatewayError::Transport(format!("Invalid server URL {}: {}", server_url, e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _) = time::timeout(request_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| GatewayError::Timeout(format!("connection to {}", server_url)))?
            .map_err(|e| GatewayError::Transport(format!("Failed to connect to {}: {}", server_url, e)))?;
        info!("Connected to gateway at {}", server_url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let conn = Arc::new(Self {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
            request_timeout,
            diagnostics,
            tasks: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        let weak = Arc::downgrade(&conn);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                match msg {
                    Ok(Message::Text(text)) => match JanusMessage::from_json(&text) {
                        Ok(message) => conn.dispatch(message).await,
                        Err(e) => conn.diagnostics.emit(LogLevel::Warn, e.to_string()),
                    },
                    Ok(Message::Ping(ping)) => {
                        let _ = conn.outbound.send(Message::Pong(ping));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        conn.diagnostics
                            .emit(LogLevel::Error, format!("WebSocket error: {}", e));
                        break;
                    }
                }
            }
            if let Some(conn) = weak.upgrade() {
                conn.on_connection_lost();
            }
        });

        conn.tasks.lock().extend([writer, reader]);
        Ok(conn)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn start_keepalive(self: &Arc<Self>, session_id: u64, period: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                if conn.send_detached(JanusRequest::keepalive(session_id)).is_err() {
                    return;
                }
            }
        });
        if let Some(previous) = self.keepalive.lock().replace(task) {
            previous.abort();
        }
    }

    /// Send a request and wait for its `success`/`ack`/`error` reply
    async fn request(&self, request: JanusRequest) -> Result<JanusMessage, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let transaction = new_transaction();
        let kind = request.janus;
        let json = request.with_transaction(transaction.clone()).to_json()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction.clone(), tx);
        if self.outbound.send(Message::Text(json.into())).is_err() {
            self.pending.lock().remove(&transaction);
            return Err(GatewayError::Closed);
        }

        match time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(JanusMessage::Error { error, .. }))) => Err(GatewayError::Server {
                code: error.code,
                reason: error.reason,
            }),
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => {
                self.pending.lock().remove(&transaction);
                Err(GatewayError::Timeout(format!("{:?} reply", kind)))
            }
        }
    }

    /// Send a request without waiting for the reply
    fn send_detached(&self, request: JanusRequest) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let json = request.with_transaction(new_transaction()).to_json()?;
        self.outbound
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::Closed)
    }

    fn handle(&self, id: u64) -> Option<Arc<HandleShared>> {
        self.handles.lock().get(&id).cloned()
    }

    async fn dispatch(&self, message: JanusMessage) {
        if let Some(transaction) = message.reply_transaction() {
            let pending = self.pending.lock().remove(transaction);
            if let Some(tx) = pending {
                let _ = tx.send(Ok(message));
                return;
            }
        }

        match message {
            JanusMessage::Event {
                sender,
                plugindata,
                jsep,
                ..
            } => match self.handle(sender) {
                Some(handle) => handle.emit(GatewayEvent::Message {
                    body: plugindata.data,
                    jsep,
                }),
                None => debug!("Event for unknown handle {}", sender),
            },
            JanusMessage::Hangup { sender, reason } => {
                self.diagnostics.emit(
                    LogLevel::Info,
                    format!("Handle {} hung up: {}", sender, reason.unwrap_or_default()),
                );
                if let Some(handle) = self.handle(sender) {
                    handle.end_media().await;
                }
            }
            JanusMessage::Detached { sender } => {
                if let Some(handle) = self.handles.lock().remove(&sender) {
                    handle.detached.store(true, Ordering::SeqCst);
                }
                self.diagnostics
                    .emit(LogLevel::Info, format!("Handle {} detached", sender));
            }
            JanusMessage::Webrtcup { sender } => {
                self.diagnostics
                    .emit(LogLevel::Info, format!("PeerConnection up on handle {}", sender));
            }
            JanusMessage::Media {
                sender,
                media_type,
                receiving,
            } => {
                self.diagnostics.emit(
                    LogLevel::Info,
                    format!(
                        "Handle {}: gateway {} receiving {}",
                        sender,
                        if receiving.unwrap_or(false) { "started" } else { "stopped" },
                        media_type.unwrap_or_default()
                    ),
                );
            }
            JanusMessage::Slowlink { sender, uplink, lost } => {
                self.diagnostics.emit(
                    LogLevel::Warn,
                    format!(
                        "Slow link on handle {} (uplink {:?}, lost {:?})",
                        sender, uplink, lost
                    ),
                );
            }
            JanusMessage::Trickle { sender, candidate } => {
                let peer = self.handle(sender).and_then(|h| h.peer());
                match peer {
                    Some(peer) => {
                        if let Err(e) = peer.add_remote_candidate(&candidate).await {
                            self.diagnostics.emit(LogLevel::Warn, e.to_string());
                        }
                    }
                    None => debug!("Trickle for handle {} without peer connection", sender),
                }
            }
            JanusMessage::Timeout { session_id } => {
                self.diagnostics
                    .emit(LogLevel::Warn, format!("Session {} timed out", session_id));
                self.close();
                (self.events)(GatewayEvent::SessionDestroyed);
            }
            JanusMessage::Error { error, .. } => {
                self.diagnostics.emit(
                    LogLevel::Error,
                    format!("Unsolicited error {}: {}", error.code, error.reason),
                );
            }
            JanusMessage::Success { .. } | JanusMessage::Ack { .. } => {
                debug!("Reply for unknown transaction");
            }
            JanusMessage::Unknown => debug!("Ignoring unknown gateway message"),
        }
    }

    /// Fail every pending request
    fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(GatewayError::Closed));
        }
    }

    fn on_connection_lost(&self) {
        // Closed on purpose: no error to report
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_pending();
        self.abort_keepalive();
        self.diagnostics
            .emit(LogLevel::Error, "Lost connection to the gateway".to_string());
        (self.events)(GatewayEvent::SessionError(
            "Lost connection to the gateway".to_string(),
        ));
    }

    fn abort_keepalive(&self) {
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
    }

    /// Close the connection without reporting an error
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_pending();
        self.abort_keepalive();
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.abort_keepalive();
    }
}

/// Session on a Janus gateway
pub struct JanusSession {
    id: u64,
    conn: Arc<Connection>,
    api: Arc<API>,
    ice_servers: Vec<IceServerConfig>,
}

#[async_trait]
impl GatewaySession for JanusSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn attach(
        &self,
        plugin: &str,
        opaque_id: &str,
        events: EventCallback,
    ) -> Result<Box<dyn PluginHandle>, GatewayError> {
        let reply = self
            .conn
            .request(JanusRequest::attach(self.id, plugin, opaque_id))
            .await?;
        let handle_id = reply.created_id()?;

        let shared = Arc::new(HandleShared {
            id: handle_id,
            events,
            peer: Mutex::new(None),
            detached: AtomicBool::new(false),
        });
        self.conn.handles.lock().insert(handle_id, shared.clone());
        self.conn.diagnostics.emit(
            LogLevel::Info,
            format!("Attached to {} as handle {} ({})", plugin, handle_id, opaque_id),
        );

        Ok(Box::new(JanusHandle {
            session_id: self.id,
            conn: Arc::downgrade(&self.conn),
            shared,
            api: self.api.clone(),
            ice_servers: self.ice_servers.clone(),
        }))
    }

    async fn destroy(&self, options: DestroyOptions) -> Result<(), GatewayError> {
        if options.cleanup_handle {
            let handles: Vec<_> = self.conn.handles.lock().drain().map(|(_, h)| h).collect();
            for handle in handles {
                handle.end_media().await;
                if handle.detached.swap(true, Ordering::SeqCst) || options.unload {
                    continue;
                }
                if let Err(e) = self
                    .conn
                    .request(JanusRequest::detach(self.id, handle.id))
                    .await
                {
                    self.conn
                        .diagnostics
                        .emit(LogLevel::Warn, format!("Failed to detach handle {}: {}", handle.id, e));
                }
            }
        }

        let result = if self.conn.is_closed() {
            Ok(())
        } else if options.unload {
            self.conn.send_detached(JanusRequest::destroy(self.id))
        } else {
            self.conn
                .request(JanusRequest::destroy(self.id))
                .await
                .map(|_| ())
        };

        self.conn.close();
        self.conn
            .diagnostics
            .emit(LogLevel::Info, format!("Destroyed session {}", self.id));
        if options.notify_destroyed {
            (self.conn.events)(GatewayEvent::SessionDestroyed);
        }
        result
    }
}

/// Plugin handle on a Janus session
pub struct JanusHandle {
    session_id: u64,
    conn: Weak<Connection>,
    shared: Arc<HandleShared>,
    api: Arc<API>,
    ice_servers: Vec<IceServerConfig>,
}

impl JanusHandle {
    fn conn(&self) -> Result<Arc<Connection>, GatewayError> {
        self.conn.upgrade().ok_or(GatewayError::Closed)
    }

    async fn peer_or_create(&self) -> Result<Arc<ReceiverPeer>, GatewayError> {
        if let Some(peer) = self.shared.peer() {
            return Ok(peer);
        }

        let events = self.shared.events.clone();
        let on_track: peer::TrackCallback = Arc::new(move |track, mid, active| {
            events(GatewayEvent::RemoteTrack { track, mid, active });
        });

        let conn = self.conn.clone();
        let (session_id, handle_id) = (self.session_id, self.shared.id);
        let on_candidate: peer::CandidateCallback = Arc::new(move |candidate| {
            if let Some(conn) = conn.upgrade() {
                if let Err(e) = conn.send_detached(JanusRequest::trickle(session_id, handle_id, candidate)) {
                    debug!("Dropping local candidate: {}", e);
                }
            }
        });

        let peer = Arc::new(ReceiverPeer::new(&self.api, &self.ice_servers, on_track, on_candidate).await?);
        *self.shared.peer.lock() = Some(peer.clone());
        Ok(peer)
    }
}

#[async_trait]
impl PluginHandle for JanusHandle {
    fn id(&self) -> u64 {
        self.shared.id
    }

    async fn send(&self, body: Value, jsep: Option<Jsep>) -> Result<(), GatewayError> {
        if self.shared.detached.load(Ordering::SeqCst) {
            return Err(GatewayError::InvalidState("Handle detached".to_string()));
        }
        let conn = self.conn()?;
        conn.request(JanusRequest::message(self.session_id, self.shared.id, body, jsep))
            .await
            .map(|_| ())
    }

    async fn create_answer(&self, offer: Jsep, media: MediaDirections) -> Result<Jsep, GatewayError> {
        if media.sends_media() {
            return Err(GatewayError::InvalidState(
                "Sending media is not supported".to_string(),
            ));
        }
        let peer = self.peer_or_create().await?;
        peer.answer(&offer, media).await
    }

    async fn hangup(&self) -> Result<(), GatewayError> {
        self.shared.end_media().await;
        if self.shared.detached.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.conn.upgrade() {
            Some(conn) if !conn.is_closed() => conn
                .request(JanusRequest::hangup(self.session_id, self.shared.id))
                .await
                .map(|_| ()),
            _ => Ok(()),
        }
    }

    async fn bitrate(&self, media_id: Option<&str>) -> Result<u64, GatewayError> {
        let peer = self
            .shared
            .peer()
            .ok_or_else(|| GatewayError::InvalidState("No peer connection".to_string()))?;
        peer.bitrate(media_id)
    }

    fn is_connected(&self) -> bool {
        self.shared
            .peer()
            .map(|peer| peer.is_connected())
            .unwrap_or(false)
    }

    async fn detach(&self) -> Result<(), GatewayError> {
        self.shared.end_media().await;
        if self.shared.detached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.handles.lock().remove(&self.shared.id);
        conn.request(JanusRequest::detach(self.session_id, self.shared.id))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    /// Minimal gateway: replies to every request through `script`
    async fn fake_gateway<F>(script: F) -> String
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |_req: &Request, mut resp: Response| {
                resp.headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            let (mut write, mut read) = ws.split();
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    let request: Value = serde_json::from_str(&text).unwrap();
                    for reply in script(&request) {
                        if reply == json!("close") {
                            return;
                        }
                        write.send(Message::Text(reply.to_string().into())).await.unwrap();
                    }
                }
            }
        });
        format!("ws://{}/", addr)
    }

    fn streaming_script(request: &Value) -> Vec<Value> {
        let tx = request["transaction"].clone();
        match request["janus"].as_str().unwrap_or_default() {
            "create" => vec![json!({"janus": "success", "transaction": tx, "data": {"id": 11}})],
            "attach" => vec![json!({"janus": "success", "transaction": tx, "data": {"id": 22}})],
            "message" => vec![
                json!({"janus": "ack", "transaction": tx}),
                json!({
                    "janus": "event", "session_id": 11, "sender": 22, "transaction": tx,
                    "plugindata": {"plugin": "janus.plugin.streaming",
                                   "data": {"streaming": "event", "result": {"status": "preparing"}}}
                }),
            ],
            "hangup" => vec![json!({"janus": "hangup", "session_id": 11, "sender": 22, "reason": "test"})],
            "destroy" | "detach" => vec![json!({"janus": "success", "transaction": tx})],
            _ => vec![json!({"janus": "ack", "transaction": tx})],
        }
    }

    fn collector() -> (EventCallback, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    async fn initialized_gateway() -> JanusGateway {
        let gateway = JanusGateway::new(&GatewayConfig::default());
        gateway.init(InitOptions::default()).await.unwrap();
        gateway
    }

    #[tokio::test]
    async fn test_create_session_requires_init() {
        let gateway = JanusGateway::new(&GatewayConfig::default());
        let (events, _rx) = collector();
        let result = gateway.create_session("ws://127.0.0.1:1/", &[], events).await;
        assert!(matches!(result, Err(GatewayError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_attach_and_watch() {
        let url = fake_gateway(streaming_script).await;
        let gateway = initialized_gateway().await;
        let (session_events, _session_rx) = collector();
        let session = gateway.create_session(&url, &[], session_events).await.unwrap();
        assert_eq!(session.id(), 11);

        let (handle_events, mut handle_rx) = collector();
        let handle = session
            .attach("janus.plugin.streaming", "opaque-1", handle_events)
            .await
            .unwrap();
        assert_eq!(handle.id(), 22);

        handle
            .send(json!({"request": "watch", "id": 1}), None)
            .await
            .unwrap();
        match handle_rx.recv().await.unwrap() {
            GatewayEvent::Message { body, jsep } => {
                assert_eq!(body["result"]["status"], "preparing");
                assert!(jsep.is_none());
            }
            other => panic!("Expected Message, got {:?}", other),
        }
        assert!(!handle.is_connected());
        assert!(handle.bitrate(None).await.is_err());

        session
            .destroy(DestroyOptions {
                unload: false,
                notify_destroyed: false,
                cleanup_handle: true,
            })
            .await
            .unwrap();
        // destroyed session refuses further requests
        assert_eq!(
            handle.send(json!({"request": "stop"}), None).await,
            Err(GatewayError::InvalidState("Handle detached".to_string()))
        );
    }

    #[tokio::test]
    async fn test_destroy_notifies_when_asked() {
        let url = fake_gateway(streaming_script).await;
        let gateway = initialized_gateway().await;
        let (events, mut rx) = collector();
        let session = gateway.create_session(&url, &[], events).await.unwrap();
        session.destroy(DestroyOptions::default()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(GatewayEvent::SessionDestroyed)));
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let url = fake_gateway(|request| {
            let tx = request["transaction"].clone();
            match request["janus"].as_str().unwrap_or_default() {
                "create" => vec![json!({"janus": "success", "transaction": tx, "data": {"id": 1}})],
                _ => vec![json!({"janus": "error", "transaction": tx,
                                 "error": {"code": 460, "reason": "No such plugin"}})],
            }
        })
        .await;
        let gateway = initialized_gateway().await;
        let (events, _rx) = collector();
        let session = gateway.create_session(&url, &[], events).await.unwrap();
        let (handle_events, _handle_rx) = collector();
        let err = session
            .attach("janus.plugin.nope", "opaque", handle_events)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            GatewayError::Server {
                code: 460,
                reason: "No such plugin".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_timeout_destroys_session() {
        let url = fake_gateway(|request| {
            let tx = request["transaction"].clone();
            match request["janus"].as_str().unwrap_or_default() {
                "create" => vec![
                    json!({"janus": "success", "transaction": tx, "data": {"id": 5}}),
                    json!({"janus": "timeout", "session_id": 5}),
                ],
                _ => vec![],
            }
        })
        .await;
        let gateway = initialized_gateway().await;
        let (events, mut rx) = collector();
        let _session = gateway.create_session(&url, &[], events).await.unwrap();
        assert!(matches!(rx.recv().await, Some(GatewayEvent::SessionDestroyed)));
    }

    #[tokio::test]
    async fn test_lost_connection_reports_session_error() {
        let url = fake_gateway(|request| {
            let tx = request["transaction"].clone();
            match request["janus"].as_str().unwrap_or_default() {
                "create" => vec![json!({"janus": "success", "transaction": tx, "data": {"id": 5}})],
                _ => vec![json!("close")],
            }
        })
        .await;
        let gateway = initialized_gateway().await;
        let (events, mut rx) = collector();
        let session = gateway.create_session(&url, &[], events).await.unwrap();
        let (handle_events, _handle_rx) = collector();
        let result = session.attach("janus.plugin.streaming", "o", handle_events).await;
        assert_eq!(result.err(), Some(GatewayError::Closed));
        assert!(matches!(rx.recv().await, Some(GatewayEvent::SessionError(_))));
    }

    #[tokio::test]
    async fn test_logger_receives_diagnostics() {
        let url = fake_gateway(streaming_script).await;
        let gateway = JanusGateway::new(&GatewayConfig::default());
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        gateway
            .init(InitOptions {
                debug: true,
                logger: Some(Arc::new(move |_: LogLevel, line: String| sink.lock().push(line))),
            })
            .await
            .unwrap();
        let (events, _rx) = collector();
        let _session = gateway.create_session(&url, &[], events).await.unwrap();
        assert!(lines.lock().iter().any(|l| l.contains("Created session 11")));
    }
}
