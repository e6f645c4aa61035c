//! Receive-only peer connection used by plugin handles

use super::{GatewayError, Jsep, JsepType, MediaDirections};
use crate::config::{GatewayConfig, IceServerConfig};
use crate::media::{BitrateMeter, MediaTrack};
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Track activity callback: track, media line id, active
pub type TrackCallback = Arc<dyn Fn(MediaTrack, Option<String>, bool) + Send + Sync>;

/// Local candidate callback; `None` once gathering completed
pub type CandidateCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Build the WebRTC API with the default codecs and interceptors
pub fn build_api() -> Result<API, GatewayError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| GatewayError::InitFailed(format!("Failed to register codecs: {}", e)))?;

    // RTCP feedback (NACK, reports) for received streams
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| GatewayError::InitFailed(format!("Failed to register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Effective ICE servers: STUN/TURN hosts when configured, otherwise the
/// explicit `ice_servers` list
pub fn build_ice_servers(config: &GatewayConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    if !config.stun_host.is_empty() && config.stun_port != 0 {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() {
            "udp"
        } else {
            config.turn_protocol.as_str()
        };
        let url = format!(
            "{}:{}:{}?transport={}",
            scheme, config.turn_host, config.turn_port, transport
        );

        let (username, credential) = if !config.turn_shared_secret.is_empty() {
            let ttl_secs: u64 = 24 * 60 * 60;
            let expiry = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() + ttl_secs)
                .unwrap_or(ttl_secs);
            let user = format!("{}:stream-panel", expiry);
            let password = hmac_sha1_base64(&config.turn_shared_secret, &user);
            (Some(user), Some(password))
        } else if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
            (Some(config.turn_username.clone()), Some(config.turn_password.clone()))
        } else {
            (None, None)
        };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }
    servers
}

/// TURN REST API credential
fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha1>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}

#[derive(Default)]
struct TrackTable {
    tracks: Vec<(MediaTrack, Option<String>)>,
    meters: HashMap<String, BitrateMeter>,
}

/// Peer connection that only receives media
pub struct ReceiverPeer {
    pc: Arc<RTCPeerConnection>,
    table: Arc<Mutex<TrackTable>>,
}

impl ReceiverPeer {
    /// Create the peer connection and wire its callbacks
    pub async fn new(
        api: &API,
        ice_servers: &[IceServerConfig],
        on_track: TrackCallback,
        on_candidate: CandidateCallback,
    ) -> Result<Self, GatewayError> {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| GatewayError::Transport(format!("Failed to create peer connection: {}", e)))?,
        );
        let table: Arc<Mutex<TrackTable>> = Arc::new(Mutex::new(TrackTable::default()));

        {
            let table = table.clone();
            let on_track = on_track.clone();
            pc.on_track(Box::new(move |track, _receiver, transceiver| {
                let table = table.clone();
                let on_track = on_track.clone();
                Box::pin(async move {
                    let mid = transceiver.mid().map(|m| m.to_string());
                    let track = MediaTrack::from_remote(track);
                    info!(
                        "Remote {} track {} on mid {:?} ({:?})",
                        track.kind().as_str(),
                        track.id(),
                        mid,
                        track.mime_type()
                    );
                    table.lock().tracks.push((track.clone(), mid.clone()));
                    on_track(track, mid, true);
                })
            }));
        }

        {
            let table = table.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let table = table.clone();
                let on_track = on_track.clone();
                Box::pin(async move {
                    debug!("Peer connection state: {}", state);
                    if matches!(
                        state,
                        RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed
                    ) {
                        // Reported once per track
                        let ended = std::mem::take(&mut table.lock().tracks);
                        for (track, mid) in ended {
                            track.stop();
                            on_track(track, mid, false);
                        }
                    }
                })
            }));
        }

        pc.on_ice_candidate(Box::new(move |candidate| {
            let on_candidate = on_candidate.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => on_candidate(Some(json!({
                            "candidate": init.candidate,
                            "sdpMid": init.sdp_mid,
                            "sdpMLineIndex": init.sdp_mline_index,
                        }))),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    },
                    None => on_candidate(None),
                }
            })
        }));

        Ok(Self { pc, table })
    }

    /// Apply a remote offer and produce the local answer
    pub async fn answer(&self, offer: &Jsep, media: MediaDirections) -> Result<Jsep, GatewayError> {
        if offer.kind != JsepType::Offer {
            return Err(GatewayError::Sdp("Expected an offer".to_string()));
        }
        if media.sends_media() {
            return Err(GatewayError::InvalidState(
                "Sending media is not supported".to_string(),
            ));
        }

        let offer = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| GatewayError::Sdp(format!("Invalid SDP offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| GatewayError::Sdp(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| GatewayError::Sdp(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| GatewayError::Sdp(format!("Failed to set local description: {}", e)))?;

        let sdp = match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => answer.sdp,
        };
        let mut jsep = Jsep::answer(sdp);
        jsep.trickle = Some(true);
        Ok(jsep)
    }

    /// Add a candidate trickled by the gateway
    pub async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), GatewayError> {
        if candidate.get("completed").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let Some(text) = candidate.get("candidate").and_then(Value::as_str) else {
            return Err(GatewayError::Protocol("Trickle without candidate".to_string()));
        };
        let init = RTCIceCandidateInit {
            candidate: text.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(Value::as_str)
                .map(str::to_string),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(Value::as_u64)
                .map(|i| i as u16),
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| GatewayError::Sdp(format!("Failed to add ICE candidate: {}", e)))
    }

    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// Receive bitrate of the track on `mid`, or of the first video track
    pub fn bitrate(&self, mid: Option<&str>) -> Result<u64, GatewayError> {
        let mut table = self.table.lock();
        let found = table
            .tracks
            .iter()
            .find(|(track, track_mid)| match mid {
                Some(mid) => track_mid.as_deref() == Some(mid),
                None => track.is_video(),
            })
            .map(|(track, track_mid)| (track.clone(), track_mid.clone()));

        let (track, track_mid) = found.ok_or_else(|| {
            GatewayError::InvalidState(format!("No track for media id {:?}", mid))
        })?;
        let key = track_mid.unwrap_or_else(|| track.id().to_string());
        let meter = table.meters.entry(key).or_default();
        Ok(meter.sample(track.bytes_received()))
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}
