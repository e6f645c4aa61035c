//! Media primitives shared by the controller, the gateway and the surfaces
//!
//! This module provides:
//! - `MediaTrack`: a received track (or a synthetic one in tests)
//! - `MediaStream`: the track set attached to a video surface
//! - `VideoSurface`: the render target contract
//! - `BitrateMeter`: byte-counter based bitrate estimation

pub mod headless;
#[cfg(feature = "gstreamer-surface")]
pub mod gst;

pub use headless::HeadlessSurface;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    mime_type: Option<String>,
    live: AtomicBool,
    bytes_received: AtomicU64,
    remote: Option<Arc<TrackRemote>>,
}

/// A media track. Clones share the same underlying track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track with no RTP source
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                mime_type: None,
                live: AtomicBool::new(true),
                bytes_received: AtomicU64::new(0),
                remote: None,
            }),
        }
    }

    /// Wrap a track received on a peer connection
    pub fn from_remote(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let mime_type = track.codec().capability.mime_type;

        Self {
            inner: Arc::new(TrackInner {
                id: track.id(),
                kind,
                mime_type: Some(mime_type),
                live: AtomicBool::new(true),
                bytes_received: AtomicU64::new(0),
                remote: Some(track),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_video(&self) -> bool {
        self.inner.kind == TrackKind::Video
    }

    /// Codec MIME type, e.g. `video/VP8`
    pub fn mime_type(&self) -> Option<&str> {
        self.inner.mime_type.as_deref()
    }

    pub fn payload_type(&self) -> Option<u8> {
        self.inner.remote.as_ref().map(|t| t.payload_type())
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// End the track locally; readers see end-of-stream
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            debug!("Track {} ({}) stopped", self.inner.id, self.inner.kind.as_str());
        }
    }

    /// Bytes of RTP payload read so far
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Read the next RTP packet. `None` once the track ended or when it has
    /// no RTP source.
    pub async fn read_rtp(&self) -> Option<Packet> {
        if !self.is_live() {
            return None;
        }
        let remote = self.inner.remote.as_ref()?;
        match remote.read_rtp().await {
            Ok((packet, _)) => {
                self.inner
                    .bytes_received
                    .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                Some(packet)
            }
            Err(e) => {
                debug!("Track {} read ended: {}", self.inner.id, e);
                self.inner.live.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Whether both handles refer to the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("mime_type", &self.inner.mime_type)
            .field("live", &self.is_live())
            .finish()
    }
}

struct StreamInner {
    id: String,
    tracks: Mutex<Vec<MediaTrack>>,
    version: watch::Sender<u64>,
}

/// Track set attached to a surface. Clones share the same stream.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                tracks: Mutex::new(Vec::new()),
                version,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.lock().clone()
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .lock()
            .iter()
            .filter(|t| t.is_video())
            .cloned()
            .collect()
    }

    /// Add a track; adding a track that is already present is a no-op
    pub fn add_track(&self, track: MediaTrack) {
        {
            let mut tracks = self.inner.tracks.lock();
            if tracks.iter().any(|t| t.same_track(&track)) {
                return;
            }
            tracks.push(track);
        }
        self.inner.version.send_modify(|v| *v += 1);
    }

    /// Remove a track; returns whether it was present
    pub fn remove_track(&self, track: &MediaTrack) -> bool {
        let removed = {
            let mut tracks = self.inner.tracks.lock();
            let before = tracks.len();
            tracks.retain(|t| !t.same_track(track));
            tracks.len() != before
        };
        if removed {
            self.inner.version.send_modify(|v| *v += 1);
        }
        removed
    }

    /// Notified whenever the track set changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    pub fn ptr_eq(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.lock().len())
            .finish()
    }
}

/// Phrase carried by a play() rejection caused by a newer load request
pub const SUPERSEDED_LOAD_PHRASE: &str = "interrupted by a new load request";

/// Rejected play() request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackError {
    message: String,
}

impl PlaybackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The rejection a surface reports when a load replaced a pending play
    pub fn superseded() -> Self {
        Self::new(format!("The play() request was {}", SUPERSEDED_LOAD_PHRASE))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Benign rejection: a newer load took over, the next track event retries
    pub fn is_superseded(&self) -> bool {
        self.message.contains(SUPERSEDED_LOAD_PHRASE)
    }
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Playback failed: {}", self.message)
    }
}

impl Error for PlaybackError {}

/// Render target for received video.
///
/// Mirrors a media element: a source stream can be attached, playback can be
/// started and paused, and `load` resets the element.
#[async_trait]
pub trait VideoSurface: Send {
    /// Currently attached stream
    fn src_object(&self) -> Option<MediaStream>;

    /// Attach or detach a stream
    fn set_src_object(&mut self, stream: Option<MediaStream>);

    fn pause(&mut self);

    async fn play(&mut self) -> Result<(), PlaybackError>;

    /// Reset the element; pending playback is abandoned
    fn load(&mut self);

    /// Decoded frame size, (0, 0) when unknown
    fn video_size(&self) -> (u32, u32);
}

/// Estimates a bitrate from successive byte-counter readings
#[derive(Debug, Default)]
pub struct BitrateMeter {
    last: Option<(Instant, u64)>,
}

impl BitrateMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits per second since the previous sample; the first sample yields 0
    pub fn sample(&mut self, bytes: u64) -> u64 {
        self.sample_at(bytes, Instant::now())
    }

    pub fn sample_at(&mut self, bytes: u64, now: Instant) -> u64 {
        let bitrate = match self.last {
            Some((at, prev)) if now > at && bytes >= prev => {
                let secs = now.duration_since(at).as_secs_f64();
                ((bytes - prev) as f64 * 8.0 / secs).round() as u64
            }
            _ => 0,
        };
        self.last = Some((now, bytes));
        bitrate
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stream_add_is_idempotent_per_track() {
        let stream = MediaStream::new();
        let track = MediaTrack::new("v0", TrackKind::Video);
        stream.add_track(track.clone());
        stream.add_track(track.clone());
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.remove_track(&track));
        assert!(!stream.remove_track(&track));
        assert!(stream.tracks().is_empty());
    }

    #[test]
    fn test_video_tracks_filters_audio() {
        let stream = MediaStream::new();
        stream.add_track(MediaTrack::new("a0", TrackKind::Audio));
        stream.add_track(MediaTrack::new("v0", TrackKind::Video));
        let video = stream.video_tracks();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].id(), "v0");
    }

    #[test]
    fn test_stream_changes_bump_version() {
        let stream = MediaStream::new();
        let rx = stream.subscribe();
        stream.add_track(MediaTrack::new("v0", TrackKind::Video));
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_stopped_track_reads_nothing() {
        let track = MediaTrack::new("v0", TrackKind::Video);
        assert!(track.is_live());
        track.stop();
        assert!(!track.is_live());
        assert!(track.read_rtp().await.is_none());
    }

    #[test]
    fn test_superseded_detection() {
        assert!(PlaybackError::superseded().is_superseded());
        assert!(PlaybackError::new(
            "AbortError: The play() request was interrupted by a new load request."
        )
        .is_superseded());
        assert!(!PlaybackError::new("NotAllowedError: autoplay blocked").is_superseded());
    }

    #[test]
    fn test_bitrate_meter() {
        let mut meter = BitrateMeter::new();
        let t0 = Instant::now();
        assert_eq!(meter.sample_at(1_000, t0), 0);
        assert_eq!(meter.sample_at(126_000, t0 + Duration::from_secs(1)), 1_000_000);
        // counter reset (new track) yields 0 rather than a bogus value
        assert_eq!(meter.sample_at(10, t0 + Duration::from_secs(2)), 0);
    }
}
