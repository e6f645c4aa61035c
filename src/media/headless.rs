//! Headless video surface
//!
//! Drains RTP from the attached stream's video track while playing and
//! derives the frame size from VP8 key frames. Nothing is decoded.

use super::{MediaStream, PlaybackError, VideoSurface};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// VP8 payload descriptor and key frame header parsing (RFC 7741 / RFC 6386)
pub mod vp8 {
    /// Frame size carried by a VP8 key frame starting in this RTP payload
    pub fn keyframe_size(payload: &[u8]) -> Option<(u32, u32)> {
        let header_len = descriptor_length(payload)?;
        let first = payload[0];
        let start_of_partition = (first & 0x10) != 0;
        let partition_id = first & 0x07;
        if !start_of_partition || partition_id != 0 {
            return None;
        }

        let frame = payload.get(header_len..)?;
        if frame.len() < 10 {
            return None;
        }
        // P bit clear marks a key frame
        if (frame[0] & 0x01) != 0 {
            return None;
        }
        if frame[3..6] != [0x9d, 0x01, 0x2a] {
            return None;
        }
        let width = u16::from_le_bytes([frame[6], frame[7]]) & 0x3fff;
        let height = u16::from_le_bytes([frame[8], frame[9]]) & 0x3fff;
        if width == 0 || height == 0 {
            return None;
        }
        Some((width as u32, height as u32))
    }

    /// Length of the VP8 payload descriptor
    pub fn descriptor_length(payload: &[u8]) -> Option<usize> {
        let first = *payload.first()?;
        let mut len = 1;

        // X: extended control bits present
        if (first & 0x80) != 0 {
            let ext = *payload.get(len)?;
            len += 1;
            // I: picture id, 7 or 15 bits
            if (ext & 0x80) != 0 {
                let pid = *payload.get(len)?;
                len += if (pid & 0x80) != 0 { 2 } else { 1 };
            }
            // L: TL0PICIDX
            if (ext & 0x40) != 0 {
                len += 1;
            }
            // T or K: TID/KEYIDX byte
            if (ext & 0x30) != 0 {
                len += 1;
            }
        }

        if payload.len() < len {
            return None;
        }
        Some(len)
    }
}

/// Surface that consumes video without rendering it
pub struct HeadlessSurface {
    src: Option<MediaStream>,
    playing: bool,
    size: Arc<Mutex<(u32, u32)>>,
    packets: Arc<AtomicU64>,
    reader: Option<JoinHandle<()>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self {
            src: None,
            playing: false,
            size: Arc::new(Mutex::new((0, 0))),
            packets: Arc::new(AtomicU64::new(0)),
            reader: None,
        }
    }

    /// RTP packets consumed since creation
    pub fn packets_received(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    fn start_reader(&mut self, stream: MediaStream) {
        self.stop_reader();
        let size = self.size.clone();
        let packets = self.packets.clone();
        self.reader = Some(tokio::spawn(drain(stream, size, packets)));
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Default for HeadlessSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[async_trait]
impl VideoSurface for HeadlessSurface {
    fn src_object(&self) -> Option<MediaStream> {
        self.src.clone()
    }

    fn set_src_object(&mut self, stream: Option<MediaStream>) {
        self.stop_reader();
        self.src = stream;
        match self.src.clone() {
            Some(stream) if self.playing => self.start_reader(stream),
            Some(_) => {}
            None => *self.size.lock() = (0, 0),
        }
    }

    fn pause(&mut self) {
        self.playing = false;
        self.stop_reader();
    }

    async fn play(&mut self) -> Result<(), PlaybackError> {
        let stream = self
            .src
            .clone()
            .ok_or_else(|| PlaybackError::new("The element has no supported sources"))?;
        if stream.video_tracks().is_empty() {
            return Err(PlaybackError::new("The attached stream has no video track"));
        }
        self.playing = true;
        self.start_reader(stream);
        info!("Headless surface playing");
        Ok(())
    }

    fn load(&mut self) {
        self.stop_reader();
        self.playing = false;
        *self.size.lock() = (0, 0);
    }

    fn video_size(&self) -> (u32, u32) {
        *self.size.lock()
    }
}

async fn drain(stream: MediaStream, size: Arc<Mutex<(u32, u32)>>, packets: Arc<AtomicU64>) {
    let mut changes = stream.subscribe();
    loop {
        let track = stream.video_tracks().into_iter().find(|t| t.is_live());
        let Some(track) = track else {
            if changes.changed().await.is_err() {
                return;
            }
            continue;
        };

        let sniff_vp8 = track
            .mime_type()
            .map(|m| m.eq_ignore_ascii_case("video/vp8"))
            .unwrap_or(false);
        debug!("Headless surface reading track {} ({:?})", track.id(), track.mime_type());

        loop {
            tokio::select! {
                packet = track.read_rtp() => match packet {
                    Some(packet) => {
                        packets.fetch_add(1, Ordering::Relaxed);
                        if sniff_vp8 {
                            if let Some(dims) = vp8::keyframe_size(&packet.payload) {
                                let mut current = size.lock();
                                if *current != dims {
                                    debug!("Video size {}x{}", dims.0, dims.1);
                                    *current = dims;
                                }
                            }
                        }
                    }
                    None => {
                        if changes.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                },
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
