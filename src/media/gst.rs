//! GStreamer video surface
//!
//! Received RTP is pushed into
//! `appsrc ! rtpjitterbuffer ! <depay> ! decodebin ! videoconvert ! autovideosink`.

use super::{MediaStream, MediaTrack, PlaybackError, VideoSurface};
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use webrtc::util::Marshal;

/// RTP encoding name and depayloader element for a video MIME type
fn depayloader_for(mime: &str) -> Result<(&'static str, &'static str), PlaybackError> {
    match mime.to_ascii_lowercase().as_str() {
        "video/vp8" => Ok(("VP8", "rtpvp8depay")),
        "video/vp9" => Ok(("VP9", "rtpvp9depay")),
        "video/h264" => Ok(("H264", "rtph264depay")),
        other => Err(PlaybackError::new(format!("Unsupported codec: {}", other))),
    }
}

struct Pipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    convert: gst::Element,
}

impl Pipeline {
    fn build(track: &MediaTrack) -> Result<Self, PlaybackError> {
        gst::init().map_err(|e| PlaybackError::new(format!("GStreamer init failed: {}", e)))?;

        let (encoding, depay_name) = depayloader_for(track.mime_type().unwrap_or("video/VP8"))?;

        let caps = gst::Caps::builder("application/x-rtp")
            .field("media", "video")
            .field("encoding-name", encoding)
            .field("clock-rate", 90000i32)
            .field("payload", track.payload_type().unwrap_or(96) as i32)
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("rtpsrc")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .do_timestamp(true)
            .build();

        let jitter = make_element("rtpjitterbuffer")?;
        let depay = make_element(depay_name)?;
        let decode = make_element("decodebin")?;
        let convert = make_element("videoconvert")?;
        let sink = make_element("autovideosink")?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([appsrc.upcast_ref(), &jitter, &depay, &decode, &convert, &sink])
            .map_err(|e| PlaybackError::new(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([appsrc.upcast_ref(), &jitter, &depay, &decode])
            .map_err(|e| PlaybackError::new(format!("Failed to link decoder chain: {}", e)))?;
        convert
            .link(&sink)
            .map_err(|e| PlaybackError::new(format!("convert->sink: {}", e)))?;

        let convert_weak = convert.downgrade();
        decode.connect_pad_added(move |_, src_pad| {
            let Some(convert) = convert_weak.upgrade() else {
                return;
            };
            let Some(sink_pad) = convert.static_pad("sink") else {
                return;
            };
            if sink_pad.is_linked() {
                return;
            }
            if let Err(e) = src_pad.link(&sink_pad) {
                warn!("Failed to link decoded pad: {:?}", e);
            }
        });

        info!("Built GStreamer pipeline for {} (depay {})", encoding, depay_name);
        Ok(Self {
            pipeline,
            appsrc,
            convert,
        })
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        let caps = self.convert.static_pad("src")?.current_caps()?;
        let info = gst_video::VideoInfo::from_caps(&caps).ok()?;
        Some((info.width(), info.height()))
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn make_element(name: &str) -> Result<gst::Element, PlaybackError> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| PlaybackError::new(format!("Failed to create {}: {}", name, e)))
}

/// Surface that decodes and displays video in a native window
pub struct GstSurface {
    src: Option<MediaStream>,
    pipeline: Option<Pipeline>,
    feeder: Option<JoinHandle<()>>,
}

impl GstSurface {
    pub fn new() -> Self {
        Self {
            src: None,
            pipeline: None,
            feeder: None,
        }
    }

    fn stop_feeder(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }

    fn teardown(&mut self) {
        self.stop_feeder();
        self.pipeline = None;
    }
}

impl Default for GstSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GstSurface {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[async_trait]
impl VideoSurface for GstSurface {
    fn src_object(&self) -> Option<MediaStream> {
        self.src.clone()
    }

    fn set_src_object(&mut self, stream: Option<MediaStream>) {
        self.teardown();
        self.src = stream;
    }

    fn pause(&mut self) {
        if let Some(ref pipeline) = self.pipeline {
            if let Err(e) = pipeline.pipeline.set_state(gst::State::Paused) {
                warn!("Failed to pause pipeline: {}", e);
            }
        }
    }

    async fn play(&mut self) -> Result<(), PlaybackError> {
        let stream = self
            .src
            .clone()
            .ok_or_else(|| PlaybackError::new("The element has no supported sources"))?;

        if self.pipeline.is_none() {
            let track = stream
                .video_tracks()
                .into_iter()
                .next()
                .ok_or_else(|| PlaybackError::new("The attached stream has no video track"))?;
            self.pipeline = Some(Pipeline::build(&track)?);
        }

        if let Some(ref pipeline) = self.pipeline {
            if self.feeder.is_none() {
                let appsrc = pipeline.appsrc.clone();
                self.feeder = Some(tokio::spawn(feed(stream, appsrc)));
            }
            pipeline
                .pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| PlaybackError::new(format!("Failed to start pipeline: {}", e)))?;
        }
        Ok(())
    }

    fn load(&mut self) {
        self.teardown();
    }

    fn video_size(&self) -> (u32, u32) {
        self.pipeline
            .as_ref()
            .and_then(|p| p.frame_size())
            .unwrap_or((0, 0))
    }
}

async fn feed(stream: MediaStream, appsrc: gst_app::AppSrc) {
    let mut changes = stream.subscribe();
    loop {
        let track = stream.video_tracks().into_iter().find(|t| t.is_live());
        let Some(track) = track else {
            if changes.changed().await.is_err() {
                return;
            }
            continue;
        };
        debug!("GStreamer surface feeding track {}", track.id());

        loop {
            tokio::select! {
                packet = track.read_rtp() => match packet {
                    Some(packet) => {
                        let bytes = match packet.marshal() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                debug!("RTP marshal failed: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = appsrc.push_buffer(gst::Buffer::from_slice(bytes)) {
                            debug!("appsrc push failed: {:?}", e);
                            return;
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
