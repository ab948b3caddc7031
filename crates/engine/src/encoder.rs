//! H.264 encoder for the client role.
//!
//! Walks the hardware ladder and falls back to software; the chosen backend
//! is then fixed for the session. Output is an Annex-B byte stream with
//! SPS/PPS inlined ahead of every IDR (`h264parse config-interval=-1`, which
//! also converts any AVCC-emitting backend to byte-stream form).

use crate::codec::{clamp_bitrate, Backend, CodecRegistry, ENCODER_LADDER};
use anyhow::{bail, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::{ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{debug, info, warn};

/// Dimensions and rate the encoder is fixed to for a session.
#[derive(Debug, Clone, Copy)]
pub struct EncodeParams {
    /// Capture (input) size.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Negotiated encode size (already 16-aligned and even).
    pub encode_width: u32,
    pub encode_height: u32,
    pub fps: u32,
    /// Target bitrate in bits/s; clamped to the sane band for the size.
    pub bitrate: u64,
}

pub struct Encoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    _bus_watch: gst::bus::BusWatchGuard,
    backend: &'static Backend,
    /// Index of the chosen rung, so a mid-session failure can resume the
    /// ladder one rung further down.
    ladder_position: usize,
    pipeline_error: Arc<AtomicBool>,
    /// Serializes encode() against force_key_frame()-driven event injection.
    push_lock: Mutex<()>,
    force_key: AtomicBool,
    frame_count: AtomicU64,
    /// Robustness IDR cadence: one forced keyframe every `2*fps` frames on
    /// top of the encoder's own GOP.
    forced_idr_interval: u64,
}

impl Encoder {
    /// Open the first working backend at or past `skip` rungs of the ladder.
    pub fn open(registry: &CodecRegistry, params: EncodeParams, skip: usize) -> Result<Self> {
        let mut position = skip;
        loop {
            let Some(backend) = registry.select(ENCODER_LADDER, position) else {
                bail!("no H.264 encoder backend available (ladder exhausted)");
            };
            position = ENCODER_LADDER
                .iter()
                .position(|b| b.id == backend.id)
                .unwrap_or(ENCODER_LADDER.len() - 1);

            match Self::build(backend, position, params) {
                Ok(encoder) => {
                    info!(
                        backend = backend.id,
                        element = backend.element,
                        width = params.encode_width,
                        height = params.encode_height,
                        fps = params.fps,
                        "encoder pipeline started"
                    );
                    return Ok(encoder);
                }
                Err(e) => {
                    warn!(
                        backend = backend.id,
                        "encoder backend failed to open, trying next rung: {e:#}"
                    );
                    position += 1;
                }
            }
        }
    }

    fn build(backend: &'static Backend, ladder_position: usize, params: EncodeParams) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("creating appsrc")?;
        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("appsrc cast failed"))?;

        // X11 depth-24 TrueColor captures as 4 bytes/pixel with a padding
        // byte: BGRx.
        let src_caps = gst::Caps::builder("video/x-raw")
            .field("format", "BGRx")
            .field("width", params.capture_width as i32)
            .field("height", params.capture_height as i32)
            .field("framerate", gst::Fraction::new(params.fps as i32, 1))
            .build();
        appsrc.set_caps(Some(&src_caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // block=false: a stalled backend must not hang the capture thread.
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);

        let convert = ElementFactory::make("videoconvert")
            .build()
            .context("creating videoconvert")?;
        let scale = ElementFactory::make("videoscale")
            .build()
            .context("creating videoscale")?;

        // NV12 at the negotiated encode size is what every rung of the
        // ladder accepts from system memory.
        let encode_caps = gst::Caps::builder("video/x-raw")
            .field("format", "NV12")
            .field("width", params.encode_width as i32)
            .field("height", params.encode_height as i32)
            .build();
        let encode_capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &encode_caps)
            .build()
            .context("creating encode capsfilter")?;

        let encoder = build_encoder_element(backend, params)?;

        let profile_caps = gst::Caps::builder("video/x-h264")
            .field("profile", "constrained-baseline")
            .build();
        let profile_capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &profile_caps)
            .build()
            .context("creating profile capsfilter")?;

        // config-interval=-1 inlines SPS/PPS with every IDR; byte-stream/au
        // caps force Annex-B access units whatever the backend emits.
        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .context("creating h264parse")?;
        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .name("parse-caps")
            .property("caps", &parse_caps)
            .build()
            .context("creating h264parse output capsfilter")?;

        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 2u32)
            .property("drop", true)
            .build()
            .context("creating appsink")?;
        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink cast failed"))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let elements = [
            appsrc.upcast_ref(),
            &convert,
            &scale,
            &encode_capsfilter,
            &encoder,
            &profile_capsfilter,
            &parser,
            &parse_capsfilter,
            appsink.upcast_ref(),
        ];
        pipeline.add_many(elements).context("adding pipeline elements")?;
        gst::Element::link_many(elements).context("linking pipeline elements")?;

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline.bus().context("pipeline has no bus")?;
        let bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        tracing::error!(
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            "encoder pipeline error"
                        );
                        error_flag.store(true, Ordering::Relaxed);
                    }
                    MessageView::Warning(w) => {
                        tracing::warn!(warning = %w.error(), "encoder pipeline warning");
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("adding bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("setting pipeline to Playing")?;

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx: Mutex::new(encoded_rx),
            _bus_watch: bus_watch,
            backend,
            ladder_position,
            pipeline_error,
            push_lock: Mutex::new(()),
            force_key: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            forced_idr_interval: (2 * params.fps).max(1) as u64,
        })
    }

    /// Push one captured BGRx frame. `timestamp_us` must be strictly
    /// increasing; it becomes the buffer PTS and later the RTP timestamp.
    pub fn encode(&self, frame: Vec<u8>, timestamp_us: u64) -> Result<()> {
        let _serialized = self.push_lock.lock().unwrap_or_else(|e| e.into_inner());

        let count = self.frame_count.fetch_add(1, Ordering::Relaxed);
        let periodic_idr = count != 0 && count % self.forced_idr_interval == 0;
        if self.force_key.swap(false, Ordering::Relaxed) || periodic_idr || count == 0 {
            let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            self.appsrc.send_event(event);
            debug!(frame = count, periodic = periodic_idr, "IDR forced");
        }

        let mut buffer = gst::Buffer::from_mut_slice(frame);
        {
            let buffer_mut = buffer
                .get_mut()
                .expect("freshly created buffer is uniquely owned");
            buffer_mut.set_pts(ClockTime::from_useconds(timestamp_us));
        }
        self.appsrc
            .push_buffer(buffer)
            .context("pushing buffer to appsrc")?;
        Ok(())
    }

    /// Request an IDR on the next `encode` call (keyframe request path).
    pub fn force_key_frame(&self) {
        self.force_key.store(true, Ordering::Relaxed);
    }

    /// Drain one encoded access unit if the backend has produced one.
    pub fn pull_encoded(&self) -> Result<Option<Vec<u8>>> {
        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.try_recv() {
            Ok(data) => Ok(Some(data)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => bail!("encoder pipeline disconnected"),
        }
    }

    /// True once the pipeline has reported a fatal error; the owner should
    /// reopen the ladder from [`Self::next_ladder_position`].
    pub fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::Relaxed)
    }

    pub fn backend_id(&self) -> &'static str {
        self.backend.id
    }

    pub fn next_ladder_position(&self) -> usize {
        self.ladder_position + 1
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!(backend = self.backend.id, "encoder pipeline shut down");
    }
}

/// Instantiate and tune one ladder rung. Property names differ per element;
/// anything unknown gets the generic bitrate/GOP treatment guarded by
/// property lookup.
fn build_encoder_element(backend: &'static Backend, params: EncodeParams) -> Result<gst::Element> {
    let bitrate_bps = clamp_bitrate(
        params.bitrate,
        params.encode_width,
        params.encode_height,
        params.fps,
    );
    let bitrate_kbps = (bitrate_bps / 1000).max(1) as u32;
    let gop = params.fps.max(1);

    let elem = match backend.element {
        "nvh264enc" => ElementFactory::make(backend.element)
            .property_from_str("preset", "low-latency-hq")
            .property("bitrate", bitrate_kbps)
            .property("gop-size", gop as i32)
            .property("zerolatency", true)
            .property("bframes", 0u32)
            .build()
            .context("creating nvh264enc")?,
        "vah264enc" => ElementFactory::make(backend.element)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate_kbps)
            .property("key-int-max", gop)
            .build()
            .context("creating vah264enc")?,
        "x264enc" => ElementFactory::make(backend.element)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate_kbps)
            .property("key-int-max", gop)
            .property("bframes", 0u32)
            .build()
            .context("creating x264enc")?,
        other => {
            let elem = ElementFactory::make(other)
                .build()
                .with_context(|| format!("creating {other}"))?;
            if elem.find_property("bitrate").is_some() {
                elem.set_property("bitrate", bitrate_kbps);
            }
            if elem.find_property("key-int-max").is_some() {
                elem.set_property("key-int-max", gop);
            } else if elem.find_property("gop-size").is_some() {
                elem.set_property("gop-size", gop as i32);
            }
            if elem.find_property("b-frames").is_some() {
                elem.set_property("b-frames", 0u32);
            }
            elem
        }
    };
    Ok(elem)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The caps strings the pipeline is built from; colorimetry must stay
    /// out of the raw caps (it leaks VUI colour description into the SPS,
    /// which some decoders reject).
    #[test]
    fn raw_caps_have_no_colorimetry() {
        gst::init().unwrap();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "BGRx")
            .field("width", 1920i32)
            .field("height", 1080i32)
            .field("framerate", gst::Fraction::new(15, 1))
            .build();
        assert!(!caps.to_string().contains("colorimetry"));
    }

    #[test]
    fn parse_caps_request_annex_b_access_units() {
        gst::init().unwrap();
        let caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let s = caps.to_string();
        assert!(s.contains("byte-stream"));
        assert!(s.contains("au"));
    }
}
