//! H.264 decoder for the controller role.
//!
//! Same hardware ladder as the encoder, decode side. Depacketized Annex-B
//! access units go in; RGB frames at native size come out through a
//! dropping channel. All recovery behavior lives in [`DecodeHealth`], a
//! plain state machine driven by injected clocks so the session loop owns
//! the actual timers.

use crate::codec::{Backend, CodecRegistry, DECODER_LADDER};
use crate::h264;
use anyhow::{bail, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::{ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A decoded frame, RGB24 at the stream's native size.
#[derive(Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for RgbFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub struct Decoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    _bus_watch: gst::bus::BusWatchGuard,
    backend: &'static Backend,
    ladder_position: usize,
    pipeline_error: Arc<AtomicBool>,
}

impl Decoder {
    /// Open the first working decode backend at or past `skip` rungs.
    /// Decoded frames are pushed into `frame_tx`; when the receiver lags,
    /// frames are dropped rather than queued.
    pub fn open(
        registry: &CodecRegistry,
        frame_tx: mpsc::Sender<RgbFrame>,
        skip: usize,
    ) -> Result<Self> {
        let mut position = skip;
        loop {
            let Some(backend) = registry.select(DECODER_LADDER, position) else {
                bail!("no H.264 decoder backend available (ladder exhausted)");
            };
            position = DECODER_LADDER
                .iter()
                .position(|b| b.id == backend.id)
                .unwrap_or(DECODER_LADDER.len() - 1);

            match Self::build(backend, position, frame_tx.clone()) {
                Ok(decoder) => {
                    info!(backend = backend.id, element = backend.element, "decoder pipeline started");
                    return Ok(decoder);
                }
                Err(e) => {
                    warn!(
                        backend = backend.id,
                        "decoder backend failed to open, trying next rung: {e:#}"
                    );
                    position += 1;
                }
            }
        }
    }

    fn build(
        backend: &'static Backend,
        ladder_position: usize,
        frame_tx: mpsc::Sender<RgbFrame>,
    ) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("creating appsrc")?;
        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("appsrc cast failed"))?;
        let src_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        appsrc.set_caps(Some(&src_caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);

        let parser = ElementFactory::make("h264parse")
            .build()
            .context("creating h264parse")?;
        let decoder = ElementFactory::make(backend.element)
            .build()
            .with_context(|| format!("creating {}", backend.element))?;
        // videoconvert downloads hardware surfaces and handles the
        // NV12/YUV420P to RGB conversion in one negotiated step.
        let convert = ElementFactory::make("videoconvert")
            .build()
            .context("creating videoconvert")?;
        let rgb_caps = gst::Caps::builder("video/x-raw").field("format", "RGB").build();
        let rgb_capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &rgb_caps)
            .build()
            .context("creating RGB capsfilter")?;

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

        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let caps = sample.caps().ok_or(FlowError::Error)?;
                    let info = gstreamer_video::VideoInfo::from_caps(caps)
                        .map_err(|_| FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    // Dropping channel: a slow consumer loses frames, it
                    // does not stall the decode pipeline.
                    let _ = frame_tx.try_send(RgbFrame {
                        width: info.width(),
                        height: info.height(),
                        data: map.to_vec(),
                    });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let elements = [
            appsrc.upcast_ref(),
            &parser,
            &decoder,
            &convert,
            &rgb_capsfilter,
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
                if let MessageView::Error(err) = msg.view() {
                    tracing::error!(
                        source = ?err.src().map(|s| s.name().to_string()),
                        error = %err.error(),
                        "decoder pipeline error"
                    );
                    error_flag.store(true, Ordering::Relaxed);
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
            _bus_watch: bus_watch,
            backend,
            ladder_position,
            pipeline_error,
        })
    }

    /// Feed one depacketized Annex-B access unit.
    pub fn push(&self, data: &[u8], timestamp_us: u64) -> Result<()> {
        let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
        {
            let buffer_mut = buffer
                .get_mut()
                .expect("freshly created buffer is uniquely owned");
            buffer_mut.set_pts(ClockTime::from_useconds(timestamp_us));
        }
        self.appsrc
            .push_buffer(buffer)
            .context("pushing access unit to decoder")?;
        Ok(())
    }

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

impl Drop for Decoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!(backend = self.backend.id, "decoder pipeline shut down");
    }
}

pub const EMPTY_FRAME_THRESHOLD: u32 = 5;
pub const DECODE_ERROR_THRESHOLD: u32 = 5;
pub const KEYFRAME_RETRY_AFTER: Duration = Duration::from_secs(2);
/// Cap on NALs held back while waiting for a keyframe.
pub const WAIT_BUFFER_CAP: usize = 5 * 1024 * 1024;

/// What to do with an incoming access unit while recovery state applies.
#[derive(Debug, PartialEq, Eq)]
pub enum Admit {
    /// Feed it to the decoder.
    Decode,
    /// Held back until a sync point arrives.
    Buffered,
}

/// Decode health: empty-frame and error counters, keyframe-request retry
/// arming, and the waiting-for-keyframe gate. The caller supplies `now` so
/// the 2 s retry and the decode-interval throttle are testable without real
/// timers.
#[derive(Debug)]
pub struct DecodeHealth {
    consecutive_empty: u32,
    decode_errors: u32,
    waiting_for_keyframe: bool,
    pending_request: Option<Instant>,
    wait_buffer_len: usize,
    last_decode_at: Option<Instant>,
}

impl DecodeHealth {
    pub fn new() -> Self {
        Self {
            consecutive_empty: 0,
            decode_errors: 0,
            waiting_for_keyframe: true,
            pending_request: None,
            wait_buffer_len: 0,
            last_decode_at: None,
        }
    }

    /// An empty frame arrived. Returns true when a keyframe request should
    /// be emitted (exactly once per threshold crossing).
    pub fn on_empty_frame(&mut self, now: Instant) -> bool {
        self.consecutive_empty += 1;
        if self.consecutive_empty >= EMPTY_FRAME_THRESHOLD {
            self.consecutive_empty = 0;
            self.arm_request(now);
            return true;
        }
        false
    }

    /// A decode attempt failed. Returns true when a keyframe request should
    /// be emitted.
    pub fn on_decode_error(&mut self, now: Instant) -> bool {
        self.decode_errors += 1;
        if self.decode_errors >= DECODE_ERROR_THRESHOLD && !self.waiting_for_keyframe {
            self.waiting_for_keyframe = true;
            self.arm_request(now);
            return true;
        }
        false
    }

    /// A frame decoded successfully: all counters reset, the retry timer
    /// disarms, and the keyframe gate opens.
    pub fn on_decoded(&mut self, now: Instant) {
        self.consecutive_empty = 0;
        self.decode_errors = 0;
        self.waiting_for_keyframe = false;
        self.pending_request = None;
        self.wait_buffer_len = 0;
        self.last_decode_at = Some(now);
    }

    /// The client acknowledged a keyframe request.
    pub fn on_keyframe_response(&mut self) {
        self.pending_request = None;
    }

    /// Gate an access unit on the waiting-for-keyframe state. Sync points
    /// (SPS/PPS/IDR) always pass and open the gate; anything else while
    /// waiting is held back, bounded by [`WAIT_BUFFER_CAP`].
    pub fn admit(&mut self, data: &[u8]) -> Admit {
        if !self.waiting_for_keyframe {
            return Admit::Decode;
        }
        if h264::contains_sync_point(data) {
            self.waiting_for_keyframe = false;
            self.wait_buffer_len = 0;
            return Admit::Decode;
        }
        self.wait_buffer_len += data.len();
        if self.wait_buffer_len > WAIT_BUFFER_CAP {
            debug!(buffered = self.wait_buffer_len, "keyframe wait buffer over cap, clearing");
            self.wait_buffer_len = 0;
        }
        Admit::Buffered
    }

    /// True when an unanswered keyframe request is due for a retry; re-arms
    /// the timer when it fires.
    pub fn retry_due(&mut self, now: Instant) -> bool {
        match self.pending_request {
            Some(sent) if now.duration_since(sent) >= KEYFRAME_RETRY_AFTER => {
                self.pending_request = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Error-driven decode throttle: 30 fps normally, 25 past 5 errors,
    /// 20 past 10. Returns true when this frame should be skipped.
    pub fn should_throttle(&mut self, now: Instant) -> bool {
        let min_interval = self.min_decode_interval();
        match self.last_decode_at {
            Some(last) if now.duration_since(last) < min_interval => true,
            _ => {
                self.last_decode_at = Some(now);
                false
            }
        }
    }

    pub fn min_decode_interval(&self) -> Duration {
        if self.decode_errors > 10 {
            Duration::from_millis(50)
        } else if self.decode_errors > 5 {
            Duration::from_millis(40)
        } else {
            Duration::from_millis(33)
        }
    }

    pub fn waiting_for_keyframe(&self) -> bool {
        self.waiting_for_keyframe
    }

    fn arm_request(&mut self, now: Instant) {
        self.pending_request = Some(now);
    }
}

impl Default for DecodeHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDR: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80, 0x40];
    const SLICE: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x61, 0x88, 0x80, 0x40];

    /// Five consecutive empty frames emit exactly one keyframe request.
    #[test]
    fn empty_frame_storm_requests_once() {
        let mut health = DecodeHealth::new();
        let t0 = Instant::now();
        let mut requests = 0;
        for _ in 0..5 {
            if health.on_empty_frame(t0) {
                requests += 1;
            }
        }
        assert_eq!(requests, 1);
        // The counter reset: four more empties stay quiet.
        for _ in 0..4 {
            assert!(!health.on_empty_frame(t0));
        }
        assert!(health.on_empty_frame(t0));
    }

    /// A successful decode within 2 s disarms the retry timer.
    #[test]
    fn valid_frame_cancels_retry() {
        let mut health = DecodeHealth::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            health.on_empty_frame(t0);
        }
        health.on_decoded(t0 + Duration::from_millis(500));
        assert!(!health.retry_due(t0 + Duration::from_secs(3)));
    }

    /// An unanswered request retries after 2 s, and keeps retrying on the
    /// same cadence.
    #[test]
    fn unanswered_request_retries() {
        let mut health = DecodeHealth::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            health.on_empty_frame(t0);
        }
        assert!(!health.retry_due(t0 + Duration::from_millis(1999)));
        assert!(health.retry_due(t0 + Duration::from_secs(2)));
        // Re-armed at t0+2s: next retry is due at t0+4s.
        assert!(!health.retry_due(t0 + Duration::from_secs(3)));
        assert!(health.retry_due(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn keyframe_response_disarms_retry() {
        let mut health = DecodeHealth::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            health.on_empty_frame(t0);
        }
        health.on_keyframe_response();
        assert!(!health.retry_due(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn waiting_gate_passes_sync_points_only() {
        let mut health = DecodeHealth::new();
        assert!(health.waiting_for_keyframe());
        assert_eq!(health.admit(&SLICE), Admit::Buffered);
        assert_eq!(health.admit(&IDR), Admit::Decode);
        assert!(!health.waiting_for_keyframe());
        // Gate open: plain slices decode.
        assert_eq!(health.admit(&SLICE), Admit::Decode);
    }

    #[test]
    fn decode_errors_rearm_waiting_and_request() {
        let mut health = DecodeHealth::new();
        let t0 = Instant::now();
        health.on_decoded(t0);
        let mut requested = false;
        for _ in 0..5 {
            requested |= health.on_decode_error(t0);
        }
        assert!(requested);
        assert!(health.waiting_for_keyframe());
    }

    #[test]
    fn error_rate_lowers_decode_rate() {
        let mut health = DecodeHealth::new();
        assert_eq!(health.min_decode_interval(), Duration::from_millis(33));
        let t0 = Instant::now();
        health.on_decoded(t0);
        for _ in 0..6 {
            health.on_decode_error(t0);
        }
        assert_eq!(health.min_decode_interval(), Duration::from_millis(40));
        for _ in 0..5 {
            health.on_decode_error(t0);
        }
        assert_eq!(health.min_decode_interval(), Duration::from_millis(50));
        health.on_decoded(t0 + Duration::from_secs(1));
        assert_eq!(health.min_decode_interval(), Duration::from_millis(33));
    }

    #[test]
    fn throttle_respects_interval() {
        let mut health = DecodeHealth::new();
        let t0 = Instant::now();
        assert!(!health.should_throttle(t0));
        assert!(health.should_throttle(t0 + Duration::from_millis(10)));
        assert!(!health.should_throttle(t0 + Duration::from_millis(40)));
    }

    #[test]
    fn wait_buffer_cap_clears() {
        let mut health = DecodeHealth::new();
        let big = vec![0u8; WAIT_BUFFER_CAP / 2 + 1];
        assert_eq!(health.admit(&big), Admit::Buffered);
        assert_eq!(health.admit(&big), Admit::Buffered);
        // Cap crossed inside the second call; internal length reset.
        assert_eq!(health.wait_buffer_len, 0);
        assert!(health.waiting_for_keyframe());
    }
}
