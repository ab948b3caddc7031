//! Codec backend selection shared by the encoder and decoder.
//!
//! The hardware ladder is an ordered list of backend identifiers mapped to
//! GStreamer element names. Probing an element is not free and both sides of
//! a session probe the same names, so results are memoized in a registry
//! that the coordinator passes into encoder and decoder construction. Tests
//! inject a fake probe.

use gstreamer as gst;
use gstreamer::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// One rung of the hardware ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    /// Stable identifier (matches the hwaccel naming used in logs/config).
    pub id: &'static str,
    /// GStreamer element implementing it.
    pub element: &'static str,
}

/// H.264 encoder ladder, tried in order; the last rung is software and is
/// expected to always instantiate.
pub const ENCODER_LADDER: &[Backend] = &[
    Backend { id: "nvenc", element: "nvh264enc" },
    Backend { id: "qsv", element: "msdkh264enc" },
    Backend { id: "amf", element: "amfh264enc" },
    Backend { id: "vaapi", element: "vah264enc" },
    Backend { id: "videotoolbox", element: "vtenc_h264" },
    Backend { id: "v4l2m2m", element: "v4l2h264enc" },
    Backend { id: "rkmpp", element: "mpph264enc" },
    Backend { id: "software", element: "x264enc" },
];

/// H.264 decoder ladder.
pub const DECODER_LADDER: &[Backend] = &[
    Backend { id: "cuda", element: "nvh264dec" },
    Backend { id: "d3d11va", element: "d3d11h264dec" },
    Backend { id: "qsv", element: "msdkh264dec" },
    Backend { id: "vaapi", element: "vah264dec" },
    Backend { id: "videotoolbox", element: "vtdec" },
    Backend { id: "v4l2m2m", element: "v4l2h264dec" },
    Backend { id: "rkmpp", element: "mppvideodec" },
    Backend { id: "software", element: "avdec_h264" },
];

pub type ProbeFn = dyn Fn(&str) -> bool + Send + Sync;

/// Process-wide probe cache: one instantiation attempt per element name.
pub struct CodecRegistry {
    probe: Box<ProbeFn>,
    cache: Mutex<HashMap<&'static str, bool>>,
}

impl CodecRegistry {
    /// Registry backed by real GStreamer element instantiation.
    pub fn new() -> Self {
        Self::with_probe(Box::new(can_instantiate))
    }

    /// Registry with an injected probe, for tests.
    pub fn with_probe(probe: Box<ProbeFn>) -> Self {
        Self {
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_available(&self, backend: &Backend) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&known) = cache.get(backend.element) {
            return known;
        }
        let available = (self.probe)(backend.element);
        cache.insert(backend.element, available);
        if available {
            info!(backend = backend.id, element = backend.element, "codec backend available");
        } else {
            debug!(backend = backend.id, element = backend.element, "codec backend not available");
        }
        available
    }

    /// Walk a ladder starting at `skip` rungs in and return the first rung
    /// that probes as available.
    pub fn select(&self, ladder: &'static [Backend], skip: usize) -> Option<&'static Backend> {
        ladder.iter().skip(skip).find(|b| self.is_available(b))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantiate the element to verify the backend actually works. The plugin
/// registry alone is not enough: the `.so` may be present with no usable
/// device behind it.
fn can_instantiate(name: &str) -> bool {
    match gst::ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

/// Default target bitrate in bits/s for an encode size and rate.
pub fn default_bitrate(width: u32, height: u32, fps: u32) -> u64 {
    (width as u64 * height as u64 * fps as u64) / 10
}

/// Clamp a requested bitrate to the sane band for the encode size:
/// `[W*H*fps*0.05, W*H*fps*0.5]` bits/s.
pub fn clamp_bitrate(requested: u64, width: u32, height: u32, fps: u32) -> u64 {
    let pixel_rate = width as u64 * height as u64 * fps as u64;
    let min = pixel_rate / 20;
    let max = pixel_rate / 2;
    requested.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ladder_falls_back_to_software() {
        let registry = CodecRegistry::with_probe(Box::new(|name| {
            name == "x264enc" || name == "avdec_h264"
        }));
        let enc = registry.select(ENCODER_LADDER, 0).unwrap();
        assert_eq!(enc.id, "software");
        let dec = registry.select(DECODER_LADDER, 0).unwrap();
        assert_eq!(dec.id, "software");
    }

    #[test]
    fn ladder_prefers_earlier_rungs() {
        let registry = CodecRegistry::with_probe(Box::new(|name| {
            name == "vah264enc" || name == "x264enc"
        }));
        let enc = registry.select(ENCODER_LADDER, 0).unwrap();
        assert_eq!(enc.id, "vaapi");
        // Skipping past the chosen rung advances to the next working one.
        let pos = ENCODER_LADDER.iter().position(|b| b.id == "vaapi").unwrap();
        let next = registry.select(ENCODER_LADDER, pos + 1).unwrap();
        assert_eq!(next.id, "software");
    }

    #[test]
    fn probe_results_are_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let registry = CodecRegistry::with_probe(Box::new(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
            false
        }));
        let nothing = registry.select(ENCODER_LADDER, 0);
        assert!(nothing.is_none());
        let first_pass = calls.load(Ordering::Relaxed);
        let _ = registry.select(ENCODER_LADDER, 0);
        assert_eq!(calls.load(Ordering::Relaxed), first_pass);
    }

    #[test]
    fn bitrate_band() {
        // 1920x1072 @ 15fps: pixel rate 30,873,600.
        let (w, h, fps) = (1920, 1072, 15);
        let rate = 1920u64 * 1072 * 15;
        assert_eq!(clamp_bitrate(0, w, h, fps), rate / 20);
        assert_eq!(clamp_bitrate(u64::MAX, w, h, fps), rate / 2);
        let mid = rate / 10;
        assert_eq!(clamp_bitrate(mid, w, h, fps), mid);
        assert_eq!(default_bitrate(w, h, fps), mid);
    }
}
