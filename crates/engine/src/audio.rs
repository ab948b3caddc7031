//! Loopback audio capture for the client role.
//!
//! Captures the system output monitor, gates on short-term RMS so silent
//! frames never hit the wire, and encodes 20 ms Opus frames. Opus only
//! accepts the standard rates, so the monitor is opened at 48 kHz and
//! PulseAudio resamples whatever the device runs at.

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use libpulse_binding as pulse;
use libpulse_simple_binding::Simple;
use tracing::info;

/// Frames whose RMS (relative to full scale) is below this are dropped.
const RMS_GATE_THRESHOLD: f64 = 0.01;

pub struct AudioCapture {
    simple: Simple,
    opus_encoder: OpusEncoder,
    pcm_buffer: Vec<u8>,
    samples_buffer: Vec<i16>,
    opus_buffer: Vec<u8>,
}

impl AudioCapture {
    pub fn new(sample_rate: u32, channels: u16) -> anyhow::Result<Self> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: channels as u8,
            rate: sample_rate,
        };

        let samples_per_frame = (sample_rate * 20 / 1000) as usize;
        let frame_bytes = samples_per_frame * channels as usize * 2;

        let buf_attr = pulse::def::BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: frame_bytes as u32,
        };

        let simple = Simple::new(
            None,
            "airan",
            pulse::stream::Direction::Record,
            Some("@DEFAULT_MONITOR@"),
            "audio-capture",
            &spec,
            None,
            Some(&buf_attr),
        )
        .map_err(|e| anyhow::anyhow!("PulseAudio connection failed: {e}"))?;

        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => anyhow::bail!("unsupported channel count: {channels}"),
        };
        let opus_sample_rate = match sample_rate {
            48000 => SampleRate::Hz48000,
            24000 => SampleRate::Hz24000,
            16000 => SampleRate::Hz16000,
            _ => anyhow::bail!("unsupported sample rate for Opus: {sample_rate}"),
        };

        let mut opus_encoder =
            OpusEncoder::new(opus_sample_rate, opus_channels, Application::LowDelay)
                .map_err(|e| anyhow::anyhow!("creating Opus encoder: {e:?}"))?;
        opus_encoder
            .set_bitrate(Bitrate::BitsPerSecond(128_000))
            .map_err(|e| anyhow::anyhow!("setting Opus bitrate: {e:?}"))?;

        info!(sample_rate, channels, frame_bytes, "audio capture initialized");
        Ok(Self {
            simple,
            opus_encoder,
            pcm_buffer: vec![0u8; frame_bytes],
            samples_buffer: vec![0i16; samples_per_frame * channels as usize],
            opus_buffer: vec![0u8; 4000],
        })
    }

    /// Read 20 ms of PCM; returns the encoded Opus frame, or `None` when
    /// the frame is below the silence gate.
    pub fn capture_and_encode(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        self.simple
            .read(&mut self.pcm_buffer)
            .map_err(|e| anyhow::anyhow!("PulseAudio read failed: {e}"))?;

        for (i, chunk) in self.pcm_buffer.chunks_exact(2).enumerate() {
            self.samples_buffer[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
        }

        if rms_level(&self.samples_buffer) < RMS_GATE_THRESHOLD {
            return Ok(None);
        }

        let encoded_len = self
            .opus_encoder
            .encode(&self.samples_buffer, &mut self.opus_buffer)
            .map_err(|e| anyhow::anyhow!("Opus encode failed: {e:?}"))?;
        Ok(Some(self.opus_buffer[..encoded_len].to_vec()))
    }
}

/// RMS of a frame relative to i16 full scale, in [0, 1].
fn rms_level(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_below_gate() {
        let silence = vec![0i16; 960];
        assert!(rms_level(&silence) < RMS_GATE_THRESHOLD);
        // Low-level noise a monitor device emits at idle stays gated too.
        let hiss: Vec<i16> = (0..960).map(|i| if i % 2 == 0 { 40 } else { -40 }).collect();
        assert!(rms_level(&hiss) < RMS_GATE_THRESHOLD);
    }

    #[test]
    fn tone_is_above_gate() {
        // Quarter-scale square wave: RMS 0.25.
        let tone: Vec<i16> = (0..960)
            .map(|i| if i % 2 == 0 { 8192 } else { -8192 })
            .collect();
        let level = rms_level(&tone);
        assert!(level > RMS_GATE_THRESHOLD);
        assert!((level - 0.25).abs() < 0.01);
    }

    #[test]
    fn empty_frame_is_silent() {
        assert_eq!(rms_level(&[]), 0.0);
    }
}
