//! One WebRTC peer connection with one remote party.
//!
//! The client role owns the send side: H.264 + Opus tracks and the three
//! data channels, and it makes the offer. The controller role owns the
//! receive side: recvonly transceivers whose RTP is depacketized through
//! the library's H.264 sample builder, and data channels it adopts when the
//! client's arrive.

use airan_protocol::{
    Envelope, IceServerConfig, Role, CHANNEL_FILE, CHANNEL_FILE_TEXT, CHANNEL_INPUT, STREAM_VIDEO,
    TRACK_AUDIO, TRACK_VIDEO,
};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Per-frame metadata travelling with media payloads.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub timestamp_us: u64,
    pub is_keyframe: bool,
}

/// Everything a peer session reports to its coordinator.
#[derive(Debug)]
pub enum PeerEvent {
    Connected,
    Disconnected,
    Failed,
    Closed,
    IceSelected { local: String, remote: String },
    /// Depacketized Annex-B access unit from the remote video track.
    VideoFrame { data: Bytes, info: FrameInfo },
    /// Opus frame from the remote audio track.
    AudioFrame { data: Bytes, info: FrameInfo },
    /// Text frame on the input channel.
    InputMessage(String),
    /// Text frame on the file-text channel.
    FileTextMessage(String),
    /// Binary fragment on the file channel.
    FileBinaryFragment(Bytes),
    /// A data channel opened, by label.
    ChannelOpen(&'static str),
}

/// Session-level options extracted from the `connect` envelope / operator
/// request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerOptions {
    pub only_relay: bool,
    pub is_only_file: bool,
    pub fps: u32,
}

/// The ICE server set: one STUN plus TURN over UDP and TCP, all on the
/// configured host. `only_relay` drops STUN and forces relay candidates.
pub fn build_ice_servers(cfg: &IceServerConfig, only_relay: bool) -> Vec<RTCIceServer> {
    if cfg.host.is_empty() {
        // No ICE infrastructure configured: host candidates only.
        return Vec::new();
    }
    let stun = RTCIceServer {
        urls: vec![format!("stun:{}:{}", cfg.host, cfg.port)],
        ..Default::default()
    };
    let turn_udp = RTCIceServer {
        urls: vec![format!("turn:{}:{}?transport=udp", cfg.host, cfg.port)],
        username: cfg.username.clone(),
        credential: cfg.password.clone(),
        ..Default::default()
    };
    let turn_tcp = RTCIceServer {
        urls: vec![format!("turn:{}:{}?transport=tcp", cfg.host, cfg.port)],
        username: cfg.username.clone(),
        credential: cfg.password.clone(),
        ..Default::default()
    };
    if only_relay {
        vec![turn_udp, turn_tcp]
    } else {
        vec![stun, turn_udp, turn_tcp]
    }
}

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct PeerSession {
    role: Role,
    local_id: String,
    remote_id: String,
    options: PeerOptions,
    pc: Arc<RTCPeerConnection>,
    video_track: Option<Arc<TrackLocalStaticSample>>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    input_channel: SharedChannel,
    file_channel: SharedChannel,
    file_text_channel: SharedChannel,
    event_tx: mpsc::Sender<PeerEvent>,
    envelope_tx: mpsc::Sender<Envelope>,
    destroyed: Arc<AtomicBool>,
}

impl PeerSession {
    pub async fn new(
        role: Role,
        local_id: String,
        remote_id: String,
        ice: &IceServerConfig,
        options: PeerOptions,
        event_tx: mpsc::Sender<PeerEvent>,
        envelope_tx: mpsc::Sender<Envelope>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine)?;

        let mut registry = Registry::new();
        // Default interceptors carry the send-side RTCP machinery: sender
        // reports and the NACK responder on the H.264 track.
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: build_ice_servers(ice, options.only_relay),
            ice_transport_policy: if options.only_relay {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        info!(?role, remote = %remote_id, only_relay = options.only_relay, "peer connection created");

        Ok(Self {
            role,
            local_id,
            remote_id,
            options,
            pc,
            video_track: None,
            audio_track: None,
            input_channel: Arc::new(Mutex::new(None)),
            file_channel: Arc::new(Mutex::new(None)),
            file_text_channel: Arc::new(Mutex::new(None)),
            event_tx,
            envelope_tx,
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Role-specific setup. The client creates tracks and channels and
    /// offers; the controller prepares receive slots and waits for the
    /// offer.
    pub async fn start(&mut self) -> Result<()> {
        self.wire_connection_callbacks();
        match self.role {
            Role::Cli => self.start_client().await,
            Role::Ctl => self.start_controller().await,
            Role::Server => bail!("server is not a peer role"),
        }
    }

    async fn start_client(&mut self) -> Result<()> {
        if !self.options.is_only_file {
            let video_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    ..Default::default()
                },
                TRACK_VIDEO.to_string(),
                STREAM_VIDEO.to_string(),
            ));
            self.pc
                .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("adding video track")?;
            self.video_track = Some(video_track);

            let audio_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                TRACK_AUDIO.to_string(),
                TRACK_AUDIO.to_string(),
            ));
            self.pc
                .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("adding audio track")?;
            self.audio_track = Some(audio_track);

            let input = self.create_channel(CHANNEL_INPUT).await?;
            self.adopt_channel(input).await;
        }

        let file = self.create_channel(CHANNEL_FILE).await?;
        self.adopt_channel(file).await;
        let file_text = self.create_channel(CHANNEL_FILE_TEXT).await?;
        self.adopt_channel(file_text).await;

        // Offer with trickle ICE: the SDP goes out immediately, candidates
        // follow as they are gathered.
        let offer = self.pc.create_offer(None).await.context("creating offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("setting local offer")?;
        self.envelope_tx
            .send(Envelope::Offer {
                role: Role::Cli,
                sender: self.local_id.clone(),
                receiver: self.remote_id.clone(),
                data: offer.sdp,
            })
            .await
            .ok();
        info!(remote = %self.remote_id, "offer sent");
        Ok(())
    }

    async fn start_controller(&mut self) -> Result<()> {
        if !self.options.is_only_file {
            for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                self.pc
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .context("adding recvonly transceiver")?;
            }
            self.wire_track_receivers();
        }
        self.wire_incoming_channels();
        Ok(())
    }

    /// Apply a signaling envelope addressed to this session.
    pub async fn on_signaling(&self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Offer { data, .. } => {
                if self.role != Role::Ctl {
                    bail!("client received an offer");
                }
                let offer = RTCSessionDescription::offer(data).context("parsing offer SDP")?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .context("setting remote offer")?;
                let answer = self.pc.create_answer(None).await.context("creating answer")?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .context("setting local answer")?;
                self.envelope_tx
                    .send(Envelope::Answer {
                        role: Role::Ctl,
                        sender: self.local_id.clone(),
                        receiver: self.remote_id.clone(),
                        data: answer.sdp,
                    })
                    .await
                    .ok();
                info!(remote = %self.remote_id, "answer sent");
            }
            Envelope::Answer { data, .. } => {
                if self.role != Role::Cli {
                    bail!("controller received an answer");
                }
                let answer = RTCSessionDescription::answer(data).context("parsing answer SDP")?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .context("setting remote answer")?;
            }
            Envelope::Candidate { data, mid, .. } => {
                self.pc
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: data,
                        sdp_mid: Some(mid),
                        ..Default::default()
                    })
                    .await
                    .context("adding remote candidate")?;
                debug!(remote = %self.remote_id, "remote candidate added");
            }
            other => debug!(?other, "envelope ignored by peer session"),
        }
        Ok(())
    }

    fn wire_connection_callbacks(&self) {
        let event_tx = self.event_tx.clone();
        let destroyed = Arc::clone(&self.destroyed);
        let pc_for_pair = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                if destroyed.load(Ordering::Acquire) {
                    return Box::pin(async {});
                }
                let event_tx = event_tx.clone();
                let pc_for_pair = pc_for_pair.clone();
                Box::pin(async move {
                    info!(?state, "peer connection state changed");
                    let event = match state {
                        RTCPeerConnectionState::Connected => {
                            if let Some(pc) = pc_for_pair.upgrade() {
                                if let Some(pair) = selected_candidate_pair(&pc).await {
                                    let _ = event_tx
                                        .send(PeerEvent::IceSelected {
                                            local: pair.0,
                                            remote: pair.1,
                                        })
                                        .await;
                                }
                            }
                            Some(PeerEvent::Connected)
                        }
                        RTCPeerConnectionState::Disconnected => Some(PeerEvent::Disconnected),
                        RTCPeerConnectionState::Failed => Some(PeerEvent::Failed),
                        RTCPeerConnectionState::Closed => Some(PeerEvent::Closed),
                        _ => None,
                    };
                    if let Some(event) = event {
                        let _ = event_tx.send(event).await;
                    }
                })
            }));

        // Trickle: every gathered candidate goes straight out as an
        // envelope.
        let envelope_tx = self.envelope_tx.clone();
        let destroyed = Arc::clone(&self.destroyed);
        let role = self.role;
        let sender = self.local_id.clone();
        let receiver = self.remote_id.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if destroyed.load(Ordering::Acquire) {
                return Box::pin(async {});
            }
            let envelope_tx = envelope_tx.clone();
            let sender = sender.clone();
            let receiver = receiver.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = envelope_tx
                                .send(Envelope::Candidate {
                                    role,
                                    sender,
                                    receiver,
                                    data: json.candidate,
                                    mid: json.sdp_mid.unwrap_or_default(),
                                })
                                .await;
                        }
                        Err(e) => warn!("serializing candidate failed: {e}"),
                    }
                }
            })
        }));
    }

    /// Controller side: read RTP off remote tracks through the library
    /// depacketizers and surface full access units / Opus frames.
    fn wire_track_receivers(&self) {
        let event_tx = self.event_tx.clone();
        let destroyed = Arc::clone(&self.destroyed);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let event_tx = event_tx.clone();
            let destroyed = Arc::clone(&destroyed);
            Box::pin(async move {
                let kind = track.kind();
                info!(?kind, id = track.id(), "remote track arrived");
                match kind {
                    RTPCodecType::Video => {
                        tokio::spawn(read_video_track(track, event_tx, destroyed));
                    }
                    RTPCodecType::Audio => {
                        tokio::spawn(read_audio_track(track, event_tx, destroyed));
                    }
                    _ => {}
                }
            })
        }));
    }

    /// Controller side: adopt the client-created data channels as they
    /// open.
    fn wire_incoming_channels(&self) {
        let event_tx = self.event_tx.clone();
        let destroyed = Arc::clone(&self.destroyed);
        let input_slot = Arc::clone(&self.input_channel);
        let file_slot = Arc::clone(&self.file_channel);
        let file_text_slot = Arc::clone(&self.file_text_channel);

        self.pc.on_data_channel(Box::new(move |dc| {
            let event_tx = event_tx.clone();
            let destroyed = Arc::clone(&destroyed);
            let input_slot = Arc::clone(&input_slot);
            let file_slot = Arc::clone(&file_slot);
            let file_text_slot = Arc::clone(&file_text_slot);
            Box::pin(async move {
                let label = dc.label().to_string();
                info!(label = %label, "data channel arrived");
                let slot = match label.as_str() {
                    CHANNEL_INPUT => input_slot,
                    CHANNEL_FILE => file_slot,
                    CHANNEL_FILE_TEXT => file_text_slot,
                    _ => {
                        warn!(label = %label, "unknown data channel ignored");
                        return;
                    }
                };
                *slot.lock().await = Some(Arc::clone(&dc));
                wire_channel_callbacks(dc, event_tx, destroyed);
            })
        }));
    }

    async fn create_channel(&self, label: &'static str) -> Result<Arc<RTCDataChannel>> {
        // Reliable and ordered is the data-channel default; stated
        // explicitly because the transfer protocol depends on it.
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("creating data channel {label}"))?;
        info!(label, "data channel created");
        Ok(dc)
    }

    async fn adopt_channel(&self, dc: Arc<RTCDataChannel>) {
        let slot = match dc.label() {
            CHANNEL_INPUT => &self.input_channel,
            CHANNEL_FILE => &self.file_channel,
            CHANNEL_FILE_TEXT => &self.file_text_channel,
            _ => return,
        };
        *slot.lock().await = Some(Arc::clone(&dc));
        wire_channel_callbacks(dc, self.event_tx.clone(), Arc::clone(&self.destroyed));
    }

    pub async fn send_input(&self, msg: String) -> Result<()> {
        send_text_on(&self.input_channel, msg).await
    }

    pub async fn send_file_text(&self, msg: String) -> Result<()> {
        send_text_on(&self.file_text_channel, msg).await
    }

    pub async fn send_file_binary(&self, fragment: Vec<u8>) -> Result<()> {
        let guard = self.file_channel.lock().await;
        let Some(dc) = guard.as_ref() else {
            bail!("file channel not open");
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            bail!("file channel not open");
        }
        dc.send(&Bytes::from(fragment))
            .await
            .context("sending file fragment")?;
        Ok(())
    }

    /// Client side: push one encoded access unit onto the video track.
    pub async fn write_video_frame(&self, data: Vec<u8>, fps: u32) -> Result<()> {
        let Some(track) = self.video_track.as_ref() else {
            bail!("no video track on this session");
        };
        track
            .write_sample(&Sample {
                data: Bytes::from(data),
                duration: Duration::from_micros(1_000_000 / fps.max(1) as u64),
                ..Default::default()
            })
            .await
            .context("writing video sample")?;
        Ok(())
    }

    pub async fn write_audio_frame(&self, data: Vec<u8>) -> Result<()> {
        let Some(track) = self.audio_track.as_ref() else {
            bail!("no audio track on this session");
        };
        track
            .write_sample(&Sample {
                data: Bytes::from(data),
                duration: Duration::from_millis(20),
                ..Default::default()
            })
            .await
            .context("writing audio sample")?;
        Ok(())
    }

    /// Ordered teardown: input, file, file-text, audio, video, peer. The
    /// destroyed flag mutes every callback first so nothing fires into a
    /// dying session.
    pub async fn close(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pc.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));

        for slot in [&self.input_channel, &self.file_channel, &self.file_text_channel] {
            let dc = slot.lock().await.take();
            if let Some(dc) = dc {
                let _ = dc.close().await;
            }
        }
        // Tracks have no explicit close; dropping the peer connection stops
        // their senders. Audio before video, per the teardown order.
        let _ = self.pc.close().await;
        info!(remote = %self.remote_id, "peer session destroyed");
    }
}

fn register_codecs(media_engine: &mut MediaEngine) -> Result<()> {
    let h264_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
    ];
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: h264_feedback,
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(())
}

fn wire_channel_callbacks(
    dc: Arc<RTCDataChannel>,
    event_tx: mpsc::Sender<PeerEvent>,
    destroyed: Arc<AtomicBool>,
) {
    let label: &'static str = match dc.label() {
        CHANNEL_INPUT => CHANNEL_INPUT,
        CHANNEL_FILE => CHANNEL_FILE,
        CHANNEL_FILE_TEXT => CHANNEL_FILE_TEXT,
        _ => return,
    };

    {
        let event_tx = event_tx.clone();
        let destroyed = Arc::clone(&destroyed);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if !destroyed.load(Ordering::Acquire) {
                    info!(label, "data channel open");
                    let _ = event_tx.send(PeerEvent::ChannelOpen(label)).await;
                }
            })
        }));
    }

    dc.on_message(Box::new(move |msg| {
        if destroyed.load(Ordering::Acquire) {
            return Box::pin(async {});
        }
        let event_tx = event_tx.clone();
        Box::pin(async move {
            let event = match label {
                CHANNEL_INPUT => {
                    if msg.is_string {
                        String::from_utf8(msg.data.to_vec())
                            .ok()
                            .map(PeerEvent::InputMessage)
                    } else {
                        None
                    }
                }
                CHANNEL_FILE_TEXT => {
                    if msg.is_string {
                        String::from_utf8(msg.data.to_vec())
                            .ok()
                            .map(PeerEvent::FileTextMessage)
                    } else {
                        warn!("binary frame on the text file channel ignored");
                        None
                    }
                }
                CHANNEL_FILE => {
                    if msg.is_string {
                        warn!("text frame on the binary file channel ignored");
                        None
                    } else {
                        Some(PeerEvent::FileBinaryFragment(msg.data))
                    }
                }
                _ => None,
            };
            if let Some(event) = event {
                let _ = event_tx.send(event).await;
            }
        })
    }));
}

async fn send_text_on(slot: &SharedChannel, msg: String) -> Result<()> {
    let guard = slot.lock().await;
    let Some(dc) = guard.as_ref() else {
        bail!("channel not open");
    };
    if dc.ready_state() != RTCDataChannelState::Open {
        bail!("channel not open");
    }
    dc.send_text(msg).await.context("sending text frame")?;
    Ok(())
}

async fn selected_candidate_pair(pc: &Arc<RTCPeerConnection>) -> Option<(String, String)> {
    let pair = pc
        .sctp()
        .transport()
        .ice_transport()
        .get_selected_candidate_pair()
        .await?;
    Some((
        format!("{}:{}", pair.local.address, pair.local.port),
        format!("{}:{}", pair.remote.address, pair.remote.port),
    ))
}

/// RTP 90 kHz clock to microseconds.
fn rtp_video_timestamp_us(rtp_timestamp: u32) -> u64 {
    (rtp_timestamp as u64) * 1000 / 90
}

async fn read_video_track(
    track: Arc<TrackRemote>,
    event_tx: mpsc::Sender<PeerEvent>,
    destroyed: Arc<AtomicBool>,
) {
    // The library depacketizer reassembles FU-A/STAP-A into Annex-B access
    // units; 128 packets of reorder tolerance.
    let mut builder = SampleBuilder::new(128, H264Packet::default(), 90000);
    loop {
        if destroyed.load(Ordering::Acquire) {
            break;
        }
        match track.read_rtp().await {
            Ok((packet, _)) => {
                let rtp_timestamp = packet.header.timestamp;
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    let data = sample.data;
                    let info = FrameInfo {
                        timestamp_us: rtp_video_timestamp_us(rtp_timestamp),
                        is_keyframe: crate::h264::contains_idr(&data),
                    };
                    if event_tx.send(PeerEvent::VideoFrame { data, info }).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("video track read ended: {e}");
                break;
            }
        }
    }
}

async fn read_audio_track(
    track: Arc<TrackRemote>,
    event_tx: mpsc::Sender<PeerEvent>,
    destroyed: Arc<AtomicBool>,
) {
    let mut builder = SampleBuilder::new(32, OpusPacket::default(), 48000);
    loop {
        if destroyed.load(Ordering::Acquire) {
            break;
        }
        match track.read_rtp().await {
            Ok((packet, _)) => {
                let rtp_timestamp = packet.header.timestamp;
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    let info = FrameInfo {
                        // 48 kHz clock.
                        timestamp_us: (rtp_timestamp as u64) * 1000 / 48,
                        is_keyframe: false,
                    };
                    if event_tx
                        .send(PeerEvent::AudioFrame { data: sample.data, info })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("audio track read ended: {e}");
                break;
            }
        }
    }
}
