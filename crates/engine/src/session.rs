//! Session coordinator: one peer session plus its role-specific glue.
//!
//! The client path answers an incoming `connect`: it builds the peer,
//! streams the screen once the transport is up, executes input, and serves
//! file requests. The controller path is operator-initiated: it sends the
//! `connect`, decodes the incoming stream, forwards input, and drives file
//! transfers. Components never hold references to each other; everything is
//! wired here through channels and torn down in order.

use crate::capture::{primary_screen_size, CaptureWorker, EncodedFrame};
use crate::codec::{default_bitrate, CodecRegistry};
use crate::decoder::{Admit, DecodeHealth, Decoder, RgbFrame};
use crate::encoder::EncodeParams;
use crate::input::{keyframe_request, InputAction, InputExecutor, XTestSink};
use crate::peer::{PeerEvent, PeerOptions, PeerSession};
use crate::resolution::choose_encode_resolution;
use crate::signaling::SignalingHandle;
use crate::sos::SignalOfStop;
use crate::transfer::{
    collect_directory_files, dispatch_blob, list_directory, send_file_stream, DirectoryTracker,
    Reassembler, TransferOutcome, REASSEMBLY_TIMEOUT,
};
use airan_protocol::{
    Envelope, FileMessage, IceServerConfig, InputMessage, InputPayload, Role, TransferHeader,
    CHANNEL_FILE, CHANNEL_FILE_TEXT,
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared per-process context a session is built from.
#[derive(Clone)]
pub struct SessionConfig {
    pub local_id: String,
    pub local_pwd_md5: String,
    pub ice: IceServerConfig,
    /// Capture audio alongside video. Off by default; missing loopback
    /// devices disable it silently either way.
    pub audio_enabled: bool,
}

/// Operator commands routed to a controller session.
#[derive(Debug)]
pub enum SessionCommand {
    ListFiles { path: String },
    /// Ask the client to stream `path_cli` to `path_ctl` on this side.
    Download { path_cli: String, path_ctl: String },
    /// Push `path_ctl` from this side to `path_cli` on the client.
    Upload { path_ctl: String, path_cli: String },
    /// Forward a normalized input event (auth fields are filled in here).
    SendInput(InputPayload),
    /// Client role: change the capture rate without touching the encoder.
    SetCaptureFps(u32),
}

/// Lifecycle notices back to the engine.
#[derive(Debug)]
pub enum SessionNotice {
    Destroyed { remote_id: String },
    /// A data channel opened (controller side); operator commands that need
    /// the channel can flow now.
    ChannelReady {
        remote_id: String,
        label: &'static str,
    },
}

/// Consumer of decoded media on the controller side. The GUI collaborator
/// implements this; the default sink just counts.
pub trait FrameSink: Send + 'static {
    fn on_video(&mut self, frame: RgbFrame);
    fn on_audio(&mut self, _opus: &[u8]) {}
}

/// Headless sink: logs cadence so a session is observable without a UI.
#[derive(Default)]
pub struct LoggingFrameSink {
    frames: u64,
}

impl FrameSink for LoggingFrameSink {
    fn on_video(&mut self, frame: RgbFrame) {
        self.frames += 1;
        if self.frames == 1 || self.frames % 100 == 0 {
            info!(
                frames = self.frames,
                width = frame.width,
                height = frame.height,
                "decoded video frame"
            );
        }
    }
}

/// Handle the engine keeps per remote peer.
pub struct SessionHandle {
    pub remote_id: String,
    envelope_tx: mpsc::Sender<Envelope>,
    command_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn route_envelope(&self, envelope: Envelope) {
        if self.envelope_tx.send(envelope).await.is_err() {
            warn!(remote = %self.remote_id, "session gone, envelope dropped");
        }
    }

    pub async fn command(&self, command: SessionCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!(remote = %self.remote_id, "session gone, command dropped");
        }
    }
}

/// Parameters extracted from an incoming `connect` envelope.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub remote_id: String,
    pub fps: u32,
    pub is_only_file: bool,
    pub only_relay: bool,
    pub control_max: (i32, i32),
}

/// Operator-side parameters for starting a controller session.
#[derive(Debug, Clone)]
pub struct ControllerParams {
    pub remote_id: String,
    pub remote_pwd_md5: String,
    pub fps: u32,
    pub is_only_file: bool,
    pub only_relay: bool,
    pub adaptive_resolution: bool,
}

pub fn spawn_client(
    cfg: SessionConfig,
    params: ClientParams,
    registry: Arc<CodecRegistry>,
    signaling: SignalingHandle,
    notice_tx: mpsc::Sender<SessionNotice>,
    sos: SignalOfStop,
) -> SessionHandle {
    let (envelope_tx, envelope_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(16);
    let handle = SessionHandle {
        remote_id: params.remote_id.clone(),
        envelope_tx,
        command_tx,
    };
    tokio::spawn(async move {
        let remote_id = params.remote_id.clone();
        if let Err(e) = run_client(cfg, params, registry, signaling, envelope_rx, command_rx, sos).await
        {
            error!(remote = %remote_id, "client session ended with error: {e:#}");
        }
        let _ = notice_tx.send(SessionNotice::Destroyed { remote_id }).await;
    });
    handle
}

pub fn spawn_controller(
    cfg: SessionConfig,
    params: ControllerParams,
    registry: Arc<CodecRegistry>,
    signaling: SignalingHandle,
    frame_sink: Box<dyn FrameSink>,
    notice_tx: mpsc::Sender<SessionNotice>,
    sos: SignalOfStop,
) -> SessionHandle {
    let (envelope_tx, envelope_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(16);
    let handle = SessionHandle {
        remote_id: params.remote_id.clone(),
        envelope_tx,
        command_tx,
    };
    tokio::spawn(async move {
        let remote_id = params.remote_id.clone();
        if let Err(e) = run_controller(
            cfg,
            params,
            registry,
            signaling,
            frame_sink,
            envelope_rx,
            command_rx,
            notice_tx.clone(),
            sos,
        )
        .await
        {
            error!(remote = %remote_id, "controller session ended with error: {e:#}");
        }
        let _ = notice_tx.send(SessionNotice::Destroyed { remote_id }).await;
    });
    handle
}

/// Await on an optional receiver; absent receivers never yield.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Gate on the first IDR after the transport comes up. The remote decoder
/// cannot start on P-frames, so they are dropped until a keyframe passes;
/// if none arrives within half a second another one is forced, and after
/// several fruitless attempts the gate gives up rather than starve the
/// stream forever.
#[derive(Debug)]
struct IdrGate {
    waiting: bool,
    wait_started: Instant,
    attempts: u32,
}

/// What the send loop should do with one encoded frame.
#[derive(Debug, PartialEq, Eq)]
enum GateDecision {
    Send,
    Drop,
    /// Drop this frame and ask the encoder for a fresh IDR.
    DropAndForce,
}

const IDR_WAIT_PATIENCE: Duration = Duration::from_millis(500);
const IDR_WAIT_MAX_ATTEMPTS: u32 = 5;

impl IdrGate {
    fn new(now: Instant) -> Self {
        Self {
            waiting: true,
            wait_started: now,
            attempts: 0,
        }
    }

    fn on_frame(&mut self, is_keyframe: bool, now: Instant) -> GateDecision {
        if !self.waiting {
            return GateDecision::Send;
        }
        if is_keyframe {
            self.waiting = false;
            return GateDecision::Send;
        }
        if now.duration_since(self.wait_started) > IDR_WAIT_PATIENCE {
            self.attempts += 1;
            self.wait_started = now;
            if self.attempts > IDR_WAIT_MAX_ATTEMPTS {
                warn!(attempts = self.attempts, "no IDR produced, streaming P-frames anyway");
                self.waiting = false;
                return GateDecision::Send;
            }
            return GateDecision::DropAndForce;
        }
        GateDecision::Drop
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn forward_envelope(signaling: &SignalingHandle, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(json) => {
            if let Err(e) = signaling.send_text(json) {
                warn!("envelope not sent: {e:#}");
            }
        }
        Err(e) => error!("envelope serialization failed: {e}"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    cfg: SessionConfig,
    params: ClientParams,
    registry: Arc<CodecRegistry>,
    signaling: SignalingHandle,
    mut envelope_rx: mpsc::Receiver<Envelope>,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    sos: SignalOfStop,
) -> Result<()> {
    let fps = params.fps.clamp(1, 60);

    let local_screen = primary_screen_size().unwrap_or((1920, 1080));
    let (encode_width, encode_height) =
        choose_encode_resolution(local_screen, params.control_max);
    info!(
        remote = %params.remote_id,
        local = ?local_screen,
        encode_width,
        encode_height,
        fps,
        "client session starting"
    );

    let (peer_event_tx, mut peer_event_rx) = mpsc::channel::<PeerEvent>(256);
    let (peer_envelope_tx, mut peer_envelope_rx) = mpsc::channel::<Envelope>(64);
    let mut peer = PeerSession::new(
        Role::Cli,
        cfg.local_id.clone(),
        params.remote_id.clone(),
        &cfg.ice,
        PeerOptions {
            only_relay: params.only_relay,
            is_only_file: params.is_only_file,
            fps,
        },
        peer_event_tx,
        peer_envelope_tx,
    )
    .await?;
    peer.start().await?;
    let peer = Arc::new(peer);

    let mut capture: Option<CaptureWorker> = None;
    let mut encoded_rx: Option<mpsc::Receiver<EncodedFrame>> = None;
    let mut audio_rx: Option<mpsc::Receiver<Vec<u8>>> = None;
    let mut idr_gate: Option<IdrGate> = None;

    let mut executor: Option<InputExecutor<XTestSink>> = None;
    let mut reassembler = Reassembler::new(std::env::temp_dir(), REASSEMBLY_TIMEOUT);
    let mut upload_tracker = DirectoryTracker::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = sos.wait() => break,

            Some(envelope) = envelope_rx.recv() => {
                if let Err(e) = peer.on_signaling(envelope).await {
                    warn!("signaling apply failed: {e:#}");
                }
            }

            Some(envelope) = peer_envelope_rx.recv() => {
                forward_envelope(&signaling, &envelope);
            }

            Some(command) = command_rx.recv() => {
                match command {
                    SessionCommand::SetCaptureFps(new_fps) => {
                        if let Some(worker) = &capture {
                            worker.set_fps(new_fps);
                        }
                    }
                    other => debug!(?other, "command ignored by client session"),
                }
            }

            event = peer_event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    PeerEvent::Connected => {
                        info!(remote = %params.remote_id, "transport connected");
                        if !params.is_only_file && capture.is_none() {
                            let (encoded_tx, rx) = mpsc::channel::<EncodedFrame>(4);
                            let encode_params = EncodeParams {
                                capture_width: local_screen.0,
                                capture_height: local_screen.1,
                                encode_width,
                                encode_height,
                                fps,
                                bitrate: default_bitrate(encode_width, encode_height, fps),
                            };
                            match CaptureWorker::start(Arc::clone(&registry), encode_params, encoded_tx) {
                                Ok(worker) => {
                                    capture = Some(worker);
                                    encoded_rx = Some(rx);
                                    idr_gate = Some(IdrGate::new(Instant::now()));
                                }
                                Err(e) => error!("capture start failed: {e:#}"),
                            }
                            if cfg.audio_enabled {
                                audio_rx = start_audio_capture(&sos);
                            }
                            match XTestSink::open() {
                                Ok(sink) => {
                                    executor = Some(InputExecutor::new(
                                        cfg.local_id.clone(),
                                        cfg.local_pwd_md5.clone(),
                                        params.remote_id.clone(),
                                        sink,
                                    ));
                                }
                                Err(e) => warn!("input sink unavailable: {e:#}"),
                            }
                        }
                    }
                    PeerEvent::IceSelected { local, remote } => {
                        info!(local = %local, remote = %remote, "selected candidate pair");
                    }
                    PeerEvent::Disconnected | PeerEvent::Failed | PeerEvent::Closed => {
                        info!(remote = %params.remote_id, "transport lost, destroying session");
                        break;
                    }
                    PeerEvent::InputMessage(text) => {
                        handle_client_input(&text, &mut executor, &capture, &peer).await;
                    }
                    PeerEvent::FileTextMessage(text) => {
                        handle_client_file_text(&text, &peer, &mut upload_tracker).await;
                    }
                    PeerEvent::FileBinaryFragment(data) => {
                        match reassembler.ingest(CHANNEL_FILE, &data, Instant::now()) {
                            Ok(Some(blob)) => {
                                match dispatch_blob(&blob) {
                                    Ok(TransferOutcome::Upload { ok, path }) => {
                                        info!(ok, path = %path, "upload landed");
                                        let res = FileMessage::UploadRes {
                                            path_cli: path.clone(),
                                            status: ok,
                                            message: None,
                                        };
                                        if let Ok(json) = serde_json::to_string(&res) {
                                            let _ = peer.send_file_text(json).await;
                                        }
                                        if ok {
                                            if let Some(root) = upload_tracker.on_file_completed(&path) {
                                                info!(root = %root, "directory upload complete");
                                            }
                                        }
                                    }
                                    Ok(other) => debug!(?other, "unexpected blob on client"),
                                    Err(e) => warn!("blob dispatch failed: {e:#}"),
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("fragment rejected: {e:#}"),
                        }
                    }
                    PeerEvent::ChannelOpen(label) => {
                        if label == CHANNEL_FILE_TEXT {
                            // Seed the controller's file browser.
                            let listing = list_directory(airan_protocol::FOLDER_HOME);
                            if let Ok(json) = serde_json::to_string(&listing) {
                                let _ = peer.send_file_text(json).await;
                            }
                        }
                    }
                    PeerEvent::VideoFrame { .. } | PeerEvent::AudioFrame { .. } => {
                        // Send-only roles receive no media.
                    }
                }
            }

            Some(frame) = recv_opt(&mut encoded_rx) => {
                let decision = idr_gate
                    .as_mut()
                    .map(|gate| gate.on_frame(frame.is_keyframe, Instant::now()))
                    .unwrap_or(GateDecision::Send);
                match decision {
                    GateDecision::Send => {
                        if frame.is_keyframe {
                            debug!(timestamp_us = frame.timestamp_us, "sending IDR access unit");
                        }
                        if let Err(e) = peer.write_video_frame(frame.data, fps).await {
                            debug!("video frame not written: {e:#}");
                        }
                    }
                    GateDecision::Drop => {}
                    GateDecision::DropAndForce => {
                        debug!("still waiting for an IDR, forcing another");
                        if let Some(worker) = &capture {
                            worker.force_keyframe();
                        }
                    }
                }
            }

            Some(opus) = recv_opt(&mut audio_rx) => {
                if let Err(e) = peer.write_audio_frame(opus).await {
                    debug!("audio frame not written: {e:#}");
                }
            }

            _ = sweep.tick() => {
                if reassembler.evict_stale(Instant::now()) > 0 {
                    debug!(in_flight = reassembler.in_flight(CHANNEL_FILE), "stale reassemblies evicted");
                }
            }
        }
    }

    if let Some(worker) = capture.take() {
        worker.stop();
    }
    peer.close().await;
    info!(remote = %params.remote_id, "client session destroyed");
    Ok(())
}

async fn handle_client_input(
    text: &str,
    executor: &mut Option<InputExecutor<XTestSink>>,
    capture: &Option<CaptureWorker>,
    peer: &Arc<PeerSession>,
) {
    let Some(executor) = executor.as_mut() else {
        debug!("input before executor ready, dropped");
        return;
    };
    match executor.handle(text, now_ms()) {
        Ok(InputAction::None) => {}
        Ok(InputAction::ForceKeyframe { response }) => {
            if let Some(worker) = capture {
                worker.force_keyframe();
            }
            if let Ok(json) = serde_json::to_string(&response) {
                if let Err(e) = peer.send_input(json).await {
                    debug!("keyframe response not sent: {e:#}");
                }
            }
        }
        Err(e) => warn!("input message dropped: {e:#}"),
    }
}

async fn handle_client_file_text(
    text: &str,
    peer: &Arc<PeerSession>,
    upload_tracker: &mut DirectoryTracker,
) {
    let msg: FileMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("file text message unparsed: {e}");
            return;
        }
    };
    match msg {
        FileMessage::FileList { path, .. } => {
            let listing = list_directory(&path);
            if let Ok(json) = serde_json::to_string(&listing) {
                let _ = peer.send_file_text(json).await;
            }
        }
        // A download request: stream the client path back to the
        // controller.
        FileMessage::Download(header) if !header.directory_start && !header.directory_end => {
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                let local = PathBuf::from(&header.path_cli);
                if let Err(e) =
                    send_tree(&peer, TransferKind::Download, &local, &header.path_ctl).await
                {
                    warn!(path = %header.path_cli, "download send failed: {e:#}");
                    let err = FileMessage::Download(TransferHeader {
                        path_cli: header.path_cli.clone(),
                        path_ctl: header.path_ctl.clone(),
                        error: Some(format!("{e:#}")),
                        ..Default::default()
                    });
                    if let Ok(json) = serde_json::to_string(&err) {
                        let _ = peer.send_file_text(json).await;
                    }
                }
            });
        }
        FileMessage::Download(_) => {
            // Directory markers for downloads originate here; an echo is a
            // protocol hiccup, not actionable.
        }
        FileMessage::Upload(header) => {
            if header.directory_start {
                upload_tracker.on_directory_start(&header.path_cli);
            } else if header.directory_end {
                if let Some(root) =
                    upload_tracker.on_directory_end(&header.path_cli, header.file_count.unwrap_or(0))
                {
                    info!(root = %root, "directory upload complete");
                }
            }
            // Plain upload headers announce inbound binary data; nothing to
            // do until fragments arrive.
        }
        FileMessage::UploadRes { .. } => {
            // Controller-side message; ignore.
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_controller(
    cfg: SessionConfig,
    params: ControllerParams,
    registry: Arc<CodecRegistry>,
    signaling: SignalingHandle,
    mut frame_sink: Box<dyn FrameSink>,
    mut envelope_rx: mpsc::Receiver<Envelope>,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    notice_tx: mpsc::Sender<SessionNotice>,
    sos: SignalOfStop,
) -> Result<()> {
    // Step one of the controller path: the connect envelope, with the max
    // displayable area when adaptive resolution is on.
    let control_max = if params.adaptive_resolution {
        let screen = primary_screen_size().unwrap_or((1920, 1080));
        // Leave room for window chrome.
        (screen.0 as i32 - 20, screen.1 as i32 - 30)
    } else {
        (-1, -1)
    };
    let connect = Envelope::Connect {
        role: Role::Ctl,
        sender: cfg.local_id.clone(),
        receiver: params.remote_id.clone(),
        receiver_pwd: params.remote_pwd_md5.clone(),
        fps: params.fps,
        is_only_file: params.is_only_file,
        only_relay: params.only_relay,
        control_max_width: (control_max.0 >= 0).then_some(control_max.0),
        control_max_height: (control_max.1 >= 0).then_some(control_max.1),
    };
    forward_envelope(&signaling, &connect);
    info!(remote = %params.remote_id, ?control_max, "connect sent");

    let (peer_event_tx, mut peer_event_rx) = mpsc::channel::<PeerEvent>(256);
    let (peer_envelope_tx, mut peer_envelope_rx) = mpsc::channel::<Envelope>(64);
    let mut peer = PeerSession::new(
        Role::Ctl,
        cfg.local_id.clone(),
        params.remote_id.clone(),
        &cfg.ice,
        PeerOptions {
            only_relay: params.only_relay,
            is_only_file: params.is_only_file,
            fps: params.fps,
        },
        peer_event_tx,
        peer_envelope_tx,
    )
    .await?;
    peer.start().await?;
    let peer = Arc::new(peer);

    let (decoded_tx, decoded_rx) = mpsc::channel::<RgbFrame>(4);
    let mut decoded_rx = Some(decoded_rx);
    let mut decoder = if params.is_only_file {
        None
    } else {
        Some(Decoder::open(&registry, decoded_tx.clone(), 0)?)
    };
    let mut health = DecodeHealth::new();

    let mut reassembler = Reassembler::new(std::env::temp_dir(), REASSEMBLY_TIMEOUT);
    let mut download_tracker = DirectoryTracker::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(10));
    let mut retry = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = sos.wait() => break,

            Some(envelope) = envelope_rx.recv() => {
                if let Err(e) = peer.on_signaling(envelope).await {
                    warn!("signaling apply failed: {e:#}");
                }
            }

            Some(envelope) = peer_envelope_rx.recv() => {
                forward_envelope(&signaling, &envelope);
            }

            Some(command) = command_rx.recv() => {
                handle_controller_command(command, &cfg, &params, &peer).await;
            }

            event = peer_event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    PeerEvent::Connected => {
                        info!(remote = %params.remote_id, "transport connected");
                    }
                    PeerEvent::IceSelected { local, remote } => {
                        info!(local = %local, remote = %remote, "selected candidate pair");
                    }
                    PeerEvent::Disconnected | PeerEvent::Failed | PeerEvent::Closed => {
                        info!(remote = %params.remote_id, "transport lost, destroying session");
                        break;
                    }
                    PeerEvent::VideoFrame { data, info } => {
                        let now = Instant::now();
                        if data.is_empty() {
                            if health.on_empty_frame(now) {
                                send_keyframe_request(&cfg, &params, &peer).await;
                            }
                        } else if let Some(decoder_ref) = decoder.as_ref() {
                            // Keyframes are never throttled away; they are
                            // what recovery waits for.
                            let throttled = !info.is_keyframe && health.should_throttle(now);
                            if !throttled && health.admit(&data) == Admit::Decode {
                                if let Err(e) = decoder_ref.push(&data, info.timestamp_us) {
                                    debug!("decoder push failed: {e:#}");
                                    if health.on_decode_error(now) {
                                        send_keyframe_request(&cfg, &params, &peer).await;
                                    }
                                }
                            }
                        }
                    }
                    PeerEvent::AudioFrame { data, .. } => {
                        frame_sink.on_audio(&data);
                    }
                    PeerEvent::InputMessage(text) => {
                        if let Ok(msg) = serde_json::from_str::<InputMessage>(&text) {
                            if matches!(msg.payload, InputPayload::KeyframeResponse { .. }) {
                                debug!("keyframe request acknowledged");
                                health.on_keyframe_response();
                            }
                        }
                    }
                    PeerEvent::FileTextMessage(text) => {
                        handle_controller_file_text(&text, &mut download_tracker);
                    }
                    PeerEvent::FileBinaryFragment(data) => {
                        match reassembler.ingest(CHANNEL_FILE, &data, Instant::now()) {
                            Ok(Some(blob)) => match dispatch_blob(&blob) {
                                Ok(TransferOutcome::Download { ok, path }) => {
                                    info!(ok, path = %path, "download landed");
                                    if ok {
                                        if let Some(root) = download_tracker.on_file_completed(&path) {
                                            info!(root = %root, "directory download complete");
                                        }
                                    }
                                }
                                Ok(other) => debug!(?other, "unexpected blob on controller"),
                                Err(e) => warn!("blob dispatch failed: {e:#}"),
                            },
                            Ok(None) => {}
                            Err(e) => warn!("fragment rejected: {e:#}"),
                        }
                    }
                    PeerEvent::ChannelOpen(label) => {
                        debug!(label, "channel ready");
                        let _ = notice_tx
                            .send(SessionNotice::ChannelReady {
                                remote_id: params.remote_id.clone(),
                                label,
                            })
                            .await;
                    }
                }
            }

            Some(frame) = recv_opt(&mut decoded_rx) => {
                health.on_decoded(Instant::now());
                frame_sink.on_video(frame);
            }

            _ = retry.tick() => {
                let now = Instant::now();
                if health.retry_due(now) {
                    info!("keyframe request unanswered, retrying");
                    send_keyframe_request(&cfg, &params, &peer).await;
                }
                // A dead decode pipeline falls one rung down the ladder.
                let failed = decoder
                    .as_ref()
                    .filter(|d| d.has_error())
                    .map(|d| (d.backend_id(), d.next_ladder_position()));
                if let Some((backend, skip)) = failed {
                    warn!(backend, "decoder failed, falling back");
                    match Decoder::open(&registry, decoded_tx.clone(), skip) {
                        Ok(next) => {
                            decoder = Some(next);
                            health = DecodeHealth::new();
                            send_keyframe_request(&cfg, &params, &peer).await;
                        }
                        Err(e) => {
                            error!("decoder fallback exhausted: {e:#}");
                            decoder = None;
                        }
                    }
                }
            }

            _ = sweep.tick() => {
                reassembler.evict_stale(Instant::now());
            }
        }
    }

    peer.close().await;
    info!(remote = %params.remote_id, "controller session destroyed");
    Ok(())
}

async fn send_keyframe_request(
    cfg: &SessionConfig,
    params: &ControllerParams,
    peer: &Arc<PeerSession>,
) {
    let request = keyframe_request(
        &cfg.local_id,
        &params.remote_id,
        &params.remote_pwd_md5,
        now_ms(),
    );
    match serde_json::to_string(&request) {
        Ok(json) => {
            if let Err(e) = peer.send_input(json).await {
                debug!("keyframe request not sent: {e:#}");
            } else {
                info!("keyframe request sent");
            }
        }
        Err(e) => error!("keyframe request serialization failed: {e}"),
    }
}

async fn handle_controller_command(
    command: SessionCommand,
    cfg: &SessionConfig,
    params: &ControllerParams,
    peer: &Arc<PeerSession>,
) {
    match command {
        SessionCommand::ListFiles { path } => {
            let msg = FileMessage::FileList {
                path,
                folder_files: Vec::new(),
                mounted: Vec::new(),
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                if let Err(e) = peer.send_file_text(json).await {
                    warn!("file list request not sent: {e:#}");
                }
            }
        }
        SessionCommand::Download { path_cli, path_ctl } => {
            let msg = FileMessage::Download(TransferHeader {
                path_cli,
                path_ctl,
                ..Default::default()
            });
            if let Ok(json) = serde_json::to_string(&msg) {
                if let Err(e) = peer.send_file_text(json).await {
                    warn!("download request not sent: {e:#}");
                }
            }
        }
        SessionCommand::Upload { path_ctl, path_cli } => {
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                let local = PathBuf::from(&path_ctl);
                if let Err(e) = send_tree(&peer, TransferKind::Upload, &local, &path_cli).await {
                    warn!(path = %path_ctl, "upload failed: {e:#}");
                }
            });
        }
        SessionCommand::SendInput(payload) => {
            let msg = InputMessage {
                sender: cfg.local_id.clone(),
                receiver: params.remote_id.clone(),
                receiver_pwd: params.remote_pwd_md5.clone(),
                payload,
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                if let Err(e) = peer.send_input(json).await {
                    debug!("input not sent: {e:#}");
                }
            }
        }
        SessionCommand::SetCaptureFps(_) => {
            debug!("capture fps command ignored by controller session");
        }
    }
}

fn handle_controller_file_text(text: &str, download_tracker: &mut DirectoryTracker) {
    let msg: FileMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("file text message unparsed: {e}");
            return;
        }
    };
    match msg {
        FileMessage::FileList { path, folder_files, .. } => {
            info!(path = %path, entries = folder_files.len(), "file listing received");
        }
        FileMessage::UploadRes { path_cli, status, .. } => {
            info!(path = %path_cli, ok = status, "upload result");
        }
        FileMessage::Download(header) => {
            if let Some(error) = header.error {
                warn!(path = %header.path_cli, error = %error, "client reported download failure");
            } else if header.directory_start {
                download_tracker.on_directory_start(&header.path_ctl);
            } else if header.directory_end {
                if let Some(root) = download_tracker
                    .on_directory_end(&header.path_ctl, header.file_count.unwrap_or(0))
                {
                    info!(root = %root, "directory download complete");
                }
            }
        }
        FileMessage::Upload(_) => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    /// Client → controller: blob targets `path_ctl`.
    Download,
    /// Controller → client: blob targets `path_cli`.
    Upload,
}

/// Send one file or a whole directory tree. Directories frame their files
/// with start/end markers on the text channel; files travel as fragment
/// streams on the binary channel.
async fn send_tree(
    peer: &Arc<PeerSession>,
    kind: TransferKind,
    local: &Path,
    remote: &str,
) -> Result<()> {
    let meta = tokio::fs::metadata(local)
        .await
        .with_context(|| format!("stat {}", local.display()))?;

    if meta.is_file() {
        return send_one_file(peer, kind, local, remote, true).await;
    }
    if !meta.is_dir() {
        anyhow::bail!("{} is neither file nor directory", local.display());
    }

    let start = directory_marker(kind, local, remote, true, None);
    peer.send_file_text(serde_json::to_string(&start)?).await?;

    let files = collect_directory_files(local)?;
    let mut sent: u64 = 0;
    for (abs, rel) in &files {
        let remote_path = join_remote(remote, rel);
        send_one_file(peer, kind, abs, &remote_path, false).await?;
        sent += 1;
    }

    let end = directory_marker(kind, local, remote, false, Some(sent));
    peer.send_file_text(serde_json::to_string(&end)?).await?;
    info!(dir = %local.display(), files = sent, "directory sent");
    Ok(())
}

async fn send_one_file(
    peer: &Arc<PeerSession>,
    kind: TransferKind,
    local: &Path,
    remote: &str,
    append_name: bool,
) -> Result<()> {
    let meta = tokio::fs::metadata(local)
        .await
        .with_context(|| format!("stat {}", local.display()))?;
    let file_name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let remote_path = if append_name && !remote.ends_with(&file_name) {
        join_remote(remote, Path::new(&file_name))
    } else {
        remote.to_string()
    };

    let local_str = local.to_string_lossy().into_owned();
    let header = match kind {
        TransferKind::Download => FileMessage::Download(TransferHeader {
            path_cli: local_str,
            path_ctl: remote_path,
            file_size: meta.len() as i64,
            ..Default::default()
        }),
        TransferKind::Upload => FileMessage::Upload(TransferHeader {
            path_ctl: local_str,
            path_cli: remote_path,
            file_size: meta.len() as i64,
            ..Default::default()
        }),
    };

    let (frag_tx, mut frag_rx) = mpsc::channel::<Vec<u8>>(32);
    let pump_peer = Arc::clone(peer);
    let pump = tokio::spawn(async move {
        while let Some(frame) = frag_rx.recv().await {
            pump_peer.send_file_binary(frame).await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let sent = send_file_stream(local, &header, &frag_tx).await;
    drop(frag_tx);
    let pumped = pump.await.context("fragment pump crashed")?;
    sent?;
    pumped?;
    Ok(())
}

fn directory_marker(
    kind: TransferKind,
    local: &Path,
    remote: &str,
    start: bool,
    file_count: Option<u64>,
) -> FileMessage {
    let local_str = local.to_string_lossy().into_owned();
    let header = TransferHeader {
        is_directory: true,
        directory_start: start,
        directory_end: !start,
        file_count,
        ..Default::default()
    };
    match kind {
        TransferKind::Download => FileMessage::Download(TransferHeader {
            path_cli: local_str,
            path_ctl: remote.to_string(),
            ..header
        }),
        TransferKind::Upload => FileMessage::Upload(TransferHeader {
            path_ctl: local_str,
            path_cli: remote.to_string(),
            ..header
        }),
    }
}

fn join_remote(root: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    if root.ends_with('/') || root.ends_with('\\') {
        format!("{root}{rel}")
    } else {
        format!("{root}/{rel}")
    }
}

/// Audio capture on its own thread, silently absent when no loopback device
/// exists.
fn start_audio_capture(sos: &SignalOfStop) -> Option<mpsc::Receiver<Vec<u8>>> {
    let mut capture = match crate::audio::AudioCapture::new(48000, 2) {
        Ok(capture) => capture,
        Err(e) => {
            warn!("audio capture unavailable, continuing without audio: {e:#}");
            return None;
        }
    };
    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    let sos = sos.clone();
    std::thread::Builder::new()
        .name("audio-capture".into())
        .spawn(move || {
            info!("audio capture thread started");
            loop {
                if sos.cancelled() {
                    return;
                }
                match capture.capture_and_encode() {
                    Ok(Some(opus)) => {
                        if tx.blocking_send(opus).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {} // Gated silence.
                    Err(e) => {
                        error!("audio capture error: {e:#}");
                        return;
                    }
                }
            }
        })
        .ok()?;
    Some(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idr_gate_waits_for_keyframe() {
        let t0 = Instant::now();
        let mut gate = IdrGate::new(t0);
        assert_eq!(gate.on_frame(false, t0), GateDecision::Drop);
        assert_eq!(gate.on_frame(false, t0 + Duration::from_millis(100)), GateDecision::Drop);
        assert_eq!(gate.on_frame(true, t0 + Duration::from_millis(200)), GateDecision::Send);
        // Gate open: everything flows.
        assert_eq!(gate.on_frame(false, t0 + Duration::from_millis(300)), GateDecision::Send);
    }

    #[test]
    fn idr_gate_forces_after_patience() {
        let t0 = Instant::now();
        let mut gate = IdrGate::new(t0);
        assert_eq!(
            gate.on_frame(false, t0 + Duration::from_millis(600)),
            GateDecision::DropAndForce
        );
        // Patience window restarts from the forced request.
        assert_eq!(
            gate.on_frame(false, t0 + Duration::from_millis(700)),
            GateDecision::Drop
        );
        assert_eq!(
            gate.on_frame(false, t0 + Duration::from_millis(1200)),
            GateDecision::DropAndForce
        );
    }

    #[test]
    fn idr_gate_gives_up_eventually() {
        let t0 = Instant::now();
        let mut gate = IdrGate::new(t0);
        let mut now = t0;
        let mut last = GateDecision::Drop;
        for _ in 0..IDR_WAIT_MAX_ATTEMPTS {
            now += Duration::from_millis(600);
            last = gate.on_frame(false, now);
        }
        assert_eq!(last, GateDecision::DropAndForce);
        // One more fruitless window and the gate opens for P-frames.
        now += Duration::from_millis(600);
        assert_eq!(gate.on_frame(false, now), GateDecision::Send);
        assert!(!gate.waiting);
    }

    #[test]
    fn remote_path_join() {
        assert_eq!(join_remote("/dst", Path::new("a.txt")), "/dst/a.txt");
        assert_eq!(join_remote("/dst/", Path::new("a.txt")), "/dst/a.txt");
        assert_eq!(
            join_remote("C:\\dst\\", Path::new("a.txt")),
            "C:\\dst\\a.txt"
        );
        assert_eq!(join_remote("/dst", Path::new("sub/a.txt")), "/dst/sub/a.txt");
    }

    #[test]
    fn directory_markers_carry_paths_and_counts() {
        let start = directory_marker(
            TransferKind::Download,
            Path::new("/data/photos"),
            "/home/op/photos",
            true,
            None,
        );
        match start {
            FileMessage::Download(h) => {
                assert!(h.directory_start);
                assert!(!h.directory_end);
                assert_eq!(h.path_cli, "/data/photos");
                assert_eq!(h.path_ctl, "/home/op/photos");
            }
            other => panic!("expected Download, got {other:?}"),
        }

        let end = directory_marker(
            TransferKind::Upload,
            Path::new("/src"),
            "/dst",
            false,
            Some(3),
        );
        match end {
            FileMessage::Upload(h) => {
                assert!(h.directory_end);
                assert_eq!(h.file_count, Some(3));
                assert_eq!(h.path_ctl, "/src");
                assert_eq!(h.path_cli, "/dst");
            }
            other => panic!("expected Upload, got {other:?}"),
        }
    }
}
