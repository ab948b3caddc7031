mod audio;
mod capture;
mod codec;
mod decoder;
mod encoder;
mod h264;
mod identity;
mod input;
mod instance;
mod peer;
mod resolution;
mod session;
mod signaling;
mod sos;
mod transfer;

use crate::codec::CodecRegistry;
use crate::identity::{pwd_md5, Identity};
use crate::session::{
    ClientParams, ControllerParams, LoggingFrameSink, SessionCommand, SessionConfig,
    SessionHandle, SessionNotice,
};
use crate::signaling::{SignalingEvent, SignalingHandle, DEFAULT_HEARTBEAT_INTERVAL};
use crate::sos::SignalOfStop;
use airan_protocol::{EngineConfig, Envelope, Role, CHANNEL_FILE_TEXT};
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

struct Args {
    config_path: String,
    /// Controller mode: connect to this remote peer.
    connect: Option<String>,
    /// Plain password for the remote peer (controller mode).
    remote_pwd: String,
    only_file: bool,
    only_relay: bool,
    adaptive: bool,
    /// Commands issued once the file-text channel opens.
    startup_commands: Vec<SessionCommand>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = "config.toml".to_string();
    let mut connect = None;
    let mut remote_pwd = String::new();
    let mut only_file = false;
    let mut only_relay = false;
    let mut adaptive = true;
    let mut startup_commands = Vec::new();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = args.get(i).context("missing --config value")?.clone();
            }
            "--connect" => {
                i += 1;
                connect = Some(args.get(i).context("missing --connect value")?.clone());
            }
            "--pwd" => {
                i += 1;
                remote_pwd = args.get(i).context("missing --pwd value")?.clone();
            }
            "--only-file" => only_file = true,
            "--only-relay" => only_relay = true,
            "--no-adaptive" => adaptive = false,
            "--list" => {
                i += 1;
                startup_commands.push(SessionCommand::ListFiles {
                    path: args.get(i).context("missing --list value")?.clone(),
                });
            }
            "--download" => {
                let path_cli = args.get(i + 1).context("missing --download remote path")?.clone();
                let path_ctl = args.get(i + 2).context("missing --download local path")?.clone();
                i += 2;
                startup_commands.push(SessionCommand::Download { path_cli, path_ctl });
            }
            "--upload" => {
                let path_ctl = args.get(i + 1).context("missing --upload local path")?.clone();
                let path_cli = args.get(i + 2).context("missing --upload remote path")?.clone();
                i += 2;
                startup_commands.push(SessionCommand::Upload { path_ctl, path_cli });
            }
            other => bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    if connect.is_some() && remote_pwd.is_empty() {
        bail!("--connect requires --pwd");
    }

    Ok(Args {
        config_path,
        connect,
        remote_pwd,
        only_file,
        only_relay,
        adaptive,
        startup_commands,
    })
}

fn load_config(path: &str) -> anyhow::Result<EngineConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).with_context(|| format!("parsing {path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(e) => Err(e).with_context(|| format!("reading {path}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    // One engine per host; a second instance exits cleanly.
    let Some(_instance_lock) = instance::acquire()? else {
        eprintln!("airan is already running");
        return Ok(());
    };

    let config = load_config(&args.config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.local.log_filter())),
        )
        .init();

    gstreamer::init().context("initializing GStreamer")?;

    if config.signal_server.ws_url.is_empty() {
        bail!("signal_server.wsUrl is not configured");
    }

    let identity = Identity::load(&config.local.local_pwd)?;
    if identity.local_pwd != config.local.local_pwd {
        // A password was generated; persist it so restarts keep it.
        let mut updated = config.clone();
        updated.local.local_pwd = identity.local_pwd.clone();
        match toml::to_string_pretty(&updated) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&args.config_path, text) {
                    warn!("generated password not persisted: {e}");
                }
            }
            Err(e) => warn!("config serialization failed: {e}"),
        }
    }
    info!(
        id = %identity.local_id,
        "engine starting; share the id and password out-of-band"
    );

    let sos = SignalOfStop::new();
    let ctrl_sos = sos.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        ctrl_sos.cancel();
    });

    let (signal_event_tx, signal_event_rx) = mpsc::channel::<SignalingEvent>(256);
    let signaling = signaling::spawn(
        config.signal_server.ws_url.clone(),
        identity.local_id.clone(),
        DEFAULT_HEARTBEAT_INTERVAL,
        signal_event_tx,
        sos.clone(),
    );

    let session_cfg = SessionConfig {
        local_id: identity.local_id.clone(),
        local_pwd_md5: identity.local_pwd_md5.clone(),
        ice: config.ice_server.clone(),
        audio_enabled: false,
    };

    let controller_plan = args.connect.as_ref().map(|remote_id| ControllerParams {
        remote_id: remote_id.clone(),
        remote_pwd_md5: pwd_md5(&args.remote_pwd),
        fps: config.remote.clamped_fps(),
        is_only_file: args.only_file,
        only_relay: args.only_relay,
        adaptive_resolution: args.adaptive,
    });

    let mut engine = Engine {
        session_cfg,
        default_fps: config.remote.clamped_fps(),
        registry: Arc::new(CodecRegistry::new()),
        signaling,
        sessions: HashMap::new(),
        online: HashMap::new(),
        controller_plan,
        controller_started: false,
        startup_commands: args.startup_commands,
        sos: sos.clone(),
    };
    engine.run(signal_event_rx).await;

    info!("engine stopped");
    Ok(())
}

/// The process-wide coordinator: routes signaling to sessions, spawns the
/// client path on incoming `connect`, and drives the operator's controller
/// session.
struct Engine {
    session_cfg: SessionConfig,
    default_fps: u32,
    registry: Arc<CodecRegistry>,
    signaling: SignalingHandle,
    sessions: HashMap<String, SessionHandle>,
    online: HashMap<String, String>,
    controller_plan: Option<ControllerParams>,
    controller_started: bool,
    startup_commands: Vec<SessionCommand>,
    sos: SignalOfStop,
}

impl Engine {
    async fn run(&mut self, mut signal_events: mpsc::Receiver<SignalingEvent>) {
        let (notice_tx, mut notice_rx) = mpsc::channel::<SessionNotice>(32);

        loop {
            tokio::select! {
                _ = self.sos.wait() => break,

                event = signal_events.recv() => {
                    let Some(event) = event else { break };
                    self.on_signaling_event(event, &notice_tx).await;
                }

                Some(notice) = notice_rx.recv() => {
                    match notice {
                        SessionNotice::Destroyed { remote_id } => {
                            self.sessions.remove(&remote_id);
                            info!(remote = %remote_id, "session removed");
                            // A one-shot controller run ends with its session.
                            if self.controller_started
                                && self.controller_plan.as_ref().map(|p| &p.remote_id) == Some(&remote_id)
                            {
                                self.sos.cancel();
                            }
                        }
                        SessionNotice::ChannelReady { remote_id, label } => {
                            if label == CHANNEL_FILE_TEXT {
                                self.dispatch_startup_commands(&remote_id).await;
                            }
                        }
                    }
                }
            }
        }

        // Ordered shutdown: sessions first, then the signaling client dies
        // with the cancellation signal.
        for (_, session) in self.sessions.drain() {
            drop(session);
        }
    }

    async fn on_signaling_event(
        &mut self,
        event: SignalingEvent,
        notice_tx: &mpsc::Sender<SessionNotice>,
    ) {
        match event {
            SignalingEvent::Connected => {
                info!("signaling hub connected");
                if self.controller_plan.is_some() && !self.controller_started {
                    self.start_controller(notice_tx);
                }
            }
            SignalingEvent::Disconnected => {
                warn!("signaling hub disconnected, reconnecting");
            }
            SignalingEvent::ReconnectStatus { phase, attempt, next_delay } => {
                info!(phase, attempt, delay_s = next_delay.as_secs(), "reconnect scheduled");
            }
            SignalingEvent::Text(text) => self.route_message(text.as_bytes(), notice_tx).await,
            SignalingEvent::Binary(data) => self.route_message(&data, notice_tx).await,
        }
    }

    fn start_controller(&mut self, notice_tx: &mpsc::Sender<SessionNotice>) {
        let Some(params) = self.controller_plan.clone() else {
            return;
        };
        info!(remote = %params.remote_id, "starting controller session");
        let handle = session::spawn_controller(
            self.session_cfg.clone(),
            params.clone(),
            Arc::clone(&self.registry),
            self.signaling.clone(),
            Box::new(LoggingFrameSink::default()),
            notice_tx.clone(),
            self.sos.clone(),
        );
        self.sessions.insert(params.remote_id.clone(), handle);
        self.controller_started = true;
    }

    async fn route_message(&mut self, raw: &[u8], notice_tx: &mpsc::Sender<SessionNotice>) {
        let envelope: Envelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("malformed envelope dropped: {e}");
                return;
            }
        };

        match envelope {
            Envelope::Connect {
                sender,
                receiver,
                receiver_pwd,
                fps,
                is_only_file,
                only_relay,
                control_max_width,
                control_max_height,
                ..
            } => {
                self.on_connect(
                    sender,
                    receiver,
                    receiver_pwd,
                    fps,
                    is_only_file,
                    only_relay,
                    (
                        control_max_width.unwrap_or(-1),
                        control_max_height.unwrap_or(-1),
                    ),
                    notice_tx,
                )
                .await;
            }
            Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::Candidate { .. } => {
                let sender = envelope.sender().to_string();
                match self.sessions.get(&sender) {
                    Some(session) => session.route_envelope(envelope).await,
                    None => warn!(sender = %sender, "signaling for unknown session dropped"),
                }
            }
            Envelope::OnlineOne { data, .. } => {
                info!(peer = %data.sn, host = %data.name, "peer online");
                self.online.insert(data.sn, data.name);
            }
            Envelope::OfflineOne { data, .. } => {
                info!(peer = %data.sn, "peer offline");
                self.online.remove(&data.sn);
            }
            Envelope::OnlineList { data, .. } => {
                info!(peers = data.len(), "presence snapshot");
                self.online = data.into_iter().map(|p| (p.sn, p.name)).collect();
            }
            Envelope::Error { data, .. } => {
                error!(message = %data, "hub error");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_connect(
        &mut self,
        sender: String,
        receiver: String,
        receiver_pwd: String,
        fps: u32,
        is_only_file: bool,
        only_relay: bool,
        control_max: (i32, i32),
        notice_tx: &mpsc::Sender<SessionNotice>,
    ) {
        if receiver != self.session_cfg.local_id
            || receiver_pwd != self.session_cfg.local_pwd_md5
        {
            warn!(sender = %sender, "connect with bad credentials dropped");
            self.send_error(&sender, "authentication failed");
            return;
        }
        if self.sessions.contains_key(&sender) {
            warn!(sender = %sender, "connect for existing session rejected");
            self.send_error(&sender, "session already exists");
            return;
        }

        let params = ClientParams {
            remote_id: sender.clone(),
            fps: if (1..=60).contains(&fps) { fps } else { self.default_fps },
            is_only_file,
            only_relay,
            control_max,
        };
        info!(remote = %sender, ?control_max, is_only_file, "accepting connect");
        let handle = session::spawn_client(
            self.session_cfg.clone(),
            params,
            Arc::clone(&self.registry),
            self.signaling.clone(),
            notice_tx.clone(),
            self.sos.clone(),
        );
        self.sessions.insert(sender, handle);
    }

    fn send_error(&self, receiver: &str, message: &str) {
        let envelope = Envelope::Error {
            role: Some(Role::Cli),
            sender: self.session_cfg.local_id.clone(),
            receiver: receiver.to_string(),
            data: message.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&envelope) {
            if let Err(e) = self.signaling.send_text(json) {
                warn!("error envelope not sent: {e:#}");
            }
        }
    }

    async fn dispatch_startup_commands(&mut self, remote_id: &str) {
        if self.startup_commands.is_empty() {
            return;
        }
        let commands = std::mem::take(&mut self.startup_commands);
        let Some(session) = self.sessions.get(remote_id) else {
            return;
        };
        for command in commands {
            info!(remote = %remote_id, ?command, "dispatching startup command");
            session.command(command).await;
        }
    }
}
