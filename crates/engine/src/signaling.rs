//! Signaling client: one WebSocket connection to the hub, heartbeat, and the
//! phased reconnect state machine.

use crate::sos::SignalOfStop;
use airan_protocol::HEARTBEAT_FRAME;
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Events delivered to the coordinator.
#[derive(Debug)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    Text(String),
    Binary(Vec<u8>),
    ReconnectStatus {
        phase: u32,
        attempt: u32,
        next_delay: Duration,
    },
}

/// Outbound frames queued by the rest of the engine.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Reconnect schedule: 10 attempts at 1 s, 10 at 10 s, 10 at 30 s, then
/// every 60 s indefinitely. A successful connection resets to phase 0.
#[derive(Debug, Default)]
pub struct ReconnectSchedule {
    phase: u32,
    attempts_in_phase: u32,
}

/// One scheduled attempt: wait `delay`, then dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub phase: u32,
    pub attempt: u32,
    pub delay: Duration,
}

const PHASE_DELAYS_S: [u64; 4] = [1, 10, 30, 60];
const ATTEMPTS_PER_PHASE: u32 = 10;
const FINAL_PHASE: u32 = 3;

impl ReconnectSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.phase = 0;
        self.attempts_in_phase = 0;
    }

    pub fn next_attempt(&mut self) -> ReconnectAttempt {
        if self.phase < FINAL_PHASE && self.attempts_in_phase >= ATTEMPTS_PER_PHASE {
            self.phase += 1;
            self.attempts_in_phase = 0;
        }
        self.attempts_in_phase += 1;
        ReconnectAttempt {
            phase: self.phase,
            attempt: self.attempts_in_phase,
            delay: Duration::from_secs(PHASE_DELAYS_S[self.phase as usize]),
        }
    }
}

/// Handle kept by the coordinator. Sends fail with *not connected* while the
/// socket is down instead of queueing into the void.
#[derive(Clone)]
pub struct SignalingHandle {
    outbox: mpsc::Sender<OutboundFrame>,
    connected: Arc<AtomicBool>,
}

impl SignalingHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn send_text(&self, msg: String) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected to signaling hub");
        }
        self.outbox
            .try_send(OutboundFrame::Text(msg))
            .context("signaling outbox full or closed")
    }

    pub fn send_binary(&self, msg: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected to signaling hub");
        }
        self.outbox
            .try_send(OutboundFrame::Binary(msg))
            .context("signaling outbox full or closed")
    }
}

/// Connect to `wsUrl?sessionId=..&hostname=..` and keep the connection alive
/// for the process lifetime. Returns the send handle; events arrive on
/// `event_tx`.
pub fn spawn(
    base_url: String,
    local_id: String,
    heartbeat_interval: Duration,
    event_tx: mpsc::Sender<SignalingEvent>,
    sos: SignalOfStop,
) -> SignalingHandle {
    let (outbox_tx, outbox_rx) = mpsc::channel::<OutboundFrame>(64);
    let connected = Arc::new(AtomicBool::new(false));

    let handle = SignalingHandle {
        outbox: outbox_tx,
        connected: Arc::clone(&connected),
    };

    let url = format!(
        "{}?sessionId={}&hostname={}",
        base_url,
        local_id,
        urlencoding::encode(&host_name())
    );

    tokio::spawn(run(url, heartbeat_interval, event_tx, outbox_rx, connected, sos));
    handle
}

async fn run(
    url: String,
    heartbeat_interval: Duration,
    event_tx: mpsc::Sender<SignalingEvent>,
    mut outbox_rx: mpsc::Receiver<OutboundFrame>,
    connected: Arc<AtomicBool>,
    sos: SignalOfStop,
) {
    let mut schedule = ReconnectSchedule::new();
    loop {
        if sos.cancelled() {
            break;
        }
        info!(url = %url, "connecting to signaling hub");
        match drive_connection(
            &url,
            heartbeat_interval,
            &event_tx,
            &mut outbox_rx,
            &connected,
            &mut schedule,
            &sos,
        )
        .await
        {
            Ok(()) => {
                // Cancelled or outbox dropped: the engine is going away.
                break;
            }
            Err(e) => {
                warn!("signaling connection lost: {e:#}");
            }
        }
        connected.store(false, Ordering::Release);
        let _ = event_tx.send(SignalingEvent::Disconnected).await;

        let attempt = schedule.next_attempt();
        let _ = event_tx
            .send(SignalingEvent::ReconnectStatus {
                phase: attempt.phase,
                attempt: attempt.attempt,
                next_delay: attempt.delay,
            })
            .await;
        debug!(
            phase = attempt.phase,
            attempt = attempt.attempt,
            delay_s = attempt.delay.as_secs(),
            "scheduling reconnect"
        );
        if sos.select(tokio::time::sleep(attempt.delay)).await.is_err() {
            break;
        }
    }
    connected.store(false, Ordering::Release);
    info!("signaling client stopped");
}

/// One socket lifetime: connect, run heartbeat + pumps until the socket
/// drops, the engine cancels, or the outbox closes.
async fn drive_connection(
    url: &str,
    heartbeat_interval: Duration,
    event_tx: &mpsc::Sender<SignalingEvent>,
    outbox_rx: &mut mpsc::Receiver<OutboundFrame>,
    connected: &Arc<AtomicBool>,
    schedule: &mut ReconnectSchedule,
    sos: &SignalOfStop,
) -> Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .context("websocket connect failed")?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    connected.store(true, Ordering::Release);
    schedule.reset();
    let _ = event_tx.send(SignalingEvent::Connected).await;
    info!("signaling hub connected");

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // interval fires immediately; the hub only expects heartbeats on the
    // interval boundary.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = sos.wait() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                ws_tx
                    .send(Message::Text(HEARTBEAT_FRAME.into()))
                    .await
                    .context("heartbeat send failed")?;
            }
            frame = outbox_rx.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        ws_tx.send(Message::Text(text.into())).await.context("text send failed")?;
                    }
                    Some(OutboundFrame::Binary(data)) => {
                        ws_tx.send(Message::Binary(data.into())).await.context("binary send failed")?;
                    }
                    None => return Ok(()),
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(SignalingEvent::Text(text.to_string())).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = event_tx.send(SignalingEvent::Binary(data.to_vec())).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        bail!("hub closed the connection: {frame:?}");
                    }
                    Some(Err(e)) => return Err(e).context("websocket receive failed"),
                    None => bail!("websocket stream ended"),
                }
            }
        }
    }
}

fn host_name() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The attempt sequence from a cold disconnect: ten 1 s delays, ten
    /// 10 s, ten 30 s, then 60 s forever. Cumulative fire times land at
    /// 1..10 s, 20..110 s, 140..410 s, 470 s, 530 s, ...
    #[test]
    fn phased_backoff_sequence() {
        let mut schedule = ReconnectSchedule::new();
        let mut fire_times = Vec::new();
        let mut clock = 0u64;
        for _ in 0..35 {
            let a = schedule.next_attempt();
            clock += a.delay.as_secs();
            fire_times.push((a.phase, a.attempt, clock));
        }

        // Phase 0: t = 1..=10
        for i in 0..10 {
            assert_eq!(fire_times[i], (0, i as u32 + 1, i as u64 + 1));
        }
        // Phase 1: t = 20, 30, ..., 110
        for i in 0..10 {
            assert_eq!(fire_times[10 + i], (1, i as u32 + 1, 10 + 10 * (i as u64 + 1)));
        }
        // Phase 2: t = 140, 170, ..., 410
        for i in 0..10 {
            assert_eq!(fire_times[20 + i], (2, i as u32 + 1, 110 + 30 * (i as u64 + 1)));
        }
        // Phase 3: every 60 s, indefinitely.
        assert_eq!(fire_times[30], (3, 1, 470));
        assert_eq!(fire_times[31], (3, 2, 530));
        assert_eq!(fire_times[34].0, 3);
    }

    #[test]
    fn final_phase_never_advances() {
        let mut schedule = ReconnectSchedule::new();
        for _ in 0..100 {
            let _ = schedule.next_attempt();
        }
        let a = schedule.next_attempt();
        assert_eq!(a.phase, 3);
        assert_eq!(a.delay, Duration::from_secs(60));
    }

    #[test]
    fn success_resets_to_phase_zero() {
        let mut schedule = ReconnectSchedule::new();
        for _ in 0..25 {
            let _ = schedule.next_attempt();
        }
        schedule.reset();
        let a = schedule.next_attempt();
        assert_eq!(
            a,
            ReconnectAttempt {
                phase: 0,
                attempt: 1,
                delay: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn attempt_count_after_elapsed_time() {
        // After T seconds of failures the attempt count matches the
        // per-phase breakdown min(10, T/1) + min(10, (T-10)/10) + ...
        let expected_attempts = |t: u64| -> u64 {
            let p0 = t.min(10);
            let p1 = (t.saturating_sub(10) / 10).min(10);
            let p2 = (t.saturating_sub(110) / 30).min(10);
            let p3 = t.saturating_sub(410) / 60;
            p0 + p1 + p2 + p3
        };
        for &t in &[0u64, 1, 5, 10, 15, 110, 200, 410, 470, 1000] {
            let mut schedule = ReconnectSchedule::new();
            let mut clock = 0u64;
            let mut fired = 0u64;
            loop {
                let a = schedule.next_attempt();
                if clock + a.delay.as_secs() > t {
                    break;
                }
                clock += a.delay.as_secs();
                fired += 1;
            }
            assert_eq!(fired, expected_attempts(t), "t = {t}");
        }
    }
}
