//! Screen capture for the client role: MIT-SHM grabs of the primary screen
//! plus the timer-driven capture/encode worker thread.

use crate::codec::CodecRegistry;
use crate::encoder::{EncodeParams, Encoder};
use crate::h264;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::shm;
use x11rb::protocol::xproto::{ImageFormat, Screen};
use x11rb::rust_connection::RustConnection;

const BYTES_PER_PIXEL: u32 = 4; // BGRx

/// One encoded access unit leaving the worker.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub is_keyframe: bool,
}

/// Size of the primary screen, used for encode-resolution negotiation
/// before any capture starts.
pub fn primary_screen_size() -> Result<(u32, u32)> {
    let (conn, screen_num) =
        RustConnection::connect(None).context("connecting to X display")?;
    let screen: &Screen = &conn.setup().roots[screen_num];
    Ok((screen.width_in_pixels as u32, screen.height_in_pixels as u32))
}

/// SHM-backed grab of the root window. Each `grab` copies the current frame
/// out of the shared segment as BGRx.
pub struct ScreenCapture {
    conn: RustConnection,
    root: u32,
    width: u32,
    height: u32,
    shm_seg: shm::Seg,
    shm_ptr: *mut u8,
    shm_len: usize,
}

// SAFETY: the SHM pointer is only touched through &mut self.
unsafe impl Send for ScreenCapture {}

impl ScreenCapture {
    pub fn open() -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(None).context("connecting to X display")?;

        shm::query_version(&conn)
            .context("MIT-SHM not available")?
            .reply()
            .context("MIT-SHM version query failed")?;

        let screen: &Screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let width = screen.width_in_pixels as u32;
        let height = screen.height_in_pixels as u32;
        let shm_len = (width * height * BYTES_PER_PIXEL) as usize;

        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, shm_len, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            bail!("shmget failed: {}", std::io::Error::last_os_error());
        }
        let shm_ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if shm_ptr == usize::MAX as *mut libc::c_void {
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
            bail!("shmat failed: {}", std::io::Error::last_os_error());
        }
        // Removed once every attachment is gone.
        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

        let shm_seg = conn.generate_id().context("generating SHM seg id")?;
        shm::attach(&conn, shm_seg, shm_id as u32, false)
            .context("SHM attach request failed")?
            .check()
            .context("SHM attach failed")?;

        info!(width, height, "screen capture ready");
        Ok(Self {
            conn,
            root,
            width,
            height,
            shm_seg,
            shm_ptr: shm_ptr as *mut u8,
            shm_len,
        })
    }

    /// Grab the screen into a fresh BGRx buffer.
    pub fn grab(&mut self) -> Result<Vec<u8>> {
        shm::get_image(
            &self.conn,
            self.root,
            0,
            0,
            self.width as u16,
            self.height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            self.shm_seg,
            0,
        )
        .context("SHM GetImage request failed")?
        .reply()
        .context("SHM GetImage reply failed")?;

        // SAFETY: the segment outlives self and is shm_len bytes.
        let shm_slice = unsafe { std::slice::from_raw_parts(self.shm_ptr, self.shm_len) };
        Ok(shm_slice.to_vec())
    }

}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        let _ = shm::detach(&self.conn, self.shm_seg);
        let _ = self.conn.flush();
        unsafe {
            libc::shmdt(self.shm_ptr as *const libc::c_void);
        }
        debug!("SHM segment detached");
    }
}

/// Commands accepted by the running worker.
enum WorkerCommand {
    SetFps(u32),
    ForceKeyframe,
}

/// The capture-and-encode worker: a dedicated thread pacing grabs at
/// `1000/fps` ms, feeding the encoder, and pushing encoded access units
/// into a dropping channel toward the video send loop.
pub struct CaptureWorker {
    cmd_tx: std_mpsc::Sender<WorkerCommand>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn start(
        registry: Arc<CodecRegistry>,
        params: EncodeParams,
        encoded_tx: mpsc::Sender<EncodedFrame>,
    ) -> Result<Self> {
        let mut capture = ScreenCapture::open()?;
        let encoder = Encoder::open(&registry, params, 0)?;

        let (cmd_tx, cmd_rx) = std_mpsc::channel::<WorkerCommand>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("capture-encode".into())
            .spawn(move || {
                let mut encoder = encoder;
                let mut fps = params.fps.clamp(1, 60);
                let mut frame_duration = Duration::from_millis(1000 / fps as u64);
                let start = Instant::now();
                let mut last_timestamp_us = 0u64;
                let mut captured: u64 = 0;

                loop {
                    if shutdown_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let tick_start = Instant::now();

                    while let Ok(cmd) = cmd_rx.try_recv() {
                        match cmd {
                            WorkerCommand::SetFps(new_fps) => {
                                let new_fps = new_fps.clamp(1, 60);
                                if new_fps != fps {
                                    info!(old = fps, new = new_fps, "capture fps changed");
                                    fps = new_fps;
                                    frame_duration = Duration::from_millis(1000 / fps as u64);
                                }
                            }
                            WorkerCommand::ForceKeyframe => encoder.force_key_frame(),
                        }
                    }

                    // A dead pipeline drops this rung and resumes the ladder
                    // one rung further down.
                    if encoder.has_error() {
                        let skip = encoder.next_ladder_position();
                        warn!(
                            backend = encoder.backend_id(),
                            "encoder pipeline failed mid-session, falling back"
                        );
                        match Encoder::open(&registry, EncodeParams { fps, ..params }, skip) {
                            Ok(next) => encoder = next,
                            Err(e) => {
                                error!("encoder fallback exhausted: {e:#}");
                                break;
                            }
                        }
                    }

                    match capture.grab() {
                        Ok(frame) => {
                            let mut timestamp_us = start.elapsed().as_micros() as u64;
                            if timestamp_us <= last_timestamp_us {
                                timestamp_us = last_timestamp_us + 1;
                            }
                            last_timestamp_us = timestamp_us;
                            if let Err(e) = encoder.encode(frame, timestamp_us) {
                                warn!("encode failed: {e:#}");
                            }
                            captured += 1;
                            if captured % 300 == 0 {
                                debug!(captured, fps, "capture stats");
                            }
                        }
                        Err(e) => {
                            // GetImage can fail transiently around mode
                            // changes; skip the frame.
                            debug!("capture frame skipped: {e:#}");
                        }
                    }

                    loop {
                        match encoder.pull_encoded() {
                            Ok(Some(data)) => {
                                let frame = EncodedFrame {
                                    is_keyframe: h264::contains_idr(&data),
                                    timestamp_us: last_timestamp_us,
                                    data,
                                };
                                match encoded_tx.try_send(frame) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(_)) => {
                                        debug!("dropping encoded frame (send loop behind)");
                                    }
                                    Err(mpsc::error::TrySendError::Closed(_)) => {
                                        info!("encoded channel closed, capture stopping");
                                        return;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("encoder drain failed: {e:#}");
                                break;
                            }
                        }
                    }

                    let elapsed = tick_start.elapsed();
                    if elapsed < frame_duration {
                        std::thread::sleep(frame_duration - elapsed);
                    }
                }
                info!("capture worker stopped");
            })
            .context("spawning capture thread")?;

        Ok(Self {
            cmd_tx,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Adjust the capture rate without touching the encoder.
    pub fn set_fps(&self, fps: u32) {
        let _ = self.cmd_tx.send(WorkerCommand::SetFps(fps));
    }

    /// Encode the next frame as an IDR.
    pub fn force_keyframe(&self) {
        let _ = self.cmd_tx.send(WorkerCommand::ForceKeyframe);
    }

    /// Signal shutdown and wait up to three seconds for the thread; a stuck
    /// thread is abandoned to process teardown rather than blocking the
    /// session forever.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + Duration::from_secs(3);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("capture thread did not stop within 3s, abandoning");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
