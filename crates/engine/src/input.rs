//! Input channel handling.
//!
//! Controller side: pointer normalization into the displayed frame
//! rectangle. Client side: auth-gated execution of input messages against
//! the host, plus the in-process control-plane messages (keyframe
//! request/response) that share the channel.

use airan_protocol::{InputMessage, InputPayload, KeyState, MouseAction, WHEEL_NOTCH};
use airan_protocol::{BUTTON_LEFT, BUTTON_MIDDLE, BUTTON_RIGHT};
use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::{xproto, xtest};
use x11rb::rust_connection::RustConnection;

/// The displayed image rectangle inside the viewer widget, in widget
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Map a widget-space pointer position into the displayed frame's [0,1]²
/// space. Positions outside the displayed rectangle produce no event.
pub fn normalize_pointer(px: f64, py: f64, rect: DisplayRect) -> Option<(f64, f64)> {
    if rect.w <= 0.0 || rect.h <= 0.0 {
        return None;
    }
    if px < rect.x || py < rect.y || px > rect.x + rect.w || py > rect.y + rect.h {
        return None;
    }
    Some(((px - rect.x) / rect.w, (py - rect.y) / rect.h))
}

/// Host input synthesis. The production implementation drives XTEST; tests
/// record calls.
pub trait InputSink: Send {
    fn keyboard(&mut self, key: u32, down: bool) -> Result<()>;
    fn mouse(
        &mut self,
        button: i32,
        x: f64,
        y: f64,
        mouse_data: i32,
        action: MouseAction,
    ) -> Result<()>;
}

/// What the session should do after an input message was handled.
#[derive(Debug)]
pub enum InputAction {
    None,
    /// A keyframe request arrived: force an IDR and send the acknowledgement
    /// back on the input channel.
    ForceKeyframe { response: InputMessage },
}

/// Client-side input executor: validates the auth triple on every message,
/// applies pointer/key events to the host, and answers control-plane
/// messages in-process.
pub struct InputExecutor<S: InputSink> {
    local_id: String,
    local_pwd_md5: String,
    remote_id: String,
    sink: S,
}

impl<S: InputSink> InputExecutor<S> {
    pub fn new(local_id: String, local_pwd_md5: String, remote_id: String, sink: S) -> Self {
        Self {
            local_id,
            local_pwd_md5,
            remote_id,
            sink,
        }
    }

    /// Handle one raw text frame from the input channel.
    pub fn handle(&mut self, raw: &str, now_ms: i64) -> Result<InputAction> {
        let msg: InputMessage = serde_json::from_str(raw).context("parsing input message")?;

        if msg.sender != self.remote_id {
            bail!("input from unexpected sender {:?}", msg.sender);
        }
        if msg.receiver != self.local_id || msg.receiver_pwd != self.local_pwd_md5 {
            bail!("input auth mismatch from {:?}", msg.sender);
        }

        match msg.payload {
            InputPayload::Keyboard { key, state } => {
                self.sink.keyboard(key, state == KeyState::Down)?;
                Ok(InputAction::None)
            }
            InputPayload::Mouse {
                button,
                x,
                y,
                mouse_data,
                action,
            } => {
                if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
                    // Outside the frame: dropped silently.
                    debug!(x, y, "mouse event outside frame dropped");
                    return Ok(InputAction::None);
                }
                self.sink.mouse(button, x, y, mouse_data, action)?;
                Ok(InputAction::None)
            }
            InputPayload::RequestKeyframe { reason, .. } => {
                info!(reason = %reason, "keyframe requested by controller");
                let response = InputMessage {
                    sender: self.local_id.clone(),
                    receiver: self.remote_id.clone(),
                    receiver_pwd: String::new(),
                    payload: InputPayload::KeyframeResponse {
                        timestamp: now_ms,
                        status: "requested".into(),
                    },
                };
                Ok(InputAction::ForceKeyframe { response })
            }
            InputPayload::KeyframeResponse { .. } => {
                // Only meaningful on the controller side; harmless here.
                Ok(InputAction::None)
            }
        }
    }
}

/// Build the controller's keyframe request message.
pub fn keyframe_request(
    local_id: &str,
    remote_id: &str,
    remote_pwd_md5: &str,
    now_ms: i64,
) -> InputMessage {
    InputMessage {
        sender: local_id.to_string(),
        receiver: remote_id.to_string(),
        receiver_pwd: remote_pwd_md5.to_string(),
        payload: InputPayload::RequestKeyframe {
            timestamp: now_ms,
            reason: "network_error_recovery".into(),
        },
    }
}

/// XTEST-backed host input. Key codes on the wire are X keysyms; the
/// keyboard mapping is fetched once to resolve them to keycodes.
pub struct XTestSink {
    conn: RustConnection,
    root: xproto::Window,
    screen_width: u32,
    screen_height: u32,
    keysym_to_keycode: std::collections::HashMap<u32, u8>,
}

impl XTestSink {
    pub fn open() -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(None).context("connecting to X display")?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let screen_width = screen.width_in_pixels as u32;
        let screen_height = screen.height_in_pixels as u32;

        conn.extension_information(xtest::X11_EXTENSION_NAME)
            .context("querying XTEST extension")?
            .ok_or_else(|| anyhow::anyhow!("XTEST extension not available"))?;

        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let max_keycode = setup.max_keycode;
        let mapping = xproto::get_keyboard_mapping(
            &conn,
            min_keycode,
            max_keycode - min_keycode + 1,
        )
        .context("requesting keyboard mapping")?
        .reply()
        .context("fetching keyboard mapping")?;

        let per = (mapping.keysyms_per_keycode as usize).max(1);
        let mut keysym_to_keycode = std::collections::HashMap::new();
        for (i, chunk) in mapping.keysyms.chunks(per).enumerate() {
            let keycode = min_keycode + i as u8;
            for &sym in chunk {
                if sym != 0 {
                    keysym_to_keycode.entry(sym).or_insert(keycode);
                }
            }
        }

        info!(
            screen_width,
            screen_height,
            keysyms = keysym_to_keycode.len(),
            "XTEST input sink ready"
        );
        Ok(Self {
            conn,
            root,
            screen_width,
            screen_height,
            keysym_to_keycode,
        })
    }

    fn to_pixels(&self, x: f64, y: f64) -> (i16, i16) {
        let px = (x.clamp(0.0, 1.0) * self.screen_width as f64) as i16;
        let py = (y.clamp(0.0, 1.0) * self.screen_height as f64) as i16;
        (px, py)
    }

    fn fake_button(&self, x_button: u8, down: bool) -> Result<()> {
        let event_type = if down {
            xproto::BUTTON_PRESS_EVENT
        } else {
            xproto::BUTTON_RELEASE_EVENT
        };
        xtest::fake_input(&self.conn, event_type, x_button, 0, x11rb::NONE, 0, 0, 0)?;
        Ok(())
    }

    fn x_button(button: i32) -> Option<u8> {
        match button {
            BUTTON_LEFT => Some(1),
            BUTTON_MIDDLE => Some(2),
            BUTTON_RIGHT => Some(3),
            _ => None,
        }
    }
}

impl InputSink for XTestSink {
    fn keyboard(&mut self, key: u32, down: bool) -> Result<()> {
        let Some(&keycode) = self.keysym_to_keycode.get(&key) else {
            // Unknown key: dropped silently.
            debug!(key, "no keycode for keysym");
            return Ok(());
        };
        let event_type = if down {
            xproto::KEY_PRESS_EVENT
        } else {
            xproto::KEY_RELEASE_EVENT
        };
        xtest::fake_input(&self.conn, event_type, keycode, 0, self.root, 0, 0, 0)?;
        self.conn.flush()?;
        Ok(())
    }

    fn mouse(
        &mut self,
        button: i32,
        x: f64,
        y: f64,
        mouse_data: i32,
        action: MouseAction,
    ) -> Result<()> {
        let (px, py) = self.to_pixels(x, y);
        xtest::fake_input(
            &self.conn,
            xproto::MOTION_NOTIFY_EVENT,
            0,
            0,
            self.root,
            px,
            py,
            0,
        )?;

        match action {
            MouseAction::Move => {}
            MouseAction::Down | MouseAction::Up => {
                if let Some(x_button) = Self::x_button(button) {
                    self.fake_button(x_button, action == MouseAction::Down)?;
                } else {
                    debug!(button, "unknown mouse button dropped");
                }
            }
            MouseAction::DoubleClick => {
                if let Some(x_button) = Self::x_button(button) {
                    for _ in 0..2 {
                        self.fake_button(x_button, true)?;
                        self.fake_button(x_button, false)?;
                    }
                }
            }
            MouseAction::Wheel => {
                // ±120 per notch; each notch is one press/release of
                // button 4 (away) or 5 (toward).
                let direction = if mouse_data > 0 { 4u8 } else { 5u8 };
                let notches = (mouse_data.unsigned_abs() / WHEEL_NOTCH.unsigned_abs()).max(1);
                for _ in 0..notches.min(10) {
                    self.fake_button(direction, true)?;
                    self.fake_button(direction, false)?;
                }
            }
        }
        self.conn.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        keys: Vec<(u32, bool)>,
        mice: Vec<(i32, f64, f64, i32, MouseAction)>,
    }

    impl InputSink for RecordingSink {
        fn keyboard(&mut self, key: u32, down: bool) -> Result<()> {
            self.keys.push((key, down));
            Ok(())
        }
        fn mouse(
            &mut self,
            button: i32,
            x: f64,
            y: f64,
            mouse_data: i32,
            action: MouseAction,
        ) -> Result<()> {
            self.mice.push((button, x, y, mouse_data, action));
            Ok(())
        }
    }

    fn executor() -> InputExecutor<RecordingSink> {
        InputExecutor::new(
            "LOCAL".into(),
            "MD5SUM".into(),
            "REMOTE".into(),
            RecordingSink::default(),
        )
    }

    /// Widget 800x600, displayed rect (100,50) 600x400: a click at
    /// (400,250) normalizes to the frame center.
    #[test]
    fn pointer_normalization() {
        let rect = DisplayRect {
            x: 100.0,
            y: 50.0,
            w: 600.0,
            h: 400.0,
        };
        assert_eq!(normalize_pointer(400.0, 250.0, rect), Some((0.5, 0.5)));
        assert_eq!(normalize_pointer(100.0, 50.0, rect), Some((0.0, 0.0)));
        assert_eq!(normalize_pointer(700.0, 450.0, rect), Some((1.0, 1.0)));
        // Letterbox band: no event.
        assert_eq!(normalize_pointer(50.0, 250.0, rect), None);
        assert_eq!(normalize_pointer(400.0, 470.0, rect), None);
        // Degenerate rectangle: no event.
        let flat = DisplayRect { x: 0.0, y: 0.0, w: 0.0, h: 400.0 };
        assert_eq!(normalize_pointer(0.0, 10.0, flat), None);
    }

    /// The normalized center of a 1920x1080 client screen lands at
    /// (960, 540).
    #[test]
    fn normalized_center_maps_to_screen_center() {
        let (x, y) = normalize_pointer(
            400.0,
            250.0,
            DisplayRect { x: 100.0, y: 50.0, w: 600.0, h: 400.0 },
        )
        .unwrap();
        let px = (x * 1920.0) as i32;
        let py = (y * 1080.0) as i32;
        assert_eq!((px, py), (960, 540));
    }

    #[test]
    fn executor_applies_authorized_events() {
        let mut exec = executor();
        let raw = r#"{"msgType":"keyboard","sender":"REMOTE","receiver":"LOCAL",
                      "receiver_pwd":"MD5SUM","key":65,"dwFlags":"down"}"#;
        let action = exec.handle(raw, 0).unwrap();
        assert!(matches!(action, InputAction::None));
        assert_eq!(exec.sink.keys, vec![(65, true)]);

        let raw = r#"{"msgType":"mouse","sender":"REMOTE","receiver":"LOCAL",
                      "receiver_pwd":"MD5SUM","button":1,"x":0.5,"y":0.5,
                      "mouseData":0,"dwFlags":"down"}"#;
        exec.handle(raw, 0).unwrap();
        assert_eq!(exec.sink.mice.len(), 1);
    }

    #[test]
    fn executor_rejects_bad_auth() {
        let mut exec = executor();
        // Wrong password.
        let raw = r#"{"msgType":"keyboard","sender":"REMOTE","receiver":"LOCAL",
                      "receiver_pwd":"WRONG","key":65,"dwFlags":"down"}"#;
        assert!(exec.handle(raw, 0).is_err());
        // Wrong sender.
        let raw = r#"{"msgType":"keyboard","sender":"IMPOSTOR","receiver":"LOCAL",
                      "receiver_pwd":"MD5SUM","key":65,"dwFlags":"down"}"#;
        assert!(exec.handle(raw, 0).is_err());
        // Wrong receiver.
        let raw = r#"{"msgType":"keyboard","sender":"REMOTE","receiver":"OTHER",
                      "receiver_pwd":"MD5SUM","key":65,"dwFlags":"down"}"#;
        assert!(exec.handle(raw, 0).is_err());
        assert!(exec.sink.keys.is_empty());
    }

    #[test]
    fn out_of_frame_mouse_dropped() {
        let mut exec = executor();
        let raw = r#"{"msgType":"mouse","sender":"REMOTE","receiver":"LOCAL",
                      "receiver_pwd":"MD5SUM","button":1,"x":1.5,"y":0.5,
                      "mouseData":0,"dwFlags":"move"}"#;
        exec.handle(raw, 0).unwrap();
        assert!(exec.sink.mice.is_empty());
    }

    #[test]
    fn keyframe_request_forces_idr_and_acknowledges() {
        let mut exec = executor();
        let raw = r#"{"msgType":"request_keyframe","sender":"REMOTE","receiver":"LOCAL",
                      "receiver_pwd":"MD5SUM","timestamp":123,"reason":"network_error_recovery"}"#;
        let action = exec.handle(raw, 456).unwrap();
        match action {
            InputAction::ForceKeyframe { response } => {
                assert_eq!(response.sender, "LOCAL");
                assert_eq!(response.receiver, "REMOTE");
                match response.payload {
                    InputPayload::KeyframeResponse { timestamp, status } => {
                        assert_eq!(timestamp, 456);
                        assert_eq!(status, "requested");
                    }
                    other => panic!("expected KeyframeResponse, got {other:?}"),
                }
            }
            other => panic!("expected ForceKeyframe, got {other:?}"),
        }
    }

    #[test]
    fn keyframe_request_message_shape() {
        let msg = keyframe_request("LOCAL", "REMOTE", "PWDMD5", 1_700_000_000_000);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""msgType":"request_keyframe""#));
        assert!(json.contains(r#""receiver_pwd":"PWDMD5""#));
        assert!(json.contains(r#""timestamp":1700000000000"#));
        assert!(json.contains(r#""reason":"network_error_recovery""#));
    }
}
