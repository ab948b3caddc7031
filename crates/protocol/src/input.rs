use serde::{Deserialize, Serialize};

/// Mouse button numbering on the wire (the controller sends the toolkit's
/// native values).
pub const BUTTON_LEFT: i32 = 1;
pub const BUTTON_RIGHT: i32 = 2;
pub const BUTTON_MIDDLE: i32 = 4;

/// One wheel notch. Positive `mouseData` scrolls away from the user.
pub const WHEEL_NOTCH: i32 = 120;

/// A message on the `input_airan` channel.
///
/// Every object carries the auth triple alongside the payload fields; the
/// client drops anything whose triple does not match the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub receiver_pwd: String,
    #[serde(flatten)]
    pub payload: InputPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msgType")]
pub enum InputPayload {
    #[serde(rename = "keyboard")]
    Keyboard {
        /// Virtual-key code.
        key: u32,
        #[serde(rename = "dwFlags")]
        state: KeyState,
    },
    #[serde(rename = "mouse")]
    Mouse {
        button: i32,
        /// Normalized to the displayed frame rectangle, in [0,1].
        x: f64,
        y: f64,
        /// Signed wheel delta for `wheel` events; one notch is ±120.
        #[serde(rename = "mouseData", default)]
        mouse_data: i32,
        #[serde(rename = "dwFlags")]
        action: MouseAction,
    },
    /// Control plane: controller asks the client for an IDR.
    #[serde(rename = "request_keyframe")]
    RequestKeyframe {
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        reason: String,
    },
    /// Control plane: client acknowledges a keyframe request.
    #[serde(rename = "keyframe_response")]
    KeyframeResponse {
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        status: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MouseAction {
    Down,
    Up,
    Move,
    DoubleClick,
    Wheel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_wire_shape() {
        let msg = InputMessage {
            sender: "CTL".into(),
            receiver: "CLI".into(),
            receiver_pwd: "MD5".into(),
            payload: InputPayload::Keyboard {
                key: 0x41,
                state: KeyState::Down,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""msgType":"keyboard""#));
        assert!(json.contains(r#""key":65"#));
        assert!(json.contains(r#""dwFlags":"down""#));

        let parsed: InputMessage = serde_json::from_str(&json).unwrap();
        match parsed.payload {
            InputPayload::Keyboard { key, state } => {
                assert_eq!(key, 65);
                assert_eq!(state, KeyState::Down);
            }
            other => panic!("expected Keyboard, got {other:?}"),
        }
    }

    #[test]
    fn mouse_wire_shape() {
        let json = r#"{"msgType":"mouse","sender":"A","receiver":"B","receiver_pwd":"P",
                       "button":1,"x":0.5,"y":0.25,"mouseData":0,"dwFlags":"doubleClick"}"#;
        let msg: InputMessage = serde_json::from_str(json).unwrap();
        match msg.payload {
            InputPayload::Mouse { button, x, y, action, .. } => {
                assert_eq!(button, BUTTON_LEFT);
                assert_eq!(x, 0.5);
                assert_eq!(y, 0.25);
                assert_eq!(action, MouseAction::DoubleClick);
            }
            other => panic!("expected Mouse, got {other:?}"),
        }
    }

    #[test]
    fn wheel_carries_signed_delta() {
        let msg = InputMessage {
            sender: "A".into(),
            receiver: "B".into(),
            receiver_pwd: "P".into(),
            payload: InputPayload::Mouse {
                button: 0,
                x: 0.1,
                y: 0.9,
                mouse_data: -WHEEL_NOTCH,
                action: MouseAction::Wheel,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""mouseData":-120"#));
        assert!(json.contains(r#""dwFlags":"wheel""#));
    }

    #[test]
    fn keyframe_request_wire_shape() {
        let msg = InputMessage {
            sender: "LOCAL".into(),
            receiver: "REMOTE".into(),
            receiver_pwd: "MD5".into(),
            payload: InputPayload::RequestKeyframe {
                timestamp: 1_700_000_000_000,
                reason: "network_error_recovery".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""msgType":"request_keyframe""#));
        assert!(json.contains(r#""sender":"LOCAL""#));
        assert!(json.contains(r#""receiver":"REMOTE""#));
        assert!(json.contains(r#""receiver_pwd":"MD5""#));
        assert!(json.contains(r#""reason":"network_error_recovery""#));
    }

    #[test]
    fn keyframe_response_parses_without_optional_fields() {
        let json = r#"{"msgType":"keyframe_response","sender":"C","receiver":"D"}"#;
        let msg: InputMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg.payload, InputPayload::KeyframeResponse { .. }));
    }
}
