use serde::{Deserialize, Serialize};

/// Data channel labels. These are contractual: both ends create or match
/// channels by label, and the reassembly temp-file names embed them.
pub const CHANNEL_INPUT: &str = "input_airan";
pub const CHANNEL_FILE: &str = "file_airan";
pub const CHANNEL_FILE_TEXT: &str = "file_text_airan";

/// Media track / stream identifiers, equally contractual.
pub const TRACK_VIDEO: &str = "video_airan";
pub const STREAM_VIDEO: &str = "video_stream1_airan";
pub const TRACK_AUDIO: &str = "audio_airan";

/// Heartbeat frame sent to the signaling hub while connected.
pub const HEARTBEAT_FRAME: &str = "@heart";

/// The two peer roles plus the hub itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Cli,
    Ctl,
    Server,
}

/// A peer as the signaling hub reports it in presence updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnlinePeer {
    /// Session id (the peer's persisted UUID).
    #[serde(default)]
    pub sn: String,
    /// Hostname the peer registered with.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Signaling envelopes exchanged over the hub connection.
///
/// The wire form is a flat JSON object discriminated by `type`; omitted keys
/// default to empty. Unknown types fail to parse and are dropped by the
/// signaling dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Controller asks a client to start a session.
    #[serde(rename = "connect")]
    Connect {
        role: Role,
        sender: String,
        receiver: String,
        #[serde(default)]
        receiver_pwd: String,
        /// 0 (absent) falls back to the client's configured default.
        #[serde(default)]
        fps: u32,
        #[serde(default)]
        is_only_file: bool,
        #[serde(default)]
        only_relay: bool,
        /// Largest area the controller can display; -1 disables adaptive
        /// resolution.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        control_max_width: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        control_max_height: Option<i32>,
    },
    #[serde(rename = "offer")]
    Offer {
        role: Role,
        sender: String,
        receiver: String,
        /// SDP text.
        data: String,
    },
    #[serde(rename = "answer")]
    Answer {
        role: Role,
        sender: String,
        receiver: String,
        data: String,
    },
    #[serde(rename = "candidate")]
    Candidate {
        role: Role,
        sender: String,
        receiver: String,
        /// Candidate line.
        data: String,
        /// m-section id the candidate belongs to.
        #[serde(default)]
        mid: String,
    },
    /// Hub → peer: a peer came online.
    #[serde(rename = "onlineOne")]
    OnlineOne {
        #[serde(default)]
        sender: String,
        data: OnlinePeer,
    },
    /// Hub → peer: a peer went offline.
    #[serde(rename = "offlineOne")]
    OfflineOne {
        #[serde(default)]
        sender: String,
        data: OnlinePeer,
    },
    /// Hub → peer: full presence snapshot, sent on connect.
    #[serde(rename = "onlineList")]
    OnlineList {
        #[serde(default)]
        sender: String,
        #[serde(default)]
        data: Vec<OnlinePeer>,
    },
    /// Hub- or peer-reported error, e.g. rejected `connect`.
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(default)]
        sender: String,
        #[serde(default)]
        receiver: String,
        #[serde(default)]
        data: String,
    },
}

impl Envelope {
    /// The `sender` id, for routing to a session.
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Connect { sender, .. }
            | Envelope::Offer { sender, .. }
            | Envelope::Answer { sender, .. }
            | Envelope::Candidate { sender, .. }
            | Envelope::OnlineOne { sender, .. }
            | Envelope::OfflineOne { sender, .. }
            | Envelope::OnlineList { sender, .. }
            | Envelope::Error { sender, .. } => sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_envelope_wire_shape() {
        let env = Envelope::Connect {
            role: Role::Ctl,
            sender: "AAA".into(),
            receiver: "BBB".into(),
            receiver_pwd: "0123ABCD".into(),
            fps: 15,
            is_only_file: false,
            only_relay: true,
            control_max_width: Some(1900),
            control_max_height: Some(1050),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"connect""#));
        assert!(json.contains(r#""role":"ctl""#));
        assert!(json.contains(r#""receiver_pwd":"0123ABCD""#));
        assert!(json.contains(r#""control_max_width":1900"#));

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        match parsed {
            Envelope::Connect { fps, only_relay, .. } => {
                assert_eq!(fps, 15);
                assert!(only_relay);
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn connect_without_max_area() {
        // Adaptive resolution off: the controller omits the max-area keys.
        let json = r#"{"type":"connect","role":"ctl","sender":"A","receiver":"B",
                       "receiver_pwd":"P","fps":30,"is_only_file":true,"only_relay":false}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        match env {
            Envelope::Connect {
                control_max_width,
                control_max_height,
                is_only_file,
                ..
            } => {
                assert_eq!(control_max_width, None);
                assert_eq!(control_max_height, None);
                assert!(is_only_file);
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn candidate_carries_mid() {
        let env = Envelope::Candidate {
            role: Role::Cli,
            sender: "A".into(),
            receiver: "B".into(),
            data: "candidate:1 1 UDP 2130706431 192.0.2.1 50000 typ host".into(),
            mid: "video".into(),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"candidate""#));
        assert!(json.contains(r#""mid":"video""#));
    }

    #[test]
    fn online_list_from_hub() {
        let json = r#"{"type":"onlineList","sender":"server",
                       "data":[{"sn":"AAA","name":"host-a"},{"sn":"BBB","name":"host-b"}]}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        match env {
            Envelope::OnlineList { data, .. } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].sn, "AAA");
                assert_eq!(data[1].name, "host-b");
            }
            other => panic!("expected OnlineList, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let json = r#"{"type":"frobnicate","sender":"A"}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn hub_error_with_sparse_fields() {
        let json = r#"{"type":"error","data":"receiver offline"}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        match env {
            Envelope::Error { role, data, .. } => {
                assert!(role.is_none());
                assert_eq!(data, "receiver offline");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn connect_defaults_optional_keys() {
        // A minimal connect parses; the engine substitutes its own fps.
        let json = r#"{"type":"connect","role":"ctl","sender":"A","receiver":"B"}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        match env {
            Envelope::Connect { fps, is_only_file, only_relay, receiver_pwd, .. } => {
                assert_eq!(fps, 0);
                assert!(!is_only_file);
                assert!(!only_relay);
                assert!(receiver_pwd.is_empty());
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }
}
