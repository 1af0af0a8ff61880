use serde::{Deserialize, Serialize};

/// Bumped when a message shape changes incompatibly. Sent in the `Hello`
/// message so clients can detect a mismatched server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages the server pushes to connected clients. One discrete JSON text
/// frame per message, tagged by `type` for forward-compatible evolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once right after the connection is accepted.
    Hello { session_id: String, version: u32 },
    /// Authoritative playback state; sent only when it changed.
    Playback {
        track_id: String,
        position: f64,
        is_playing: bool,
    },
    /// Liveness probe; any inbound frame counts as the acknowledgement.
    Probe { token: u64 },
}

/// Messages clients send to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Client-side keepalive; the token is opaque to the server.
    Ping { token: u64 },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_message_is_tagged() {
        let msg = ServerMessage::Playback {
            track_id: "abc".to_string(),
            position: 42.5,
            is_playing: true,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "playback");
        assert_eq!(json["position"], 42.5);
        assert_eq!(json["is_playing"], true);
    }

    #[test]
    fn ping_round_trips() {
        let text = r#"{"type":"ping","token":7}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg, ClientMessage::Ping { token: 7 });
    }

    #[test]
    fn unknown_message_type_is_a_parse_error() {
        let text = r#"{"type":"future_thing","data":1}"#;
        assert!(serde_json::from_str::<ClientMessage>(text).is_err());
    }
}
