// Copyright 2025-2026 CEMAXECUTER LLC

use serde::Deserialize;
use serde_json::json;

/// Text messages the server sends. Every message carries a `type` field;
/// unrecognized types are tolerated and ignored upstream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Legacy transport: base64-encoded big-endian int16 I/Q pairs.
    #[serde(rename = "audio")]
    Audio { data: String },

    #[serde(rename = "status")]
    Status {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        frequency: Option<u64>,
        mode: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(other)]
    Unknown,
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("bad server message: {}", e))
}

/// Retune command. `mode` and the bandwidth pair are only sent when given;
/// IQ sessions tune with the frequency alone.
pub fn tune_message(
    frequency: u64,
    mode: Option<&str>,
    bandwidth: Option<(i32, i32)>,
) -> String {
    let mut msg = json!({
        "type": "tune",
        "frequency": frequency,
    });
    if let Some(mode) = mode {
        msg["mode"] = json!(mode);
    }
    if let Some((low, high)) = bandwidth {
        msg["bandwidthLow"] = json!(low);
        msg["bandwidthHigh"] = json!(high);
    }
    msg.to_string()
}

/// Application-level keepalive.
pub fn ping_message() -> String {
    json!({"type": "ping"}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let msg = parse_server_message(
            r#"{"type":"status","sessionId":"abc-123","frequency":14074000,"mode":"iq96"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Status {
                session_id,
                frequency,
                mode,
            } => {
                assert_eq!(session_id.as_deref(), Some("abc-123"));
                assert_eq!(frequency, Some(14_074_000));
                assert_eq!(mode.as_deref(), Some("iq96"));
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_pong_and_error() {
        assert!(matches!(
            parse_server_message(r#"{"type":"pong"}"#).unwrap(),
            ServerMessage::Pong
        ));
        match parse_server_message(r#"{"type":"error","error":"quota"}"#).unwrap() {
            ServerMessage::Error { error } => assert_eq!(error.as_deref(), Some("quota")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_tolerated() {
        assert!(matches!(
            parse_server_message(r#"{"type":"waterfall","bins":[]}"#).unwrap(),
            ServerMessage::Unknown
        ));
    }

    #[test]
    fn test_missing_type_rejected() {
        assert!(parse_server_message(r#"{"frequency":7074000}"#).is_err());
    }

    #[test]
    fn test_tune_message_fields() {
        let msg: serde_json::Value =
            serde_json::from_str(&tune_message(14_080_000, None, None)).unwrap();
        assert_eq!(msg["type"], "tune");
        assert_eq!(msg["frequency"], 14_080_000u64);
        assert!(msg.get("mode").is_none());

        let msg: serde_json::Value =
            serde_json::from_str(&tune_message(7_074_000, Some("usb"), Some((50, 2700)))).unwrap();
        assert_eq!(msg["mode"], "usb");
        assert_eq!(msg["bandwidthLow"], 50);
        assert_eq!(msg["bandwidthHigh"], 2700);
    }

    #[test]
    fn test_ping_message() {
        let msg: serde_json::Value = serde_json::from_str(&ping_message()).unwrap();
        assert_eq!(msg["type"], "ping");
    }
}
