//! Wire frames for the per-message streaming channel.
//!
//! One WebSocket carries JSON text frames for a single message id. Client
//! frames are subscribe/unsubscribe/ping; server frames are acks, pongs, and
//! open-schema execution updates.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { message_id: String },
    Unsubscribe { message_id: String },
    Ping,
}

/// Partial execution record carried by an update frame.
///
/// The backend evolves this schema freely; only the message id and the two
/// monotonic flags are interpreted here. Everything else (message, code,
/// stdout, stderr, logging, files, ...) passes through in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_streamable: Option<bool>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl ExecutionUpdate {
    /// Empty update for a message id.
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ..Self::default()
        }
    }

    /// Set one passthrough field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Mark the update as carrying the completion flag.
    #[must_use]
    pub fn completed(mut self) -> Self {
        self.is_complete = Some(true);
        self
    }

    /// Mark the update as carrying the streamable flag.
    #[must_use]
    pub fn streamable(mut self) -> Self {
        self.is_streamable = Some(true);
        self
    }
}

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished {
        message_id: String,
        #[serde(default)]
        status: Option<String>,
    },
    Subscription {
        message_id: String,
        #[serde(default)]
        status: Option<String>,
    },
    Unsubscription {
        message_id: String,
        #[serde(default)]
        status: Option<String>,
    },
    Pong,
    Update(ExecutionUpdate),
    /// Frame types this client does not understand are tolerated and skipped.
    #[serde(other)]
    Unknown,
}

/// Parse one inbound text frame.
pub fn parse_server_frame(text: &str) -> Result<ServerFrame> {
    serde_json::from_str(text)
        .map_err(|error| ClientError::Protocol(format!("invalid server frame: {error}")))
}

/// Encode one outbound frame as JSON text.
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_encode_with_snake_case_tag() -> Result<()> {
        let subscribe = encode_client_frame(&ClientFrame::Subscribe {
            message_id: "msg-1".to_string(),
        })?;
        assert_eq!(
            serde_json::from_str::<Value>(&subscribe)?,
            json!({"type": "subscribe", "message_id": "msg-1"})
        );

        let ping = encode_client_frame(&ClientFrame::Ping)?;
        assert_eq!(serde_json::from_str::<Value>(&ping)?, json!({"type": "ping"}));
        Ok(())
    }

    #[test]
    fn parse_known_server_frames() -> Result<()> {
        let established = parse_server_frame(
            r#"{"type":"connection_established","message_id":"msg-1","status":"connected"}"#,
        )?;
        assert_eq!(
            established,
            ServerFrame::ConnectionEstablished {
                message_id: "msg-1".to_string(),
                status: Some("connected".to_string()),
            }
        );

        let pong = parse_server_frame(r#"{"type":"pong"}"#)?;
        assert_eq!(pong, ServerFrame::Pong);

        let subscription =
            parse_server_frame(r#"{"type":"subscription","message_id":"msg-1","status":"subscribed"}"#)?;
        assert!(matches!(subscription, ServerFrame::Subscription { .. }));
        Ok(())
    }

    #[test]
    fn update_frame_keeps_unknown_fields() -> Result<()> {
        let frame = parse_server_frame(
            r#"{"type":"update","message_id":"msg-1","stdout":"hello","files":["a.txt"],"is_streamable":true}"#,
        )?;
        let ServerFrame::Update(update) = frame else {
            return Err(ClientError::Internal("expected update frame".to_string()));
        };
        assert_eq!(update.message_id, "msg-1");
        assert_eq!(update.is_streamable, Some(true));
        assert_eq!(update.is_complete, None);
        assert_eq!(update.fields.get("stdout"), Some(&json!("hello")));
        assert_eq!(update.fields.get("files"), Some(&json!(["a.txt"])));
        Ok(())
    }

    #[test]
    fn update_roundtrip_flattens_fields() -> Result<()> {
        let update = ExecutionUpdate::new("msg-1")
            .with_field("stdout", json!("out"))
            .completed();
        let encoded = serde_json::to_value(ServerFrame::Update(update.clone()))?;
        assert_eq!(
            encoded,
            json!({"type": "update", "message_id": "msg-1", "is_complete": true, "stdout": "out"})
        );

        let decoded = parse_server_frame(&encoded.to_string())?;
        assert_eq!(decoded, ServerFrame::Update(update));
        Ok(())
    }

    #[test]
    fn unknown_frame_type_is_tolerated() -> Result<()> {
        let frame = parse_server_frame(r#"{"type":"server_gossip","payload":42}"#)?;
        assert_eq!(frame, ServerFrame::Unknown);
        Ok(())
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for input in ["not json", "[]", r#"{"message_id":"msg-1"}"#] {
            let result = parse_server_frame(input);
            assert!(
                matches!(result, Err(ClientError::Protocol(_))),
                "expected protocol error for {input:?}"
            );
        }
    }
}
