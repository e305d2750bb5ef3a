//! Defines the WebSocket message protocol between the client and the API server.

use lexis_core::{lexical::TargetLexicalItem, mode::ModeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announces the participant. This must be the first message.
    Join {
        identity: String,
        #[serde(default)]
        name: Option<String>,
        /// Structured metadata, either as a JSON string or as an object.
        #[serde(default)]
        metadata: Option<Value>,
        #[serde(default)]
        attributes: HashMap<String, String>,
    },
    /// Late metadata for a participant whose mode is still pending.
    UpdateParticipant {
        #[serde(default)]
        metadata: Option<Value>,
        #[serde(default)]
        attributes: HashMap<String, String>,
    },
    /// A completed, transcribed user utterance.
    UserTurn { text: String },
    /// Acknowledges a server `rpc` frame.
    RpcResponse {
        id: u64,
        #[serde(default)]
        payload: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Normalizes metadata to the raw JSON string the router expects.
pub fn metadata_string(metadata: Option<Value>) -> Option<String> {
    match metadata? {
        Value::Null => None,
        Value::String(raw) => Some(raw),
        other => Some(other.to_string()),
    }
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The participant's practice mode has been resolved.
    Joined {
        session_id: Uuid,
        mode: ModeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<TargetLexicalItem>,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_persona: Option<Value>,
    },
    /// Metadata was missing or unreadable; the server will try again.
    AwaitingMetadata { attempt: u32, max_attempts: u32 },
    /// Reports a fatal error to the client.
    Error { message: String },
    /// Signals the beginning of a streamed text response from the agent.
    ResponseStart,
    /// A chunk of a streamed text response.
    ResponseChunk { chunk: String },
    /// Signals the end of a streamed text response.
    ResponseEnd,
    /// Pushes the target item after a sense was explained.
    ProgressUpdate { item: TargetLexicalItem },
    /// A request the client must answer with `rpc_response`.
    Rpc {
        id: u64,
        method: String,
        payload: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_accepts_string_or_object_metadata() {
        let as_string: ClientMessage = serde_json::from_str(
            r#"{"type": "join", "identity": "student-1", "metadata": "{\"activityType\":\"voice\"}"}"#,
        )
        .unwrap();
        let as_object: ClientMessage = serde_json::from_str(
            r#"{"type": "join", "identity": "student-1", "metadata": {"activityType": "voice"}}"#,
        )
        .unwrap();

        for msg in [as_string, as_object] {
            let ClientMessage::Join { metadata, .. } = msg else {
                panic!("expected join");
            };
            let raw = metadata_string(metadata).unwrap();
            let value: Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(value, json!({"activityType": "voice"}));
        }
    }

    #[test]
    fn test_join_defaults() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "join", "identity": "student-1"}"#).unwrap();
        let ClientMessage::Join {
            name,
            metadata,
            attributes,
            ..
        } = msg
        else {
            panic!("expected join");
        };
        assert!(name.is_none());
        assert!(metadata_string(metadata).is_none());
        assert!(attributes.is_empty());
    }

    #[test]
    fn test_rpc_response_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "rpc_response", "id": 7, "error": "denied"}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::RpcResponse { id: 7, error: Some(ref e), .. } if e == "denied"
        ));
    }

    #[test]
    fn test_server_message_tags() {
        let rpc = ServerMessage::Rpc {
            id: 1,
            method: "show_toast".into(),
            payload: "{}".into(),
        };
        assert_eq!(
            serde_json::to_value(&rpc).unwrap(),
            json!({"type": "rpc", "id": 1, "method": "show_toast", "payload": "{}"})
        );

        let waiting = ServerMessage::AwaitingMetadata {
            attempt: 2,
            max_attempts: 5,
        };
        assert_eq!(
            serde_json::to_value(&waiting).unwrap(),
            json!({"type": "awaiting_metadata", "attempt": 2, "max_attempts": 5})
        );

        let joined = ServerMessage::Joined {
            session_id: Uuid::nil(),
            mode: ModeKind::RolePlay,
            target: None,
            voice_persona: None,
        };
        let value = serde_json::to_value(&joined).unwrap();
        assert_eq!(value["mode"], json!("role_play"));
        assert!(value.get("target").is_none());
    }
}
