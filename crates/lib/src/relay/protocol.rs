//! Relay WebSocket protocol: `{ "event": <name>, "payload": { ... } }` frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a connection announces with `identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Chatbot,
    Portal,
}

/// Image attached to `send_message`: base64 or a data URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub data: String,
    #[serde(default = "default_image_mime")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_image_mime() -> String {
    "image/png".to_string()
}

/// Client -> server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    Identify {
        #[serde(rename = "type")]
        role: ClientRole,
    },
    SendMessage {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        images: Vec<ImagePayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    ClearHistory {},
    RequestHelp {
        #[serde(default)]
        message: String,
    },
    TranscribeAudio {
        audio: String,
        #[serde(default = "default_audio_mime")]
        mime_type: String,
    },
}

fn default_audio_mime() -> String {
    "audio/webm".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no event name")]
    MissingEvent,
}

impl ClientEvent {
    /// Parse one text frame. A missing or null payload is read as `{}`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut frame: serde_json::Value = serde_json::from_str(text)?;
        let obj = frame.as_object_mut().ok_or(ProtocolError::MissingEvent)?;
        if !obj.get("event").is_some_and(|e| e.is_string()) {
            return Err(ProtocolError::MissingEvent);
        }
        if obj.get("payload").map_or(true, |p| p.is_null()) {
            obj.insert("payload".to_string(), serde_json::json!({}));
        }
        Ok(serde_json::from_value(frame)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Identify { .. } => "identify",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::ClearHistory {} => "clear_history",
            ClientEvent::RequestHelp { .. } => "request_help",
            ClientEvent::TranscribeAudio { .. } => "transcribe_audio",
        }
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server -> client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    SessionInitialized {
        session_id: String,
        socket_id: String,
        history_length: usize,
    },
    PortalStatus {
        connected: bool,
    },
    BotReply {
        reply: String,
        provider: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<bool>,
    },
    SessionUpdated {
        session_id: String,
        last_message: String,
        provider: String,
    },
    HelpRequest {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
        chatbot_socket_id: String,
    },
    HistoryCleared {},
    PortalNotification {
        message: String,
        timestamp: DateTime<Utc>,
    },
    TranscriptionResult {
        transcript: String,
    },
    TranscriptionError {
        error: String,
    },
    Shutdown {},
}

impl ServerEvent {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_identify_and_send_message() {
        let ev = ClientEvent::parse(r#"{"event":"identify","payload":{"type":"portal"}}"#).unwrap();
        assert_eq!(ev, ClientEvent::Identify { role: ClientRole::Portal });

        let ev = ClientEvent::parse(
            r#"{"event":"send_message","payload":{"prompt":"hi","images":[{"data":"QUJD","mimeType":"image/jpeg"}],"provider":"claude"}}"#,
        )
        .unwrap();
        let ClientEvent::SendMessage { prompt, images, provider } = ev else {
            panic!("expected send_message");
        };
        assert_eq!(prompt, "hi");
        assert_eq!(images[0].mime_type, "image/jpeg");
        assert_eq!(images[0].name, None);
        assert_eq!(provider.as_deref(), Some("claude"));
    }

    #[test]
    fn payload_may_be_omitted() {
        let ev = ClientEvent::parse(r#"{"event":"clear_history"}"#).unwrap();
        assert_eq!(ev, ClientEvent::ClearHistory {});
        let ev = ClientEvent::parse(r#"{"event":"clear_history","payload":null}"#).unwrap();
        assert_eq!(ev.name(), "clear_history");
    }

    #[test]
    fn rejects_unknown_and_malformed_frames() {
        assert!(ClientEvent::parse(r#"{"event":"explode","payload":{}}"#).is_err());
        assert!(ClientEvent::parse(r#"{"payload":{}}"#).is_err());
        assert!(ClientEvent::parse("not json").is_err());
        assert!(ClientEvent::parse(r#"{"event":"identify","payload":{"type":"robot"}}"#).is_err());
    }

    #[test]
    fn server_events_use_camel_case_payloads() {
        let ev = ServerEvent::SessionInitialized {
            session_id: "s1".into(),
            socket_id: "k1".into(),
            history_length: 4,
        };
        let v: serde_json::Value = serde_json::from_str(&ev.to_frame()).unwrap();
        assert_eq!(
            v,
            json!({"event":"session_initialized","payload":{"sessionId":"s1","socketId":"k1","historyLength":4}})
        );

        let ok = ServerEvent::BotReply {
            reply: "r".into(),
            provider: "claude".into(),
            error: None,
        };
        let v: serde_json::Value = serde_json::from_str(&ok.to_frame()).unwrap();
        assert!(v["payload"].get("error").is_none());

        let v: serde_json::Value =
            serde_json::from_str(&ServerEvent::HistoryCleared {}.to_frame()).unwrap();
        assert_eq!(v, json!({"event":"history_cleared","payload":{}}));
    }

    #[test]
    fn server_frames_parse_back() {
        let ev = ServerEvent::PortalStatus { connected: true };
        assert_eq!(ServerEvent::parse(&ev.to_frame()).unwrap(), ev);
    }
}
