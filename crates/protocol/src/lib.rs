//! Wire protocol for the duet gateway.
//!
//! Every WebSocket text message is one JSON [`Frame`]:
//!
//! - `req`   client → server intent (`declare-online`, `send-message`, ...)
//! - `res`   server → client acknowledgment for a request
//! - `event` server → client broadcast (`new-message`, `typing`, ...)

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

// ── Names ────────────────────────────────────────────────────────────────────

/// Client → server intent names.
pub mod intents {
    pub const DECLARE_ONLINE: &str = "declare-online";
    pub const JOIN_CHANNEL: &str = "join-channel";
    pub const LEAVE_CHANNEL: &str = "leave-channel";
    pub const SEND_MESSAGE: &str = "send-message";
    pub const TYPING: &str = "typing";

    pub const ALL: &[&str] = &[DECLARE_ONLINE, JOIN_CHANNEL, LEAVE_CHANNEL, SEND_MESSAGE, TYPING];
}

/// Server → client event names.
pub mod events {
    pub const ONLINE_USER_LIST: &str = "online-user-list";
    pub const NEW_MESSAGE: &str = "new-message";
    pub const TYPING: &str = "typing";
}

pub mod error_codes {
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const INVALID_INTENT: &str = "INVALID_INTENT";
    pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

impl Frame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Failed response that still carries a payload (e.g. a negative send ack).
    pub fn err_with_payload(id: &str, error: ErrorShape, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::err(id, error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: serde_json::Value,
    pub seq: u64,
}

// ── Intent params ────────────────────────────────────────────────────────────
//
// Every field is optional on the wire so that a missing field surfaces as an
// INVALID_INTENT acknowledgment instead of a parse failure.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareOnlineParams {
    pub user_id: Option<String>,
}

/// Params of `join-channel` and `leave-channel`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelParams {
    #[serde(alias = "userId")]
    pub self_id: Option<String>,
    #[serde(alias = "recipientId")]
    pub other_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub content: Option<String>,
    #[serde(alias = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingParams {
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub is_typing: Option<bool>,
}

// ── Event / ack payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl OnlineUser {
    pub fn id_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUserList {
    pub users: Vec<OnlineUser>,
    /// True when profile lookup failed and `users` carries ids only.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub kind: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub sender_id: String,
    pub is_typing: bool,
}

/// Acknowledgment payload of `send-message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl SendAck {
    pub fn sent(event: &NewMessageEvent) -> Self {
        Self {
            success: true,
            message: "Message sent".into(),
            id: Some(event.id.clone()),
            conversation_id: Some(event.conversation_id.clone()),
            created_at: Some(event.created_at),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            id: None,
            conversation_id: None,
            created_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[test]
    fn parses_request_frame() {
        let frame = Frame::parse(
            r#"{"type":"req","id":"1","method":"send-message","params":{"senderId":"a","recipientId":"b","content":"hi"}}"#,
        )
        .unwrap();
        let Frame::Req(req) = frame else {
            panic!("expected request frame");
        };
        assert_eq!(req.method, intents::SEND_MESSAGE);
        let params: SendMessageParams = serde_json::from_value(req.params).unwrap();
        assert_eq!(params.sender_id.as_deref(), Some("a"));
        assert_eq!(params.recipient_id.as_deref(), Some("b"));
        assert!(params.kind.is_none());
    }

    #[test]
    fn request_without_params_defaults_to_null() {
        let Frame::Req(req) = Frame::parse(r#"{"type":"req","id":"x","method":"typing"}"#).unwrap()
        else {
            panic!("expected request frame");
        };
        assert!(req.params.is_null());
    }

    #[rstest]
    #[case(r#"{"selfId":"a","otherId":"b"}"#)]
    #[case(r#"{"userId":"a","recipientId":"b"}"#)]
    fn channel_params_accept_both_spellings(#[case] raw: &str) {
        let params: ChannelParams = serde_json::from_str(raw).unwrap();
        assert_eq!(params.self_id.as_deref(), Some("a"));
        assert_eq!(params.other_id.as_deref(), Some("b"));
    }

    #[test]
    fn send_params_accept_type_alias() {
        let params: SendMessageParams =
            serde_json::from_value(json!({"senderId":"a","recipientId":"b","content":"x","type":"image"}))
                .unwrap();
        assert_eq!(params.kind.as_deref(), Some("image"));
    }

    #[test]
    fn response_frame_omits_absent_fields() {
        let text = Frame::Res(ResponseFrame::ok("7", json!({"success": true})))
            .to_text()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "res");
        assert_eq!(value["ok"], true);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn send_ack_is_camel_case() {
        let event = NewMessageEvent {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
            content: "hi".into(),
            kind: "text".into(),
            created_at: 42,
        };
        let value = serde_json::to_value(SendAck::sent(&event)).unwrap();
        assert_eq!(
            value,
            json!({
                "success": true,
                "message": "Message sent",
                "id": "m1",
                "conversationId": "c1",
                "createdAt": 42,
            })
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(Frame::parse(r#"{"type":"hello","id":"1"}"#).is_err());
    }
}
