use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Message kind ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Participants ─────────────────────────────────────────────────────────────

/// The unordered participant pair in canonical (sorted) order.
///
/// Both the uniqueness constraint and lookups go through this form, so
/// `{a, b}` and `{b, a}` always address the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: String,
    high: String,
}

impl ParticipantPair {
    /// `None` when either id is empty or both are the same user.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        if a.is_empty() || b.is_empty() || a == b {
            return None;
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Some(Self {
            low: low.to_string(),
            high: high.to_string(),
        })
    }

    pub fn low(&self) -> &str {
        &self.low
    }

    pub fn high(&self) -> &str {
        &self.high
    }
}

// ── Durable records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Sorted; order carries no meaning.
    pub participant_ids: [String; 2],
    pub is_group: bool,
    pub last_message_id: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<i64>,
    /// Length of the ordered message list (highest `seq` recorded).
    pub message_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// 1-based position in the conversation's append order.
    pub seq: i64,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    /// Epoch milliseconds; non-decreasing along `seq`.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl UserProfile {
    pub fn id_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
        }
    }
}

/// One row of a user's chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub contact: UserProfile,
    pub last_message: Option<LastMessage>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub created_at: i64,
    pub sender_id: Option<String>,
}

// ── Rows ─────────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
pub(crate) struct ConversationRow {
    pub id: String,
    pub participant_low: String,
    pub participant_high: String,
    pub is_group: i32,
    pub last_message_id: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<i64>,
    pub message_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<ConversationRow> for Conversation {
    fn from(r: ConversationRow) -> Self {
        Self {
            id: r.id,
            participant_ids: [r.participant_low, r.participant_high],
            is_group: r.is_group != 0,
            last_message_id: r.last_message_id,
            last_message_text: r.last_message_text,
            last_message_at: r.last_message_at,
            message_count: r.message_count,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub sender_id: String,
    pub content: String,
    pub kind: String,
    pub created_at: i64,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        let kind = MessageKind::parse(&r.kind).unwrap_or_else(|| {
            tracing::warn!(message_id = %r.id, kind = %r.kind, "unknown message kind in storage");
            MessageKind::default()
        });
        Self {
            id: r.id,
            conversation_id: r.conversation_id,
            seq: r.seq,
            sender_id: r.sender_id,
            content: r.content,
            kind,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SummaryRow {
    pub id: String,
    pub updated_at: i64,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<i64>,
    pub contact_id: String,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub last_sender_id: Option<String>,
}

impl From<SummaryRow> for ConversationSummary {
    fn from(r: SummaryRow) -> Self {
        let last_message = match (r.last_message_text, r.last_message_at) {
            (Some(content), Some(created_at)) => Some(LastMessage {
                content,
                created_at,
                sender_id: r.last_sender_id,
            }),
            _ => None,
        };
        Self {
            conversation_id: r.id,
            contact: UserProfile {
                id: r.contact_id,
                name: r.contact_name,
                email: r.contact_email,
            },
            last_message,
            updated_at: r.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_order_independent() {
        assert_eq!(
            ParticipantPair::new("bob", "alice"),
            ParticipantPair::new("alice", "bob")
        );
        let pair = ParticipantPair::new("bob", "alice").unwrap();
        assert_eq!(pair.low(), "alice");
        assert_eq!(pair.high(), "bob");
    }

    #[test]
    fn pair_rejects_self_and_empty() {
        assert!(ParticipantPair::new("alice", "alice").is_none());
        assert!(ParticipantPair::new("", "bob").is_none());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [MessageKind::Text, MessageKind::Image, MessageKind::File] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("video"), None);
    }
}
