//! Durable storage for two-party conversations and their messages.
//!
//! SQLite (via `sqlx`) holds three tables:
//!
//! - `conversations`: one row per unordered participant pair, enforced by a
//!   unique index on the canonical `(participant_low, participant_high)` key
//! - `messages`: append-only, positioned by a per-conversation `seq`
//! - `users`: display profiles used to enrich presence broadcasts

pub mod conversations;
pub mod db;
pub mod models;
pub mod users;

pub use {
    conversations::{ConversationStore, SqliteConversationStore},
    db::{connect, init},
    models::{
        Conversation, ConversationSummary, LastMessage, Message, MessageKind, ParticipantPair,
        UserProfile,
    },
    users::{SqliteUserDirectory, UserDirectory},
};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a private conversation needs two distinct, non-empty participants")]
    InvalidParticipants,

    #[error("invalid page request: {0}")]
    InvalidPage(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("{sender_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        conversation_id: String,
        sender_id: String,
    },

    /// The uniqueness constraint fired but the winning row could not be read back.
    #[error("conversation between {0} was created concurrently and could not be re-read")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}
