use {
    duet_protocol::{ErrorShape, error_codes},
    duet_store::StoreError,
};

/// Failure kinds surfaced by the gateway. None of them is process-fatal.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing, malformed, expired or wrongly signed credential.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// Conversation creation raced and the winner could not be re-read.
    #[error("conversation creation conflicted: {0}")]
    ConflictRetryable(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Profile lookup failed; presence goes out id-only.
    #[error("presence enrichment degraded: {0}")]
    EnrichmentDegraded(String),
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidIntent(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => error_codes::UNAUTHENTICATED,
            Self::InvalidIntent(_) => error_codes::INVALID_INTENT,
            // Both tell the client to retry the whole send.
            Self::ConflictRetryable(_) | Self::StorageUnavailable(_) => {
                error_codes::STORAGE_UNAVAILABLE
            },
            Self::EnrichmentDegraded(_) => error_codes::INTERNAL,
        }
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape::new(self.code(), self.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidParticipants
            | StoreError::InvalidPage(_)
            | StoreError::ConversationNotFound(_)
            | StoreError::NotParticipant { .. } => Self::InvalidIntent(err.to_string()),
            StoreError::Conflict(pair) => Self::ConflictRetryable(pair),
            StoreError::Database(e) => Self::StorageUnavailable(e.to_string()),
        }
    }
}
