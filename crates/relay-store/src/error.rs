use relay_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Another orchestration holds this session's lock.
    #[error("session busy: {0}")]
    Busy(SessionId),

    /// The session outlived its TTL and was evicted by this lookup.
    #[error("session expired: {0}")]
    Expired(SessionId),
}

impl StoreError {
    /// True for both a missing and an expired session: either way it is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Expired(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "session_not_found",
            Self::Busy(_) => "session_busy",
            Self::Expired(_) => "session_expired",
        }
    }
}
