use std::time::Duration;
use thiserror::Error;

/// Failures of the durable backend. A draw that hits any of these
/// never became visible.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Revision conflict on bucket '{bucket}': expected {expected:?}")]
    RevisionConflict { bucket: String, expected: Option<u64> },

    #[error("Corrupt record in bucket '{bucket}': {detail}")]
    Corrupt { bucket: String, detail: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, PersistenceError>;

#[derive(Error, Debug)]
pub enum DrawError {
    #[error("Invalid probability config: {reason}")]
    InvalidConfig { reason: String },

    #[error("Bucket '{bucket}' has no eligible closer")]
    BucketExhausted { bucket: String },

    #[error("Cooldown active for actor '{actor_id}' in tier '{tier}': retry in {remaining_seconds}s")]
    CooldownActive {
        actor_id:          String,
        tier:              String,
        remaining_seconds: u64,
    },

    #[error("Bucket '{bucket}' is busy: lock not acquired within {waited_ms}ms")]
    DrawBusy { bucket: String, waited_ms: u64 },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type CoreResult<T> = Result<T, DrawError>;

/// Who a rejected call should be surfaced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// "Try again shortly" messaging in the booking flow.
    EndUser,
    /// Operational fault for administrators.
    Operator,
}

impl DrawError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }

    /// Minimum wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CooldownActive { remaining_seconds, .. } => {
                Some(Duration::from_secs(*remaining_seconds))
            }
            _ => None,
        }
    }

    /// Whether calling again (possibly after backoff) can succeed
    /// without admin action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CooldownActive { .. } | Self::DrawBusy { .. } | Self::Persistence(_)
        )
    }

    pub fn audience(&self) -> Audience {
        match self {
            Self::CooldownActive { .. } | Self::DrawBusy { .. } => Audience::EndUser,
            Self::InvalidConfig { .. }
            | Self::BucketExhausted { .. }
            | Self::Persistence(_) => Audience::Operator,
        }
    }
}
