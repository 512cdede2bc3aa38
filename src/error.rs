use thiserror::Error;

/// Failures of the mailbox synchronization pipeline.
///
/// Only `AuthUnavailable` aborts a whole sync; the others are scoped to a
/// single page or message and get counted in the `SyncReport`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no usable mailbox credential for user {user_id}: {reason}")]
    AuthUnavailable { user_id: String, reason: String },

    #[error("cannot fetch {target}: {reason}")]
    FetchFailed { target: String, reason: String },

    #[error("message {0} no longer exists in the mailbox")]
    NotFound(String),

    #[error("cannot reconcile message {message_id}")]
    Reconcile {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    pub fn auth_unavailable(user_id: &str, reason: impl Into<String>) -> Self {
        Self::AuthUnavailable {
            user_id: user_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn fetch_failed(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::FetchFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}
