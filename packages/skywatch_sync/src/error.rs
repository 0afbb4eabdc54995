//! Error types and stable error codes for the synchronization core.

/// Errors surfaced by the connection, channel, request and backfill paths.
///
/// `Clone` because a single failure is fanned out to every waiter sharing an
/// in-flight join, connect, or fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("token request for channel {channel} failed: {message}")]
    TokenFetch { channel: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connected but no connection id was issued")]
    MissingConnectionId,

    #[error("join rejected for {topic}: {reason}")]
    JoinRejected { topic: String, reason: String },

    #[error("join timed out for {topic}")]
    JoinTimeout { topic: String },

    #[error("request {request_id} on {topic} timed out after {timeout_ms}ms")]
    RequestTimeout {
        topic: String,
        request_id: String,
        timeout_ms: u64,
    },

    #[error("invalid topic {0:?}: expected <channel>:<event>")]
    InvalidTopic(String),

    #[error("channel {0} is closed")]
    ChannelClosed(String),

    #[error("history fetch failed for {key}: {message}")]
    HistoryFetch { key: String, message: String },

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("background task aborted: {0}")]
    TaskAborted(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TokenFetch { .. } => "token_fetch",
            Self::Transport(_) => "transport",
            Self::MissingConnectionId => "missing_connection_id",
            Self::JoinRejected { .. } => "join_rejected",
            Self::JoinTimeout { .. } => "join_timeout",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::ChannelClosed(_) => "channel_closed",
            Self::HistoryFetch { .. } => "history_fetch",
            Self::Payload(_) => "payload",
            Self::TaskAborted(_) => "task_aborted",
        }
    }

    /// Whether calling the same operation again may succeed without any
    /// change on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TokenFetch { .. }
                | Self::Transport(_)
                | Self::JoinTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::ChannelClosed(_)
                | Self::HistoryFetch { .. }
                | Self::TaskAborted(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Payload(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::TaskAborted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(SyncError::MissingConnectionId.error_code(), "missing_connection_id");
        assert_eq!(
            SyncError::JoinTimeout {
                topic: "entities".into()
            }
            .error_code(),
            "join_timeout"
        );
        assert_eq!(
            SyncError::InvalidTopic("entities".into()).error_code(),
            "invalid_topic"
        );
    }

    #[test]
    fn rejection_is_not_retryable() {
        let rejected = SyncError::JoinRejected {
            topic: "entities".into(),
            reason: "unauthorized".into(),
        };
        assert!(!rejected.is_retryable());
        assert!(
            SyncError::JoinTimeout {
                topic: "entities".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_includes_context() {
        let err = SyncError::RequestTimeout {
            topic: "history:trajectory".into(),
            request_id: "r-1".into(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "request r-1 on history:trajectory timed out after 250ms"
        );
    }

    #[test]
    fn serde_errors_become_payload_errors() {
        let err: SyncError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.error_code(), "payload");
    }
}
