//! Error types for the log tail client.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the key-value store holding the cluster credentials.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller is not allowed to read the record.
    #[error("permission denied by credential store: {0}")]
    PermissionDenied(String),

    /// The store could not be reached or the response body was unreadable.
    #[error("credential store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with an unexpected status.
    #[error("credential store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The store answered with a body we could not interpret.
    #[error("invalid credential store response: {0}")]
    InvalidResponse(String),

    /// Obtaining an access token for the store failed.
    #[error("credential store authentication failed: {0}")]
    Auth(String),
}

/// A failed `ReadOutput` call. Always treated as transient by the poller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the log tail client.
#[derive(Debug, Error)]
pub enum LogTailError {
    /// The well-known credential record does not exist in the store.
    #[error("credential record {kind}/{name} not found")]
    CredentialNotFound { kind: String, name: String },

    /// The credential record exists but a required field is missing or unusable.
    #[error("credential field `{field}` is malformed: {reason}")]
    CredentialMalformed { field: &'static str, reason: String },

    /// The credential store failed in a non-transient way.
    #[error(transparent)]
    CredentialStore(#[from] StoreError),

    /// The secure channel could not be constructed.
    #[error("failed to set up channel to {address}: {reason}")]
    ChannelSetup { address: String, reason: String },

    /// Task output was not valid UTF-8.
    #[error("output of task {task_id} near offset {offset} is not valid UTF-8")]
    Decode {
        task_id: String,
        offset: u64,
        #[source]
        source: std::str::Utf8Error,
    },

    /// Transient failures did not clear within the retry policy.
    #[error(
        "gave up reading task {task_id} from {address} at offset {offset} after {attempts} failed attempts"
    )]
    RetriesExhausted {
        address: String,
        task_id: String,
        offset: u64,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// Writing rendered output failed.
    #[error("failed to render output of task {task_id}")]
    Sink {
        task_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LogTailError {
    /// Whether the error stems from an environment that was never bootstrapped
    /// correctly (as opposed to a runtime failure).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LogTailError::CredentialNotFound { .. }
                | LogTailError::CredentialMalformed { .. }
                | LogTailError::CredentialStore(_)
                | LogTailError::ChannelSetup { .. }
                | LogTailError::Config(_)
        )
    }
}

pub type Result<T, E = LogTailError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_carries_context() {
        let err = LogTailError::RetriesExhausted {
            address: "10.0.0.4:6032".to_string(),
            task_id: "job-1.3".to_string(),
            offset: 4096,
            attempts: 7,
            source: TransportError::Timeout(Duration::from_secs(30)),
        };
        let message = err.to_string();
        assert!(message.contains("10.0.0.4:6032"));
        assert!(message.contains("job-1.3"));
        assert!(message.contains("4096"));
        assert!(message.contains('7'));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_classification() {
        let err = LogTailError::CredentialNotFound {
            kind: "ClusterKeys".to_string(),
            name: "sparklespray".to_string(),
        };
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "credential record ClusterKeys/sparklespray not found"
        );

        let err = LogTailError::CredentialStore(StoreError::PermissionDenied("nope".into()));
        assert!(err.is_configuration());
    }
}
