use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("authentication against {url} failed: {reason}")]
    Auth { url: String, reason: String },

    #[error("{endpoint} returned {status}: {body}")]
    Remote {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}")]
    Subprocess { program: String, code: Option<i32> },

    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("watch error on {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RouterError {
    pub fn remote(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        RouterError::Remote {
            endpoint: endpoint.into(),
            status,
            body: body.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        RouterError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Only startup failures (bad credentials, bad configuration) are fatal; everything else is
    /// retried on the next cycle.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RouterError::Auth { .. } | RouterError::Config(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RouterError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_failures_are_not_retryable() {
        let auth = RouterError::Auth {
            url: "http://hot:8080".into(),
            reason: "Fails.".into(),
        };
        assert!(!auth.is_retryable());
        assert!(!RouterError::Config("same paths".into()).is_retryable());

        assert!(RouterError::remote("/api/v2/torrents/info", 500, "boom").is_retryable());
        assert!(
            RouterError::Subprocess {
                program: "rsync".into(),
                code: Some(23),
            }
            .is_retryable()
        );
        assert!(RouterError::timeout("stop", Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn remote_error_carries_status_and_body() {
        let err = RouterError::remote("/api/v2/torrents/add", 415, "Torrent file is not valid");
        assert_eq!(
            err.to_string(),
            "/api/v2/torrents/add returned 415: Torrent file is not valid"
        );
    }
}
