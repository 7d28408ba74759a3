//! Error types for the pool, its sandboxes and the container runtime.

use thiserror::Error;

/// Failures talking to the container runtime control plane.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to container runtime: {reason}")]
    Connect { reason: String },

    #[error("container runtime request failed: {reason}")]
    Api { reason: String },

    #[error("container {id} not found")]
    NotFound { id: String },

    #[error("container {id} has no private network address")]
    NoAddress { id: String },
}

/// Failures creating, probing or calling into a single sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("sandbox {name} failed health check")]
    HealthCheckFailed { name: String },

    #[error("sandbox request failed: {reason}")]
    Proxy { reason: String },

    #[error("sandbox answered with status {status}")]
    Status { status: u16 },
}

impl SandboxError {
    /// True when the sandbox itself is presumed dead or hung.
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, Self::Proxy { .. } | Self::Status { .. })
    }
}

/// Failures surfaced by the admission controller.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not create sandbox for session {session_id}: {source}")]
    Creation {
        session_id: String,
        #[source]
        source: SandboxError,
    },

    #[error("sandbox creation task for session {session_id} aborted")]
    CreationAborted { session_id: String },

    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Invalid configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level error for the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_failures_are_classified() {
        assert!(SandboxError::Proxy {
            reason: "connection refused".into()
        }
        .is_proxy_failure());
        assert!(SandboxError::Status { status: 502 }.is_proxy_failure());
        assert!(!SandboxError::HealthCheckFailed {
            name: "cr-sess-x".into()
        }
        .is_proxy_failure());
    }

    #[test]
    fn creation_error_mentions_session() {
        let err = PoolError::Creation {
            session_id: "abc".into(),
            source: SandboxError::HealthCheckFailed {
                name: "cr-sess-abc".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"), "got: {}", msg);
        assert!(msg.contains("health check"), "got: {}", msg);
    }
}
