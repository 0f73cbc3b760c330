//! Error types for the worker bridge.
//!
//! Every fallible operation in the crate returns [`BridgeError`]. The
//! variants mirror the failure taxonomy of the bridge: startup failures are
//! fatal to `start()`, per-call failures only affect that call, and socket
//! disconnections never surface directly (they trigger recovery instead).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::RpcErrorObject;

/// Crate-wide result alias.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Bridge error taxonomy.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker never printed its port announcement.
    #[error("Worker did not announce a port within {}ms", .0.as_millis())]
    StartupTimeout(Duration),

    /// The worker exited (or closed stdout) before announcing a port.
    #[error("Worker failed to start: {0}")]
    ProcessLaunch(String),

    /// The worker executable could not be spawned at all.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Connecting to the worker socket failed after all retries.
    #[error("Connection to {addr} failed after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A frame could not be decoded. Never fatal to the stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response arrived within the call's budget.
    #[error("Request {id} timed out after {}ms", .after.as_millis())]
    Timeout { id: String, after: Duration },

    /// The worker answered with an error envelope.
    #[error("Worker error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The connection was closed while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Automatic recovery is exhausted or took too long.
    #[error("Worker unavailable: {0}")]
    Unavailable(String),

    /// `call()` was used before `start()`.
    #[error("Bridge not started")]
    NotStarted,

    /// The bridge has been stopped.
    #[error("Bridge stopped")]
    Stopped,

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl BridgeError {
    /// Whether the failure is transient and the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. }
                | BridgeError::ConnectionClosed
                | BridgeError::Unavailable(_)
                | BridgeError::ConnectionFailed { .. }
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => BridgeError::ConnectionClosed,
            _ => BridgeError::Io(err),
        }
    }
}

impl From<RpcErrorObject> for BridgeError {
    fn from(err: RpcErrorObject) -> Self {
        BridgeError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_display() {
        let timeout = BridgeError::Timeout {
            id: "req_7".to_string(),
            after: Duration::from_secs(180),
        };
        assert_eq!(timeout.to_string(), "Request req_7 timed out after 180000ms");

        let remote = BridgeError::Remote {
            code: 1101,
            message: "Invalid market".to_string(),
            data: None,
        };
        assert_eq!(remote.to_string(), "Worker error 1101: Invalid market");

        let startup = BridgeError::StartupTimeout(Duration::from_secs(10));
        assert_eq!(
            startup.to_string(),
            "Worker did not announce a port within 10000ms"
        );

        assert_eq!(BridgeError::ConnectionClosed.to_string(), "Connection closed");
    }

    #[test]
    fn test_bridge_error_from_io() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(BridgeError::from(reset), BridgeError::ConnectionClosed));

        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(BridgeError::from(pipe), BridgeError::ConnectionClosed));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        assert!(matches!(BridgeError::from(other), BridgeError::Io(_)));
    }

    #[test]
    fn test_bridge_error_from_rpc_error() {
        let rpc = RpcErrorObject {
            code: -32601,
            message: "Method not found: nope".to_string(),
            data: Some(serde_json::json!({"method": "nope"})),
        };

        match BridgeError::from(rpc) {
            BridgeError::Remote {
                code,
                message,
                data,
            } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found: nope");
                assert!(data.is_some());
            }
            other => panic!("Expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::ConnectionClosed.is_retryable());
        assert!(BridgeError::Unavailable("down".into()).is_retryable());
        assert!(!BridgeError::Stopped.is_retryable());
        assert!(!BridgeError::Remote {
            code: 1,
            message: "x".into(),
            data: None
        }
        .is_retryable());
    }
}
