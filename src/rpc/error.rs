//! Error types for the RouterOS RPC client.

use thiserror::Error;

/// Coarse error classification used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket failed to open, write failed, or the connection went away.
    Transport,
    /// No response within the request budget.
    Timeout,
    /// Malformed envelope or unusable endpoint.
    Protocol,
    /// The remote service answered with `success: false`.
    Application,
}

/// RPC client error types.
///
/// `Clone` so a single connection attempt can report the same outcome to
/// every caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The socket could not be opened.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The socket did not open within the connect budget.
    #[error("Connection timed out after {0}ms")]
    ConnectTimeout(u64),

    /// No connection and no target to reconnect to.
    #[error("Not connected")]
    NotConnected,

    /// The connection was torn down while the request was outstanding.
    #[error("Connection closed: {0}")]
    Disconnected(String),

    /// No response arrived within the request budget.
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Writing to the socket failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Envelope could not be encoded or the response was unusable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The router service reported a failure for this request.
    #[error("Router error: {0}")]
    Application(String),

    /// The target key could not be turned into a socket URL.
    #[error("Invalid endpoint: {0}")]
    Endpoint(String),
}

impl RpcError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::ConnectionFailed(_)
            | RpcError::ConnectTimeout(_)
            | RpcError::NotConnected
            | RpcError::Disconnected(_)
            | RpcError::Transport(_) => ErrorKind::Transport,
            RpcError::Timeout(_) => ErrorKind::Timeout,
            RpcError::Protocol(_) | RpcError::Endpoint(_) => ErrorKind::Protocol,
            RpcError::Application(_) => ErrorKind::Application,
        }
    }

    /// True for request timeouts (not connect timeouts).
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }

    /// Whether `send` should retry after this error.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
            && !matches!(self, RpcError::NotConnected)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                RpcError::Disconnected(err.to_string())
            }
            WsError::Io(ref io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                RpcError::ConnectionFailed(err.to_string())
            }
            WsError::Url(_) => RpcError::Endpoint(err.to_string()),
            _ => RpcError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Protocol(err.to_string())
    }
}
