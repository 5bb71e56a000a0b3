//! Error taxonomy for the collaboration sync layer.
//!
//! Every failure is scoped to the operation that triggered it — nothing here
//! is treated as fatal for the client process. Presence broadcast failures
//! are logged and swallowed at the call site; operation apply failures are
//! the one category callers are expected to handle.

/// Errors surfaced by the collaboration sync layer.
#[derive(Debug, Clone)]
pub enum CollabError {
    /// Credential endpoint unreachable or rejected the request.
    TokenFetch(String),
    /// No connect acknowledgement arrived within the configured timeout.
    ConnectionTimeout,
    /// Handshake rejected by the server for credential reasons.
    Auth(String),
    /// Connection could not be established (transport-level failure).
    Handshake(String),
    /// `send` was called while the transport is not connected.
    NotConnected,
    /// The connection dropped mid-operation.
    ConnectionClosed,
    SerializationError(String),
    DeserializationError(String),
    /// A presence broadcast failed (non-critical, self-healing).
    PresenceBroadcast(String),
    /// The engine rejected a document operation.
    OperationApply(String),
    /// Any other failure reported by the external collaboration engine.
    Engine(String),
}

/// Keywords that mark a connect failure as credential-related.
const AUTH_KEYWORDS: [&str; 7] = [
    "csrf",
    "token",
    "auth",
    "credential",
    "session",
    "unauthorized",
    "forbidden",
];

impl CollabError {
    /// Whether this error represents a rejected credential.
    ///
    /// Connect failures are classified by pattern-matching the server's
    /// message; only auth-classified failures trigger the one-shot forced
    /// token refresh and retry in the transport.
    pub fn is_auth_related(&self) -> bool {
        let msg = match self {
            Self::Auth(m) | Self::Handshake(m) => m,
            _ => return false,
        };
        let lower = msg.to_lowercase();
        AUTH_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenFetch(e) => write!(f, "Token fetch failed: {e}"),
            Self::ConnectionTimeout => write!(f, "Connection timeout"),
            Self::Auth(e) => write!(f, "Authentication failed: {e}"),
            Self::Handshake(e) => write!(f, "Handshake failed: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::PresenceBroadcast(e) => write!(f, "Presence broadcast failed: {e}"),
            Self::OperationApply(e) => write!(f, "Operation apply failed: {e}"),
            Self::Engine(e) => write!(f, "Engine error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}
