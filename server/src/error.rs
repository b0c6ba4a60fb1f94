///! Shared error types for the session server

/// WebSocket close code a `SessionError` maps to. Axum's `CloseFrame` takes
/// a raw u16; we keep it as a thin wrapper so call sites read as intent
/// rather than magic numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Policy violation: auth failed, ownership failed, device cap exceeded.
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    /// Unsupported/malformed data: a frame that doesn't parse as JSON or
    /// doesn't match any known client message shape.
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    /// Internal error: storage or other unexpected failure.
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
}

/// Errors that can terminate or disrupt a session: the error currency of
/// the handshake, the receive loop, and the chat orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("auth error: {0}")]
    Auth(String),

    #[error("ownership error: {0}")]
    Ownership(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl SessionError {
    /// The WS close code a handshake-time failure of this kind should use.
    /// Only meaningful for errors that occur before the socket is accepted.
    pub fn close_code(&self) -> CloseCode {
        match self {
            SessionError::Auth(_) | SessionError::Ownership(_) | SessionError::Quota(_) => {
                CloseCode::POLICY_VIOLATION
            }
            SessionError::Protocol(_) => CloseCode::UNSUPPORTED_DATA,
            SessionError::Storage(_) | SessionError::Upstream(_) => CloseCode::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_mapping() {
        assert_eq!(
            SessionError::Auth("x".into()).close_code(),
            CloseCode::POLICY_VIOLATION
        );
        assert_eq!(
            SessionError::Ownership("x".into()).close_code(),
            CloseCode::POLICY_VIOLATION
        );
        assert_eq!(
            SessionError::Quota("x".into()).close_code(),
            CloseCode::POLICY_VIOLATION
        );
        assert_eq!(
            SessionError::Protocol("x".into()).close_code(),
            CloseCode::UNSUPPORTED_DATA
        );
        assert_eq!(
            SessionError::Upstream("x".into()).close_code(),
            CloseCode::INTERNAL_ERROR
        );
    }
}
