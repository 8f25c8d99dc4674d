use thiserror::Error;

/// Failure taxonomy shared by the registry, brokers, and HTTP surface.
///
/// Every variant maps to a stable short code that travels on the wire
/// (`relay_response.error`, viewer error frames, HTTP error bodies) so
/// agents and clients can branch on it without parsing prose.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("agent not connected")]
    NotConnected,
    #[error("not authorized")]
    NotAuthorized,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("request timed out")]
    Timeout,
    #[error("agent disconnected")]
    AgentDisconnected,
    #[error("peer error: {0}")]
    PeerError(String),
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Stable short code for wire and HTTP surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::AuthFailed => "AUTH_FAILED",
            ControlError::NotConnected => "NOT_CONNECTED",
            ControlError::NotAuthorized => "NOT_AUTHORIZED",
            ControlError::ProtocolError(_) => "PROTOCOL_ERROR",
            ControlError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            ControlError::Timeout => "TIMEOUT",
            ControlError::AgentDisconnected => "AGENT_DISCONNECTED",
            ControlError::PeerError(_) => "PEER_ERROR",
            ControlError::PolicyDenied(_) => "POLICY_DENIED",
            ControlError::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ControlError::Internal(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ControlError::AuthFailed.code(), "AUTH_FAILED");
        assert_eq!(ControlError::Timeout.code(), "TIMEOUT");
        assert_eq!(ControlError::AgentDisconnected.code(), "AGENT_DISCONNECTED");
        assert_eq!(
            ControlError::ChecksumMismatch.code(),
            "CHECKSUM_MISMATCH"
        );
        assert_eq!(
            ControlError::PeerError("boom".into()).code(),
            "PEER_ERROR"
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = ControlError::LimitExceeded("3 streams".into());
        assert_eq!(err.to_string(), "limit exceeded: 3 streams");
    }
}
