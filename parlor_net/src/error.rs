// Error taxonomy for the connection manager and its backends.
//
// - `SignalingError`: what the signaling service reports. Only
//   `PeerUnavailable` is transient (the host hasn't registered yet); the rest
//   are terminal for the current lobby.
// - `TransportError`: a backend call on a link or peer that isn't usable.
//   Callers log these; a failed send never aborts a broadcast.
// - `LobbyError`: the terminal condition surfaced to the UI, with a short
//   human-readable message. The diagnostic log carries the details.

use parlor_protocol::ConnId;

use crate::backend::PeerGeneration;

/// Failure reported by the signaling service.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("peer {0} is unavailable")]
    PeerUnavailable(String),
    #[error("peer id {0} is already taken")]
    UnavailableId(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("signaling server error: {0}")]
    Server(String),
}

impl SignalingError {
    /// Worth retrying within the attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, SignalingError::PeerUnavailable(_))
    }
}

/// A backend operation could not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0:?} is not open")]
    PeerNotOpen(PeerGeneration),
    #[error("{0} is not open")]
    LinkNotOpen(ConnId),
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Terminal lobby failure shown to the user.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("failed to connect to signaling")]
    SignalingExhausted,
    #[error("{0}")]
    Signaling(#[from] SignalingError),
    #[error("could not reach host")]
    HostUnreachable,
    #[error("connection failed even through relay")]
    RelayFailed,
    #[error("host left the lobby")]
    HostLeft,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_peer_unavailable_is_transient() {
        assert!(SignalingError::PeerUnavailable("lobby-x-1".into()).is_transient());
        assert!(!SignalingError::UnavailableId("lobby-x-1".into()).is_transient());
        assert!(!SignalingError::Network("reset".into()).is_transient());
        assert!(!SignalingError::Server("500".into()).is_transient());
    }

    #[test]
    fn user_facing_messages() {
        assert_eq!(
            LobbyError::SignalingExhausted.to_string(),
            "failed to connect to signaling"
        );
        assert_eq!(LobbyError::HostUnreachable.to_string(), "could not reach host");
        assert_eq!(
            LobbyError::from(SignalingError::UnavailableId("lobby-a-b".into())).to_string(),
            "peer id lobby-a-b is already taken"
        );
    }
}
