//! Error types for the session handler and the client driver.

use std::io;

use thiserror::Error;

use crate::packet::PacketError;
use crate::ports::PortError;
use crate::state::{Event, ServerState, Stage};

/// Why a server session stopped before completing.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The state machine rejected a frame and is now in a failed state.
    #[error("session rejected: {0}")]
    Rejected(ServerState),
    #[error("{stage} I/O error: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("port allocation failed: {0}")]
    Ports(#[from] PortError),
}

impl SessionError {
    pub fn io(stage: Stage, source: io::Error) -> Self {
        Self::Io { stage, source }
    }

    /// Event that moves the state machine into the matching failed state.
    ///
    /// `None` when the machine already failed on its own.
    pub fn event(&self) -> Option<Event<'static>> {
        match self {
            Self::Rejected(_) => None,
            Self::Io { source, .. } => Some(match source.kind() {
                io::ErrorKind::TimedOut => Event::TimedOut,
                io::ErrorKind::UnexpectedEof => Event::StreamClosed,
                _ => Event::TransportFailed,
            }),
            Self::Ports(_) => Some(Event::TransportFailed),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut)
    }
}

/// Errors surfaced by [`crate::client::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} timed out waiting for the server")]
    Timeout(Stage),
    #[error("unexpected response in {stage}: {reason}")]
    UnexpectedResponse { stage: Stage, reason: String },
    #[error("malformed frame: {0}")]
    Packet(#[from] PacketError),
    #[error("stage B packet {packet_id} unacknowledged after {attempts} attempts")]
    RetriesExhausted { packet_id: u32, attempts: u32 },
    #[error("could not resolve server address {0}")]
    Resolve(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Map an I/O error raised in `stage`, keeping timeouts distinct.
    pub fn from_io(stage: Stage, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Self::Timeout(stage)
        } else {
            Self::Io(err)
        }
    }

    pub(crate) fn unexpected(stage: Stage, reason: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            stage,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Failure;

    #[test]
    fn io_kinds_map_to_machine_events() {
        let timeout = SessionError::io(Stage::B, io::ErrorKind::TimedOut.into());
        let eof = SessionError::io(Stage::D, io::ErrorKind::UnexpectedEof.into());
        let reset = SessionError::io(Stage::D, io::ErrorKind::ConnectionReset.into());
        assert_eq!(timeout.event(), Some(Event::TimedOut));
        assert!(timeout.is_timeout());
        assert_eq!(eof.event(), Some(Event::StreamClosed));
        assert_eq!(reset.event(), Some(Event::TransportFailed));
    }

    #[test]
    fn rejected_carries_no_event() {
        let err = SessionError::Rejected(ServerState::Failed {
            stage: Stage::A,
            reason: Failure::ProtocolViolation,
        });
        assert_eq!(err.event(), None);
    }

    #[test]
    fn client_timeout_is_stage_specific() {
        let err = ClientError::from_io(Stage::C, io::ErrorKind::TimedOut.into());
        assert!(matches!(err, ClientError::Timeout(Stage::C)));
        assert_eq!(err.to_string(), "stage C timed out waiting for the server");
    }
}
