//! Server-side failure taxonomy and its mapping onto wire error codes.

use atelier_proto::{ErrorCode, FrameError, WireError};
use thiserror::Error;

use crate::{document::DocumentError, store::StorageError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("unsupported protocol version {0}")]
    ProtocolVersion(u8),
    #[error("frame type {frame} does not match payload tag {payload}")]
    FrameTagMismatch { frame: u8, payload: u32 },
    #[error("no Hello within the handshake window")]
    HandshakeTimeout,
    #[error("no traffic within the idle window")]
    StaleConnection,
    #[error("Hello repeated after the handshake")]
    DuplicateHello,
    #[error("not joined to a project")]
    NotJoined,
    #[error("already joined to project '{0}'")]
    AlreadyJoined(String),
    #[error("message addressed to '{got}' on a connection bound to '{expected}'")]
    ProjectMismatch { expected: String, got: String },
    #[error("invalid project id '{0}'")]
    InvalidProjectId(String),
    #[error("project '{0}' not found")]
    ProjectNotFound(String),
    #[error("project '{0}' is at peer capacity")]
    ProjectFull(String),
    #[error("chat message of {0} bytes exceeds the 4 KiB cap")]
    ChatTooLong(usize),
    #[error("cursor line and column must be >= 1")]
    InvalidCursor,
    #[error("clients cannot set Offline status")]
    OfflineStatusReserved,
    #[error("document would exceed the configured size cap")]
    DocumentTooLarge,
    #[error("server is at its room capacity")]
    ServerAtCapacity,
    #[error("outbound backlog exceeded")]
    RateLimited,
    #[error("voice credentials unavailable: {0}")]
    Voice(String),
    #[error("room is shutting down")]
    RoomClosed,
}

impl ServerError {
    /// Wire code reported to the offending client.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Frame(FrameError::VersionMismatch(_)) => ErrorCode::VersionMismatch,
            ServerError::Frame(_) | ServerError::Wire(_) => ErrorCode::InvalidMessage,
            ServerError::ProtocolVersion(_) => ErrorCode::VersionMismatch,
            ServerError::NotJoined => ErrorCode::NotJoined,
            ServerError::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            ServerError::ProjectMismatch { .. }
            | ServerError::InvalidProjectId(_)
            | ServerError::ChatTooLong(_)
            | ServerError::InvalidCursor
            | ServerError::OfflineStatusReserved
            | ServerError::FrameTagMismatch { .. }
            | ServerError::HandshakeTimeout
            | ServerError::StaleConnection
            | ServerError::DuplicateHello => ErrorCode::InvalidMessage,
            ServerError::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            ServerError::ProjectFull(_) => ErrorCode::ProjectFull,
            ServerError::RateLimited => ErrorCode::RateLimited,
            ServerError::Storage(_)
            | ServerError::Document(_)
            | ServerError::DocumentTooLarge
            | ServerError::Voice(_)
            | ServerError::ServerAtCapacity
            | ServerError::RoomClosed => ErrorCode::ServerError,
        }
    }

    /// Whether the connection must be closed after reporting the error.
    /// Protocol-level corruption and backlog overflow are fatal; client-state
    /// and room errors answer one operation and keep the stream alive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::Frame(_)
                | ServerError::Wire(_)
                | ServerError::ProtocolVersion(_)
                | ServerError::FrameTagMismatch { .. }
                | ServerError::HandshakeTimeout
                | ServerError::StaleConnection
                | ServerError::RateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(ServerError::Frame(FrameError::VersionMismatch(2)).is_fatal());
        assert!(ServerError::Wire(WireError::UnknownTag(42)).is_fatal());
        assert!(ServerError::RateLimited.is_fatal());
        assert!(!ServerError::NotJoined.is_fatal());
        assert!(!ServerError::ProjectFull("p".into()).is_fatal());
        assert!(!ServerError::ChatTooLong(9000).is_fatal());
    }

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(
            ServerError::Frame(FrameError::VersionMismatch(2)).code(),
            ErrorCode::VersionMismatch
        );
        assert_eq!(
            ServerError::Frame(FrameError::PayloadTooLarge(1 << 30)).code(),
            ErrorCode::InvalidMessage
        );
        assert_eq!(ServerError::NotJoined.code(), ErrorCode::NotJoined);
        assert_eq!(
            ServerError::ProjectMismatch {
                expected: "a".into(),
                got: "b".into()
            }
            .code(),
            ErrorCode::InvalidMessage
        );
        assert_eq!(ServerError::RateLimited.code(), ErrorCode::RateLimited);
        assert_eq!(ServerError::RoomClosed.code(), ErrorCode::ServerError);
    }
}
