//! Error taxonomy for the client core.
//!
//! Transport, protocol and timeout errors are recoverable: the session that
//! hit them falls back to `Offline` (or drops the offending item) and keeps a
//! human-readable reason. Resource errors block progress in `Loading`.
//! Only `Quitting` is terminal.

use crate::net::ClientSlot;

/// Result type for client-core operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket or handshake failure.
    Transport,
    /// Malformed message, duplicate item key, version mismatch.
    Protocol,
    /// No data within the configured window.
    Timeout,
    /// Arena exhausted, map asset missing.
    Resource,
    /// Caller asked for something the current state does not allow.
    Usage,
    /// The client is shutting down.
    Terminal,
}

/// Errors produced by the client core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("item (type {type_id}, id {id}) already exists in building snapshot")]
    DuplicateItem { type_id: u16, id: u16 },

    #[error("snapshot arena exhausted: need {needed} bytes, {available} left")]
    ArenaExhausted { needed: usize, available: usize },

    #[error("snapshot item limit reached ({limit})")]
    TooManyItems { limit: usize },

    #[error("snapshot item of {size} bytes exceeds the {limit} byte item limit")]
    ItemTooLarge { size: usize, limit: usize },

    #[error("static size for type {type_id} already registered as {registered}, got {requested}")]
    StaticSizeConflict {
        type_id: u16,
        registered: usize,
        requested: usize,
    },

    #[error("static size for type {type_id} registered after items of that type were produced")]
    StaticSizeTooLate { type_id: u16 },

    #[error("no snapshot is being built")]
    NotBuilding,

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("{slot} session unavailable: {reason}")]
    SessionUnavailable { slot: ClientSlot, reason: String },

    #[error("client is quitting")]
    Quitting,
}

impl ClientError {
    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) | Self::DuplicateItem { .. } => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Resource(_)
            | Self::ArenaExhausted { .. }
            | Self::TooManyItems { .. }
            | Self::ItemTooLarge { .. } => ErrorKind::Resource,
            Self::StaticSizeConflict { .. }
            | Self::StaticSizeTooLate { .. }
            | Self::NotBuilding
            | Self::InvalidTransition { .. }
            | Self::SessionUnavailable { .. } => ErrorKind::Usage,
            Self::Quitting => ErrorKind::Terminal,
        }
    }

    /// Recoverable errors are handled inside the session boundary.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Terminal)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed message: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_item_is_protocol_error() {
        let err = ClientError::DuplicateItem { type_id: 5, id: 1 };
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let msg = err.to_string();
        assert!(msg.contains("type 5"));
        assert!(msg.contains("id 1"));
    }

    #[test]
    fn arena_exhaustion_is_resource_error() {
        let err = ClientError::ArenaExhausted {
            needed: 64,
            available: 10,
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.is_recoverable());
    }

    #[test]
    fn only_quitting_is_terminal() {
        assert!(!ClientError::Quitting.is_recoverable());
        assert!(ClientError::Timeout("no data".into()).is_recoverable());
        assert_eq!(
            ClientError::Timeout("x".into()).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn json_errors_become_protocol_errors() {
        let err: ClientError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
