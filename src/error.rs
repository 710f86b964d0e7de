//! Error types for the synchronization engine.

use thiserror::Error;

/// A failed call to the request gateway, as reported by the server.
///
/// Carries the server-provided message verbatim so callers can show it to
/// the player.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GatewayError {
    /// Human-readable message from the server (or the HTTP layer).
    pub message: String,
    /// HTTP status code, if the failure came with one.
    pub status: Option<u16>,
}

impl GatewayError {
    /// Create a gateway error with no status code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Attach an HTTP status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// An invalid call rejected before any network request is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    /// No game identifier was supplied (or it was blank).
    #[error("a game id is required")]
    MissingGameId,

    /// The engine is not attached to any game.
    #[error("not attached to a game")]
    NoActiveGame,

    /// A winner submission was attempted with no winner selected.
    #[error("no round winner selected")]
    NoWinnerSelected,

    /// The selected player is not part of the current game.
    #[error("player {0} is not a member of this game")]
    UnknownPlayer(String),

    /// The operation requires an active round.
    #[error("no round is currently active")]
    NoActiveRound,

    /// A winner submission for this round is already pending.
    #[error("a winner submission is already in flight")]
    SubmissionPending,

    /// The game has finished; no further mutations are accepted.
    #[error("the game has already finished")]
    GameFinished,

    /// The requested settings are out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Errors that can occur when using the synchronization engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The push stream could not be opened or failed while open.
    #[error("transport error: {0}")]
    Transport(String),

    /// The push stream was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// An authoritative pull failed. Recoverable: the next notification or
    /// manual refresh will try again.
    #[error("refresh failed: {0}")]
    Refresh(GatewayError),

    /// A mutation request failed. Engine state was left unchanged.
    #[error("request failed: {0}")]
    Mutation(GatewayError),

    /// The call was rejected before reaching the network.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The engine loop has shut down.
    #[error("engine is not running")]
    EngineStopped,

    /// Failed to serialize or deserialize a wire message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns `true` for errors the engine recovers from on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::TransportClosed
                | EngineError::Refresh(_)
                | EngineError::Timeout
        )
    }
}

/// A specialized [`Result`] type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
