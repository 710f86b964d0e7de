//! Outbound events emitted by the engine.

use std::sync::Arc;

use crate::connection::ConnectionState;
use crate::error::{EngineError, GatewayError};
use crate::lifecycle::LifecyclePhase;
use crate::protocol::{GameSnapshot, PlayerId, Round};
use crate::timer::TimerState;

/// Everything the engine reports to its consumers, on one channel.
///
/// Received from the [`broadcast::Receiver`](tokio::sync::broadcast::Receiver)
/// returned by [`GameEngine::start`](crate::engine::GameEngine::start); more
/// receivers can be created with
/// [`GameEngine::subscribe`](crate::engine::GameEngine::subscribe).
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    // ── Connection ──────────────────────────────────────────────────
    /// The push-stream connection state changed.
    ConnectionChanged(ConnectionState),

    /// The retry ceiling was reached. Terminal until the next `connect`.
    ConnectionLost { attempts: u32 },

    // ── Lifecycle ───────────────────────────────────────────────────
    PhaseChanged { phase: LifecyclePhase },

    /// A new authoritative snapshot replaced the previous one.
    SnapshotUpdated(Arc<GameSnapshot>),

    /// A round id not seen before became current.
    RoundStarted { round: Round },

    /// The local player no longer belongs to the game.
    MembershipLost,

    // ── Semantic callbacks ──────────────────────────────────────────
    // Fired after the pull a notification triggered has been applied.
    PlayerJoined { payload: Option<String> },

    PlayerLeft { player_id: Option<PlayerId> },

    GameStarted,

    RoundEnded { payload: Option<String> },

    GameEnded { winner_id: Option<PlayerId> },

    // ── Timer ───────────────────────────────────────────────────────
    TimerTick(TimerState),

    /// The countdown reached zero. Fired once per round.
    TimerExpired,

    // ── Errors ──────────────────────────────────────────────────────
    /// A pull failed. Non-fatal; the next notification or refresh retries.
    SyncError { error: GatewayError },
}

impl GameEvent {
    /// The failure this event reports, if any.
    ///
    /// `SyncError` maps to [`EngineError::Refresh`] and `ConnectionLost` to
    /// [`EngineError::TransportClosed`]; every other event returns `None`.
    pub fn error(&self) -> Option<EngineError> {
        match self {
            GameEvent::SyncError { error } => Some(EngineError::Refresh(error.clone())),
            GameEvent::ConnectionLost { .. } => Some(EngineError::TransportClosed),
            _ => None,
        }
    }
}
