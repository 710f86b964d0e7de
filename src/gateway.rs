//! Request gateway boundary.
//!
//! The gateway is the thin request/response layer for the game API. The
//! engine only depends on this trait; HTTP plumbing, authentication and
//! response envelopes ([`ApiResponse`](crate::protocol::ApiResponse)) live in
//! the implementation.
//!
//! All calls are idempotent from the engine's point of view except
//! [`submit_round_winner`](RequestGateway::submit_round_winner), which the
//! engine never retries.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::protocol::{GameId, GameSettings, GameSnapshot, SubmitWinnerResponse};

/// Request/response calls against the game API.
#[async_trait]
pub trait RequestGateway: Send + Sync + 'static {
    /// Create a new game hosted by the local player.
    async fn create_game(&self) -> Result<GameId, GatewayError>;

    /// Join an existing game lobby.
    async fn join_game(&self, game_id: &str) -> Result<(), GatewayError>;

    /// Start the game (host only).
    async fn start_game(&self, game_id: &str) -> Result<(), GatewayError>;

    /// End the current round with the given winner.
    async fn submit_round_winner(
        &self,
        game_id: &str,
        winner_id: &str,
    ) -> Result<SubmitWinnerResponse, GatewayError>;

    /// Replace the lobby settings.
    async fn update_settings(
        &self,
        game_id: &str,
        settings: &GameSettings,
    ) -> Result<(), GatewayError>;

    /// Pull the authoritative game state.
    async fn fetch_game_snapshot(&self, game_id: &str) -> Result<GameSnapshot, GatewayError>;
}
