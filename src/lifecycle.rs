//! Game lifecycle state machine.
//!
//! [`LifecycleMachine`] exclusively owns the latest [`GameSnapshot`] and
//! derives the [`LifecyclePhase`] from it. Remote pulls are the only source
//! of truth for status; the one local transition is entering `RoundEnded`
//! after the server confirmed a winner submission, which lasts until the
//! next pull shows the following round.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::PreconditionError;
use crate::protocol::{GameId, GameSnapshot, GameStatus, PlayerId, Round, RoundId};

/// Locally derived stage of the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecyclePhase {
    /// Lobby; the game has not started.
    #[default]
    Waiting,
    /// A round is being played.
    RoundActive,
    /// The round ended; waiting for the next pull to show the next round.
    RoundEnded,
    /// Terminal.
    Finished,
}

impl LifecyclePhase {
    /// Derive the phase from a snapshot.
    pub fn of(snapshot: &GameSnapshot) -> Self {
        match (snapshot.status, &snapshot.current_round) {
            (GameStatus::Waiting, _) => LifecyclePhase::Waiting,
            (GameStatus::InProgress, Some(_)) => LifecyclePhase::RoundActive,
            (GameStatus::InProgress, None) => LifecyclePhase::RoundEnded,
            (GameStatus::Finished, _) => LifecyclePhase::Finished,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Waiting => "waiting",
            LifecyclePhase::RoundActive => "round-active",
            LifecyclePhase::RoundEnded => "round-ended",
            LifecyclePhase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// An observable consequence of applying a snapshot or a local transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleChange {
    /// The stored snapshot was replaced with different content.
    SnapshotReplaced,
    /// The phase moved.
    PhaseChanged {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
    /// A round id not seen before became current. Resets turn-scoped state.
    RoundStarted(Round),
    /// The game reached its terminal state.
    Finished,
    /// The local player no longer appears in the game.
    MembershipLost,
}

/// A winner submission the caller may now send to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub game_id: GameId,
    pub round_id: RoundId,
    pub winner_id: PlayerId,
}

/// Holds the authoritative snapshot and turn-scoped local state.
#[derive(Debug, Default)]
pub struct LifecycleMachine {
    game_id: Option<GameId>,
    snapshot: Option<GameSnapshot>,
    phase: LifecyclePhase,
    /// Round the server confirmed as ended by our own submission.
    locally_ended: Option<RoundId>,
    /// Most recent round id observed, kept across snapshots without a round.
    last_round: Option<RoundId>,
    selected_winner: Option<PlayerId>,
    submission_pending: bool,
    local_player: Option<PlayerId>,
    was_member: bool,
}

impl LifecycleMachine {
    /// Create a machine that tracks membership of `local_player`, if known.
    pub fn new(local_player: Option<PlayerId>) -> Self {
        Self {
            local_player,
            ..Self::default()
        }
    }

    /// Attach to a game, dropping all state from the previous one.
    pub fn attach(&mut self, game_id: &str) {
        let local_player = self.local_player.take();
        *self = Self::new(local_player);
        self.game_id = Some(game_id.to_string());
        self.was_member = true;
    }

    pub fn game_id(&self) -> Option<&str> {
        self.game_id.as_deref()
    }

    pub fn snapshot(&self) -> Option<&GameSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn selected_winner(&self) -> Option<&str> {
        self.selected_winner.as_deref()
    }

    pub fn submission_pending(&self) -> bool {
        self.submission_pending
    }

    pub fn current_round(&self) -> Option<&Round> {
        self.snapshot.as_ref()?.current_round.as_ref()
    }

    /// Ingest a freshly pulled snapshot.
    ///
    /// Applying the same snapshot twice yields no changes the second time.
    pub fn apply(&mut self, snapshot: GameSnapshot) -> Vec<LifecycleChange> {
        let mut changes = Vec::new();
        if self.phase == LifecyclePhase::Finished {
            debug!(game_id = %snapshot.id, "game finished, ignoring snapshot");
            return changes;
        }
        if self.snapshot.as_ref() == Some(&snapshot) {
            return changes;
        }
        if self.game_id.as_deref().is_some_and(|id| id != snapshot.id) {
            warn!(
                expected = ?self.game_id,
                received = %snapshot.id,
                "snapshot belongs to another game, ignoring"
            );
            return changes;
        }

        let incoming_round = snapshot.current_round.clone();
        let mut phase = LifecyclePhase::of(&snapshot);

        changes.push(LifecycleChange::SnapshotReplaced);

        match &incoming_round {
            Some(round) if self.locally_ended.as_deref() == Some(round.id.as_str()) => {
                // The server has not moved past the round we ended yet.
                phase = LifecyclePhase::RoundEnded;
            }
            Some(round) if self.last_round.as_deref() != Some(round.id.as_str()) => {
                info!(round_id = %round.id, method = %round.method_type, "new round");
                self.locally_ended = None;
                self.selected_winner = None;
                changes.push(LifecycleChange::RoundStarted(round.clone()));
            }
            Some(round) => debug!(round_id = %round.id, "round resumed"),
            None => {}
        }
        if let Some(round) = &incoming_round {
            self.last_round = Some(round.id.clone());
        }

        if phase != self.phase {
            info!(from = %self.phase, to = %phase, "phase changed");
            changes.push(LifecycleChange::PhaseChanged {
                from: self.phase,
                to: phase,
            });
            if phase != LifecyclePhase::RoundActive {
                self.selected_winner = None;
            }
            self.phase = phase;
        }

        if let Some(player) = &self.local_player {
            let member = snapshot.is_member(player);
            if self.was_member && !member {
                warn!(player_id = %player, game_id = %snapshot.id, "no longer a member of the game");
                changes.push(LifecycleChange::MembershipLost);
            }
            self.was_member = member;
        }

        if phase == LifecyclePhase::Finished {
            info!(game_id = %snapshot.id, "game finished");
            changes.push(LifecycleChange::Finished);
        }

        if self.game_id.is_none() {
            self.game_id = Some(snapshot.id.clone());
        }
        self.snapshot = Some(snapshot);
        changes
    }

    /// Select the round winner. Turn-scoped: cleared when the round changes.
    ///
    /// # Errors
    ///
    /// Requires an active round and a player that belongs to the game.
    pub fn select_winner(&mut self, player_id: &str) -> Result<(), PreconditionError> {
        if self.phase != LifecyclePhase::RoundActive {
            return Err(PreconditionError::NoActiveRound);
        }
        let known = self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.player(player_id).is_some());
        if !known {
            return Err(PreconditionError::UnknownPlayer(player_id.to_string()));
        }
        self.selected_winner = Some(player_id.to_string());
        Ok(())
    }

    pub fn clear_winner(&mut self) {
        self.selected_winner = None;
    }

    /// Validate and reserve a winner submission.
    ///
    /// The selection is kept until the server confirms, so a failed call can
    /// be retried by the caller.
    ///
    /// # Errors
    ///
    /// Rejects the call when the game finished, no round is active, another
    /// submission is pending, or no winner is selected.
    pub fn begin_submission(&mut self) -> Result<Submission, PreconditionError> {
        if self.phase == LifecyclePhase::Finished {
            return Err(PreconditionError::GameFinished);
        }
        if self.submission_pending {
            return Err(PreconditionError::SubmissionPending);
        }
        let (game_id, round_id) = match (&self.game_id, self.current_round()) {
            (Some(game_id), Some(round)) if self.phase == LifecyclePhase::RoundActive => {
                (game_id.clone(), round.id.clone())
            }
            _ => return Err(PreconditionError::NoActiveRound),
        };
        let winner_id = self
            .selected_winner
            .clone()
            .ok_or(PreconditionError::NoWinnerSelected)?;
        self.submission_pending = true;
        Ok(Submission {
            game_id,
            round_id,
            winner_id,
        })
    }

    /// Record the outcome of a submission for `round_id`.
    ///
    /// On success the round is ended locally (if it is still current). On
    /// failure nothing changes and the selection is preserved.
    pub fn finish_submission(&mut self, round_id: &str, accepted: bool) -> Option<LifecycleChange> {
        self.submission_pending = false;
        if !accepted {
            return None;
        }
        let still_current = self.current_round().is_some_and(|r| r.id == round_id);
        if !still_current || self.phase != LifecyclePhase::RoundActive {
            return None;
        }
        self.locally_ended = Some(round_id.to_string());
        self.selected_winner = None;
        let from = self.phase;
        self.phase = LifecyclePhase::RoundEnded;
        info!(round_id, "round ended locally, awaiting next round");
        Some(LifecycleChange::PhaseChanged {
            from,
            to: LifecyclePhase::RoundEnded,
        })
    }
}
