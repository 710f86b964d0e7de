//! Push-stream connection state machine.
//!
//! [`ConnectionManager`] decides *when* to open, retry or give up on the push
//! stream; the engine loop owns the actual [`EventStream`](crate::transport::EventStream)
//! and the backoff timer. Every attempt carries a generation number so that
//! completions belonging to a cancelled attempt (after `disconnect` or a new
//! `connect`) are ignored.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::PreconditionError;
use crate::protocol::GameId;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Status of the push-stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection has been requested (or it was torn down on request).
    #[default]
    Idle,
    /// An attempt to open the stream is in progress.
    Connecting,
    /// The stream is open and delivering notifications.
    Connected,
    /// The stream dropped; a reconnect is scheduled.
    Disconnected,
    /// The retry ceiling was reached. Terminal until the next `connect`.
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Exponential backoff parameters for reconnecting.
///
/// The delay before retry *n* (zero-based) is `min(base_delay * 2^n, max_delay)`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use activity_sync_client::connection::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(4), Duration::from_secs(16));
/// assert_eq!(policy.delay_for(10), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Number of automatic retries before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the upper bound on any single delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the number of automatic retries.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Backoff delay for the zero-based retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// A request to open the stream, tagged with its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub game_id: GameId,
    pub generation: u64,
}

/// What to do after a failed or dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Wait `delay`, then call [`ConnectionManager::retry_due`].
    Retry { delay: Duration, attempt: u32 },
    /// The retry ceiling was reached; raise the terminal notice.
    Exhausted { attempts: u32 },
    /// The failure belonged to a cancelled attempt.
    Stale,
}

/// Connection state machine with bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    policy: RetryPolicy,
    state: ConnectionState,
    attempt_count: u32,
    game_id: Option<GameId>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempt_count: 0,
            game_id: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn game_id(&self) -> Option<&str> {
        self.game_id.as_deref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns `true` if `generation` belongs to the live attempt.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Begin connecting to `game_id`, cancelling whatever came before.
    ///
    /// The caller must release any open stream before acting on the returned
    /// attempt.
    ///
    /// # Errors
    ///
    /// A blank `game_id` is rejected with [`PreconditionError::MissingGameId`]
    /// and leaves the manager `Idle`.
    pub fn connect(&mut self, game_id: &str) -> Result<ConnectAttempt, PreconditionError> {
        self.generation += 1;
        self.attempt_count = 0;
        if game_id.trim().is_empty() {
            warn!("refusing to connect without a game id");
            self.game_id = None;
            self.state = ConnectionState::Idle;
            return Err(PreconditionError::MissingGameId);
        }
        self.game_id = Some(game_id.to_string());
        self.state = ConnectionState::Connecting;
        debug!(game_id, generation = self.generation, "connecting");
        Ok(ConnectAttempt {
            game_id: game_id.to_string(),
            generation: self.generation,
        })
    }

    /// The stream for `generation` opened. Returns `false` if it is stale and
    /// must be closed.
    pub fn on_open(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            debug!(generation, "discarding stale stream");
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempt_count = 0;
        info!(game_id = ?self.game_id, "push stream connected");
        true
    }

    /// The attempt or open stream for `generation` failed.
    pub fn on_failure(&mut self, generation: u64) -> FailureOutcome {
        if !self.is_current(generation)
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return FailureOutcome::Stale;
        }

        if self.attempt_count < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempt_count);
            self.attempt_count += 1;
            self.state = ConnectionState::Disconnected;
            info!(
                attempt = self.attempt_count,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "push stream lost, scheduling reconnect"
            );
            FailureOutcome::Retry {
                delay,
                attempt: self.attempt_count,
            }
        } else {
            self.state = ConnectionState::Exhausted;
            warn!(
                attempts = self.attempt_count,
                "reconnect attempts exhausted, giving up"
            );
            FailureOutcome::Exhausted {
                attempts: self.attempt_count,
            }
        }
    }

    /// The backoff delay for `generation` elapsed.
    pub fn retry_due(&mut self, generation: u64) -> Option<ConnectAttempt> {
        if !self.is_current(generation) || self.state != ConnectionState::Disconnected {
            return None;
        }
        let game_id = self.game_id.clone()?;
        self.state = ConnectionState::Connecting;
        debug!(game_id, attempt = self.attempt_count, "retrying push stream");
        Some(ConnectAttempt {
            game_id,
            generation: self.generation,
        })
    }

    /// Tear down unconditionally. Cancels any pending retry. Idempotent.
    pub fn disconnect(&mut self) {
        self.generation += 1;
        self.attempt_count = 0;
        if self.state != ConnectionState::Idle {
            debug!(game_id = ?self.game_id, "disconnecting");
        }
        self.state = ConnectionState::Idle;
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
