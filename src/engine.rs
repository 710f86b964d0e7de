//! The synchronization engine.
//!
//! [`GameEngine`] is a thin handle that talks to a background engine loop
//! over an unbounded MPSC channel. The loop is the single writer for every
//! piece of engine state: it owns the push stream, the
//! [`ConnectionManager`], the [`Reconciler`], the [`LifecycleMachine`] and
//! the [`TurnTimer`], and drives all of them from one `tokio::select!`.
//! Consumers observe the engine through [`GameEvent`]s on a broadcast channel
//! and through `watch` receivers for the current values.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = EngineConfig::new(Session::new().with_player("p1", "alice"));
//! let (engine, mut events) = GameEngine::start(connector, gateway, store, config);
//!
//! engine.join_game("g-42").await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         GameEvent::RoundStarted { round } => { /* … */ }
//!         GameEvent::GameEnded { winner_id } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{
    ConnectAttempt, ConnectionManager, ConnectionState, FailureOutcome, RetryPolicy,
};
use crate::error::{EngineError, GatewayError, PreconditionError, Result};
use crate::event::GameEvent;
use crate::gateway::RequestGateway;
use crate::lifecycle::{LifecycleChange, LifecycleMachine, LifecyclePhase, Submission};
use crate::protocol::{
    GameId, GameSettings, GameSnapshot, NotificationKind, PlayerId, RemoteNotification, RoundId,
    SubmitWinnerResponse,
};
use crate::reconciler::{PullTicket, Reconciler};
use crate::session::{ResumeStore, Session};
use crate::timer::{TimerState, TurnTimer};
use crate::transport::{EventStream, StreamConnector};

/// Default capacity of the broadcast event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default turn timer resolution.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`GameEngine`].
///
/// The only required input is the [`Session`] created by the process
/// bootstrap; everything else has defaults.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use activity_sync_client::connection::RetryPolicy;
/// use activity_sync_client::engine::EngineConfig;
/// use activity_sync_client::session::Session;
///
/// let config = EngineConfig::new(Session::new())
///     .with_retry(RetryPolicy::default().with_max_attempts(3))
///     .with_event_channel_capacity(0);
/// assert_eq!(config.retry.max_attempts, 3);
/// assert_eq!(config.event_channel_capacity, 1);
/// assert_eq!(config.tick_interval, Duration::from_secs(1));
/// assert!(config.disconnect_on_finish);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The local participant; keys the resume store and the membership check.
    pub session: Session,
    /// Reconnect backoff for the push stream.
    pub retry: RetryPolicy,
    /// How often the turn timer ticks. Defaults to **1 second**.
    pub tick_interval: Duration,
    /// Capacity of the broadcast event channel.
    ///
    /// A receiver that falls further behind than this sees
    /// [`RecvError::Lagged`](tokio::sync::broadcast::error::RecvError::Lagged)
    /// and skips the oldest events.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the engine loop gets to close the stream on
    /// [`GameEngine::shutdown`] before it is aborted. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Tear the push stream down once the game finishes. Defaults to `true`.
    pub disconnect_on_finish: bool,
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new(session: Session) -> Self {
        Self {
            session,
            retry: RetryPolicy::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            disconnect_on_finish: true,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timer resolution. Zero is clamped to one millisecond.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(MIN_TICK_INTERVAL);
        self
    }

    /// Set the capacity of the event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown. Zero aborts immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_disconnect_on_finish(mut self, disconnect: bool) -> Self {
        self.disconnect_on_finish = disconnect;
        self
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// Read-only views published by the engine loop.
struct EngineState {
    running: AtomicBool,
    game_id: watch::Sender<Option<GameId>>,
    connection: watch::Sender<ConnectionState>,
    phase: watch::Sender<LifecyclePhase>,
    snapshot: watch::Sender<Option<Arc<GameSnapshot>>>,
    timer: watch::Sender<TimerState>,
    selected_winner: watch::Sender<Option<PlayerId>>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            game_id: watch::channel(None).0,
            connection: watch::channel(ConnectionState::Idle).0,
            phase: watch::channel(LifecyclePhase::Waiting).0,
            snapshot: watch::channel(None).0,
            timer: watch::channel(TimerState::default()).0,
            selected_winner: watch::channel(None).0,
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────

enum Command {
    Connect(GameId),
    Disconnect,
    Refresh,
    SelectWinner {
        player_id: PlayerId,
        reply: oneshot::Sender<std::result::Result<(), PreconditionError>>,
    },
    ClearWinner,
    SubmitWinner {
        reply: oneshot::Sender<Result<SubmitWinnerResponse>>,
    },
    Status {
        reply: oneshot::Sender<Option<(GameId, LifecyclePhase)>>,
    },
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle to a running synchronization engine.
///
/// Dropping the handle aborts the engine loop; call
/// [`shutdown`](Self::shutdown) to close the push stream gracefully.
pub struct GameEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<EngineState>,
    event_tx: broadcast::Sender<GameEvent>,
    gateway: Arc<dyn RequestGateway>,
    store: Arc<dyn ResumeStore>,
    session: Session,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl GameEngine {
    /// Spawn the engine loop and return the handle plus a first event
    /// receiver.
    ///
    /// Must be called from within a Tokio runtime. The engine starts `Idle`;
    /// call [`connect`](Self::connect), [`join_game`](Self::join_game),
    /// [`create_game`](Self::create_game) or [`resume`](Self::resume) to
    /// attach it to a game.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        connector: impl StreamConnector,
        gateway: impl RequestGateway,
        store: impl ResumeStore,
        config: EngineConfig,
    ) -> (Self, broadcast::Receiver<GameEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = broadcast::channel::<GameEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(EngineState::new());
        let gateway: Arc<dyn RequestGateway> = Arc::new(gateway);
        let store: Arc<dyn ResumeStore> = Arc::new(store);

        let engine_loop = EngineLoop::new(
            Arc::new(connector),
            Arc::clone(&gateway),
            Arc::clone(&store),
            &config,
            Arc::clone(&state),
            event_tx.clone(),
        );
        let task = tokio::spawn(engine_loop.run(cmd_rx, shutdown_rx));

        let engine = Self {
            cmd_tx,
            state,
            event_tx,
            gateway,
            store,
            session: config.session,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (engine, event_rx)
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Attach to `game_id` and open its push stream.
    ///
    /// Any existing stream is closed first. Switching to a different game
    /// discards all state of the previous one.
    ///
    /// # Errors
    ///
    /// A blank `game_id` is rejected with
    /// [`PreconditionError::MissingGameId`] before anything is attempted.
    pub fn connect(&self, game_id: &str) -> Result<()> {
        let game_id = game_id.trim();
        if game_id.is_empty() {
            return Err(PreconditionError::MissingGameId.into());
        }
        self.send(Command::Connect(game_id.to_string()))
    }

    /// Close the push stream and cancel any scheduled reconnect. Idempotent.
    ///
    /// The lifecycle state is kept so the last snapshot remains readable.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Request an authoritative pull. Coalesces with in-flight pulls.
    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    // ── Game operations ─────────────────────────────────────────────

    /// Create a new game, remember it for resumption and connect to it.
    ///
    /// # Errors
    ///
    /// [`EngineError::Mutation`] carries the server message if creation
    /// failed.
    pub async fn create_game(&self) -> Result<GameId> {
        self.ensure_running()?;
        let game_id = self
            .gateway
            .create_game()
            .await
            .map_err(EngineError::Mutation)?;
        info!(game_id = %game_id, "game created");
        self.attach(&game_id)?;
        Ok(game_id)
    }

    /// Join an existing game, remember it for resumption and connect to it.
    pub async fn join_game(&self, game_id: &str) -> Result<()> {
        let game_id = game_id.trim();
        if game_id.is_empty() {
            return Err(PreconditionError::MissingGameId.into());
        }
        self.ensure_running()?;
        self.gateway
            .join_game(game_id)
            .await
            .map_err(EngineError::Mutation)?;
        info!(game_id, "joined game");
        self.attach(game_id)
    }

    /// Re-attach to the game saved for this session, if any.
    ///
    /// Returns the resumed game id.
    pub async fn resume(&self) -> Result<Option<GameId>> {
        self.ensure_running()?;
        let Some(game_id) = self.store.load(self.session.id)? else {
            debug!(session = %self.session.id, "nothing to resume");
            return Ok(None);
        };
        info!(game_id = %game_id, "resuming game");
        self.connect(&game_id)?;
        Ok(Some(game_id))
    }

    /// Start the attached game (host only), then refresh.
    pub async fn start_game(&self) -> Result<()> {
        let game_id = self.attached_game().await?;
        self.gateway
            .start_game(&game_id)
            .await
            .map_err(EngineError::Mutation)?;
        self.refresh()
    }

    /// Replace the lobby settings of the attached game, then refresh.
    ///
    /// # Errors
    ///
    /// Out-of-range settings are rejected with
    /// [`PreconditionError::InvalidSettings`] before any request is made.
    pub async fn update_settings(&self, settings: &GameSettings) -> Result<()> {
        settings
            .validate()
            .map_err(PreconditionError::InvalidSettings)?;
        let game_id = self.attached_game().await?;
        self.gateway
            .update_settings(&game_id, settings)
            .await
            .map_err(EngineError::Mutation)?;
        self.refresh()
    }

    /// Select the winner of the active round.
    pub async fn select_winner(&self, player_id: &str) -> Result<()> {
        let player_id = player_id.to_string();
        self.request(|reply| Command::SelectWinner { player_id, reply })
            .await?
            .map_err(EngineError::from)
    }

    pub fn clear_winner(&self) -> Result<()> {
        self.send(Command::ClearWinner)
    }

    /// Submit the selected winner and end the round.
    ///
    /// Sent exactly once and never retried. On success the phase becomes
    /// `RoundEnded` until a pull shows the next round. On failure the phase
    /// and the selection are left as they were.
    pub async fn submit_round_winner(&self) -> Result<SubmitWinnerResponse> {
        self.request(|reply| Command::SubmitWinner { reply }).await?
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Returns `true` while the engine loop is running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn game_id(&self) -> Option<GameId> {
        self.state.game_id.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.connection.borrow()
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.state.phase.borrow()
    }

    /// The latest authoritative snapshot.
    pub fn snapshot(&self) -> Option<Arc<GameSnapshot>> {
        self.state.snapshot.borrow().clone()
    }

    pub fn timer(&self) -> TimerState {
        *self.state.timer.borrow()
    }

    pub fn selected_winner(&self) -> Option<PlayerId> {
        self.state.selected_winner.borrow().clone()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.connection.subscribe()
    }

    pub fn watch_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.state.phase.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<Arc<GameSnapshot>>> {
        self.state.snapshot.subscribe()
    }

    pub fn watch_timer(&self) -> watch::Receiver<TimerState> {
        self.state.timer.subscribe()
    }

    /// Create another event receiver. It only sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.event_tx.subscribe()
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Shut down gracefully, closing the push stream.
    ///
    /// Waits up to the configured shutdown timeout, then aborts the loop.
    pub async fn shutdown(&mut self) {
        debug!("GameEngine: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Abort if the loop does not exit in time so the task cannot detach.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("engine loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("engine loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("engine loop aborted: {join_err}");
                    }
                }
            }
        }

        self.state.running.store(false, Ordering::Release);
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn attach(&self, game_id: &str) -> Result<()> {
        self.store.save(self.session.id, game_id)?;
        self.connect(game_id)
    }

    /// The attached game id, provided the game has not finished.
    async fn attached_game(&self) -> Result<GameId> {
        let status = self.request(|reply| Command::Status { reply }).await?;
        match status {
            None => Err(PreconditionError::NoActiveGame.into()),
            Some((_, LifecyclePhase::Finished)) => Err(PreconditionError::GameFinished.into()),
            Some((game_id, _)) => Ok(game_id),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::EngineStopped)
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.ensure_running()?;
        self.cmd_tx
            .send(cmd)
            .map_err(|_| EngineError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }
}

impl std::fmt::Debug for GameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameEngine")
            .field("session", &self.session.id)
            .field("game_id", &self.game_id())
            .field("connection", &self.connection_state())
            .field("phase", &self.phase())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for GameEngine {
    fn drop(&mut self) {
        // No executor to drive a graceful close here; abort the loop instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Engine loop ─────────────────────────────────────────────────────

type OpenFuture = BoxFuture<'static, (u64, Result<Box<dyn EventStream>>)>;
type PullFuture = BoxFuture<'static, (PullTicket, std::result::Result<GameSnapshot, GatewayError>)>;
type SubmitFuture = BoxFuture<'static, SubmitOutcome>;

struct SubmitOutcome {
    round_id: RoundId,
    result: std::result::Result<SubmitWinnerResponse, GatewayError>,
    reply: oneshot::Sender<Result<SubmitWinnerResponse>>,
}

struct EngineLoop {
    connector: Arc<dyn StreamConnector>,
    gateway: Arc<dyn RequestGateway>,
    store: Arc<dyn ResumeStore>,
    session_id: Uuid,
    disconnect_on_finish: bool,
    state: Arc<EngineState>,
    event_tx: broadcast::Sender<GameEvent>,

    connection: ConnectionManager,
    reconciler: Reconciler,
    lifecycle: LifecycleMachine,
    timer: TurnTimer,
    ticker: Interval,

    /// The open stream and the generation it belongs to.
    stream: Option<(Box<dyn EventStream>, u64)>,
    opening: Option<OpenFuture>,
    backoff: Option<(Pin<Box<Sleep>>, u64)>,
    pull: Option<PullFuture>,
    submission: Option<SubmitFuture>,

    /// Callbacks already fired against the current snapshot.
    dispatched: HashSet<(NotificationKind, Option<String>)>,
}

impl EngineLoop {
    fn new(
        connector: Arc<dyn StreamConnector>,
        gateway: Arc<dyn RequestGateway>,
        store: Arc<dyn ResumeStore>,
        config: &EngineConfig,
        state: Arc<EngineState>,
        event_tx: broadcast::Sender<GameEvent>,
    ) -> Self {
        let period = config.tick_interval.max(MIN_TICK_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            connector,
            gateway,
            store,
            session_id: config.session.id,
            disconnect_on_finish: config.disconnect_on_finish,
            state,
            event_tx,
            connection: ConnectionManager::new(config.retry),
            reconciler: Reconciler::new(),
            lifecycle: LifecycleMachine::new(config.session.player_id.clone()),
            timer: TurnTimer::new(),
            ticker,
            stream: None,
            opening: None,
            backoff: None,
            pull: None,
            submission: None,
            dispatched: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("engine loop started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        // Command channel closed: the engine handle was dropped.
                        None => {
                            debug!("command channel closed, shutting down engine loop");
                            break;
                        }
                    }
                }

                (generation, opened) = poll_slot(&mut self.opening) => {
                    self.opening = None;
                    self.on_opened(generation, opened).await;
                }

                generation = backoff_elapsed(&mut self.backoff) => {
                    self.backoff = None;
                    self.on_backoff_elapsed(generation);
                }

                (generation, frame) = next_frame(&mut self.stream) => {
                    self.on_frame(generation, frame);
                }

                (ticket, result) = poll_slot(&mut self.pull) => {
                    self.pull = None;
                    self.on_pull_complete(ticket, result).await;
                }

                outcome = poll_slot(&mut self.submission) => {
                    self.submission = None;
                    self.on_submission_complete(outcome);
                }

                _ = self.ticker.tick(), if self.timer.is_running() && !self.timer.state().expired => {
                    self.on_tick();
                }
            }
        }

        self.close_stream().await;
        self.connection.disconnect();
        self.publish_connection();
        self.state.running.store(false, Ordering::Release);
        debug!("engine loop exited");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(game_id) => self.connect(game_id).await,
            Command::Disconnect => self.disconnect().await,
            Command::Refresh => {
                if let Some(ticket) = self.reconciler.request_refresh() {
                    self.start_pull(ticket);
                }
            }
            Command::SelectWinner { player_id, reply } => {
                let result = self.lifecycle.select_winner(&player_id);
                if result.is_ok() {
                    debug!(player_id = %player_id, "winner selected");
                    self.publish_selection();
                }
                let _ = reply.send(result);
            }
            Command::ClearWinner => {
                self.lifecycle.clear_winner();
                self.publish_selection();
            }
            Command::SubmitWinner { reply } => self.start_submission(reply),
            Command::Status { reply } => {
                let status = self
                    .lifecycle
                    .game_id()
                    .map(|id| (id.to_string(), self.lifecycle.phase()));
                let _ = reply.send(status);
            }
        }
    }

    // ── Connection handling ─────────────────────────────────────────

    async fn connect(&mut self, game_id: GameId) {
        // Release the previous stream before opening a new one.
        self.close_stream().await;

        let attempt = match self.connection.connect(&game_id) {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!("connect rejected: {e}");
                self.publish_connection();
                return;
            }
        };

        if self.lifecycle.game_id() != Some(game_id.as_str()) {
            self.attach(&game_id);
        }

        self.publish_connection();
        self.start_open(attempt);
    }

    async fn disconnect(&mut self) {
        self.close_stream().await;
        self.connection.disconnect();
        self.publish_connection();
    }

    /// Switch all game-scoped state to `game_id`.
    fn attach(&mut self, game_id: &str) {
        info!(game_id, "attaching to game");
        self.lifecycle.attach(game_id);
        self.reconciler.reset(game_id);
        self.timer = TurnTimer::new();
        self.dispatched.clear();

        self.state.game_id.send_replace(Some(game_id.to_string()));
        self.state.snapshot.send_replace(None);
        self.state.timer.send_replace(self.timer.state());
        self.state.selected_winner.send_replace(None);
        let previous = self.state.phase.send_replace(LifecyclePhase::Waiting);
        if previous != LifecyclePhase::Waiting {
            self.emit(GameEvent::PhaseChanged {
                phase: LifecyclePhase::Waiting,
            });
        }
    }

    fn start_open(&mut self, attempt: ConnectAttempt) {
        let connector = Arc::clone(&self.connector);
        let ConnectAttempt {
            game_id,
            generation,
        } = attempt;
        debug!(game_id = %game_id, generation, "opening push stream");
        self.opening = Some(Box::pin(async move {
            let opened = connector.open(&game_id).await;
            (generation, opened)
        }));
    }

    async fn on_opened(&mut self, generation: u64, opened: Result<Box<dyn EventStream>>) {
        match opened {
            Ok(mut stream) => {
                if !self.connection.on_open(generation) {
                    if let Err(e) = stream.close().await {
                        debug!(generation, "error closing stale push stream: {e}");
                    }
                    return;
                }
                self.stream = Some((stream, generation));
                self.publish_connection();
                // Catch up on anything missed while the stream was down.
                if let Some(ticket) = self.reconciler.request_refresh() {
                    self.start_pull(ticket);
                }
            }
            Err(e) => {
                warn!("failed to open push stream: {e}");
                self.on_stream_failure(generation);
            }
        }
    }

    fn on_frame(&mut self, generation: u64, frame: Option<Result<String>>) {
        match frame {
            Some(Ok(text)) => match RemoteNotification::parse(&text) {
                Some(notification) => {
                    debug!(kind = %notification.kind, "notification received");
                    if let Some(ticket) = self.reconciler.on_notification(notification) {
                        self.start_pull(ticket);
                    }
                }
                None => debug!("keep-alive frame"),
            },
            Some(Err(e)) => {
                warn!("push stream error: {e}");
                self.stream = None;
                self.on_stream_failure(generation);
            }
            None => {
                info!("push stream closed by server");
                self.stream = None;
                self.on_stream_failure(generation);
            }
        }
    }

    fn on_stream_failure(&mut self, generation: u64) {
        match self.connection.on_failure(generation) {
            FailureOutcome::Retry { delay, .. } => {
                self.backoff = Some((Box::pin(tokio::time::sleep(delay)), generation));
            }
            FailureOutcome::Exhausted { attempts } => {
                error!(attempts, "connection lost, please reload");
                self.publish_connection();
                self.emit(GameEvent::ConnectionLost { attempts });
                return;
            }
            FailureOutcome::Stale => {}
        }
        self.publish_connection();
    }

    fn on_backoff_elapsed(&mut self, generation: u64) {
        if let Some(attempt) = self.connection.retry_due(generation) {
            self.publish_connection();
            self.start_open(attempt);
        }
    }

    /// Close the open stream and cancel any pending open or retry.
    async fn close_stream(&mut self) {
        self.opening = None;
        self.backoff = None;
        if let Some((mut stream, _)) = self.stream.take() {
            if let Err(e) = stream.close().await {
                debug!("error closing push stream: {e}");
            }
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────

    fn start_pull(&mut self, ticket: PullTicket) {
        debug!(
            game_id = %ticket.game_id,
            notifications = ticket.notifications.len(),
            "pulling game snapshot"
        );
        let gateway = Arc::clone(&self.gateway);
        self.pull = Some(Box::pin(async move {
            let result = gateway.fetch_game_snapshot(&ticket.game_id).await;
            (ticket, result)
        }));
    }

    async fn on_pull_complete(
        &mut self,
        ticket: PullTicket,
        result: std::result::Result<GameSnapshot, GatewayError>,
    ) {
        let mut finished = false;
        if !self.reconciler.is_current(&ticket) {
            debug!(game_id = %ticket.game_id, "discarding stale pull result");
        } else {
            match result {
                Ok(snapshot) => finished = self.apply_snapshot(snapshot, ticket.notifications),
                Err(e) => {
                    warn!(game_id = %ticket.game_id, "refresh failed: {e}");
                    self.emit(GameEvent::SyncError { error: e });
                }
            }
        }

        if finished {
            self.finish().await;
        }

        if let Some(next) = self.reconciler.complete() {
            self.start_pull(next);
        }
    }

    /// Hand a snapshot to the lifecycle machine and publish the consequences.
    /// Returns `true` if the game just finished.
    fn apply_snapshot(
        &mut self,
        snapshot: GameSnapshot,
        notifications: Vec<RemoteNotification>,
    ) -> bool {
        let changes = self.lifecycle.apply(snapshot);
        if !changes.is_empty() {
            self.dispatched.clear();
        }
        let current = self.lifecycle.snapshot().cloned().map(Arc::new);
        let mut finished = false;

        for change in changes {
            match change {
                LifecycleChange::SnapshotReplaced => {
                    self.state.snapshot.send_replace(current.clone());
                    if let Some(snapshot) = &current {
                        self.emit(GameEvent::SnapshotUpdated(Arc::clone(snapshot)));
                    }
                }
                LifecycleChange::RoundStarted(round) => {
                    let seconds = current.as_ref().map_or(0, |s| s.round_seconds());
                    self.restart_timer(seconds);
                    self.emit(GameEvent::RoundStarted { round });
                }
                LifecycleChange::PhaseChanged { to, .. } => self.on_phase_changed(to),
                LifecycleChange::MembershipLost => {
                    self.forget_game();
                    self.emit(GameEvent::MembershipLost);
                }
                LifecycleChange::Finished => finished = true,
            }
        }
        self.publish_selection();

        for notification in &notifications {
            self.dispatch(notification);
        }
        finished
    }

    /// Fire the semantic callback for one notification.
    ///
    /// A repeated notification is dropped until a pull returns a different
    /// snapshot.
    fn dispatch(&mut self, notification: &RemoteNotification) {
        let key = (notification.kind.clone(), notification.payload.clone());
        if !self.dispatched.insert(key) {
            debug!(kind = %notification.kind, "duplicate notification, callback already fired");
            return;
        }
        let event = match &notification.kind {
            NotificationKind::PlayerJoinedLobby => GameEvent::PlayerJoined {
                payload: notification.payload.clone(),
            },
            NotificationKind::PlayerLeftLobby => GameEvent::PlayerLeft {
                player_id: notification.payload_id(),
            },
            NotificationKind::GameStarted => GameEvent::GameStarted,
            NotificationKind::RoundEnded => GameEvent::RoundEnded {
                payload: notification.payload.clone(),
            },
            NotificationKind::GameEnded => GameEvent::GameEnded {
                winner_id: notification.payload_id(),
            },
            NotificationKind::Other(name) => {
                debug!(event = %name, "no callback for notification");
                return;
            }
        };
        self.emit(event);
    }

    async fn finish(&mut self) {
        info!(game_id = ?self.lifecycle.game_id(), "game finished, releasing resources");
        self.forget_game();
        self.reconciler.close();
        if self.disconnect_on_finish {
            self.disconnect().await;
        }
    }

    fn forget_game(&self) {
        if let Err(e) = self.store.clear(self.session_id) {
            warn!(session = %self.session_id, "failed to clear resumable game: {e}");
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    fn on_phase_changed(&mut self, phase: LifecyclePhase) {
        self.state.phase.send_replace(phase);
        self.emit(GameEvent::PhaseChanged { phase });
        if phase != LifecyclePhase::RoundActive && self.timer.is_running() {
            let stopped = self.timer.stop();
            self.state.timer.send_replace(stopped);
        } else if phase == LifecyclePhase::RoundActive {
            // Same round back after a gap: pick the countdown up where it stopped.
            if let Some(resumed) = self.timer.resume() {
                self.ticker.reset();
                debug!(seconds_remaining = resumed.seconds_remaining, "turn timer resumed");
                self.state.timer.send_replace(resumed);
                self.emit(GameEvent::TimerTick(resumed));
            }
        }
    }

    fn start_submission(&mut self, reply: oneshot::Sender<Result<SubmitWinnerResponse>>) {
        let Submission {
            game_id,
            round_id,
            winner_id,
        } = match self.lifecycle.begin_submission() {
            Ok(submission) => submission,
            Err(e) => {
                debug!("submission rejected: {e}");
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        info!(game_id = %game_id, round_id = %round_id, winner_id = %winner_id, "submitting round winner");
        let gateway = Arc::clone(&self.gateway);
        self.submission = Some(Box::pin(async move {
            let result = gateway.submit_round_winner(&game_id, &winner_id).await;
            SubmitOutcome {
                round_id,
                result,
                reply,
            }
        }));
    }

    fn on_submission_complete(&mut self, outcome: SubmitOutcome) {
        let SubmitOutcome {
            round_id,
            result,
            reply,
        } = outcome;
        let response = match result {
            Ok(response) => {
                if let Some(LifecycleChange::PhaseChanged { to, .. }) =
                    self.lifecycle.finish_submission(&round_id, true)
                {
                    self.on_phase_changed(to);
                }
                self.publish_selection();
                if let Some(ticket) = self.reconciler.request_refresh() {
                    self.start_pull(ticket);
                }
                Ok(response)
            }
            Err(e) => {
                self.lifecycle.finish_submission(&round_id, false);
                warn!(round_id = %round_id, "winner submission failed: {e}");
                Err(EngineError::Mutation(e))
            }
        };
        let _ = reply.send(response);
    }

    // ── Timer ───────────────────────────────────────────────────────

    fn restart_timer(&mut self, total_seconds: u64) {
        let state = self.timer.reset(total_seconds);
        self.ticker.reset();
        debug!(total_seconds, "turn timer reset");
        self.state.timer.send_replace(state);
        self.emit(GameEvent::TimerTick(state));
    }

    fn on_tick(&mut self) {
        let Some(tick) = self.timer.tick() else {
            return;
        };
        self.state.timer.send_replace(tick.state);
        self.emit(GameEvent::TimerTick(tick.state));
        if tick.expired_now {
            info!("turn timer expired");
            self.emit(GameEvent::TimerExpired);
        }
    }

    // ── Publishing ──────────────────────────────────────────────────

    fn publish_connection(&self) {
        let state = self.connection.state();
        let changed = self.state.connection.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(GameEvent::ConnectionChanged(state));
        }
    }

    fn publish_selection(&self) {
        let selected = self.lifecycle.selected_winner().map(str::to_string);
        self.state.selected_winner.send_if_modified(|current| {
            if *current == selected {
                false
            } else {
                *current = selected;
                true
            }
        });
    }

    fn emit(&self, event: GameEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("no event receivers, dropping event");
        }
    }
}

/// Await the future in `slot`, or never resolve if it is empty.
///
/// The caller must clear the slot once this resolves.
async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn backoff_elapsed(slot: &mut Option<(Pin<Box<Sleep>>, u64)>) -> u64 {
    match slot {
        Some((sleep, generation)) => {
            sleep.as_mut().await;
            *generation
        }
        None => std::future::pending().await,
    }
}

/// Receive from the open stream. Cancel-safe as long as the stream is.
async fn next_frame(
    stream: &mut Option<(Box<dyn EventStream>, u64)>,
) -> (u64, Option<Result<String>>) {
    match stream {
        Some((stream, generation)) => {
            let generation = *generation;
            (generation, stream.recv().await)
        }
        None => std::future::pending().await,
    }
}
