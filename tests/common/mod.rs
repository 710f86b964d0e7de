#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for the engine integration tests.
//!
//! Provides a scripted [`MockConnector`] whose streams are driven from the
//! test through [`StreamServer`] handles, a [`MockGateway`] serving settable
//! snapshots, and snapshot fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, OwnedMutexGuard};
use tokio::time::Instant;

use activity_sync_client::protocol::{
    GameSettings, GameSnapshot, GameStatus, MethodType, NotificationKind, Player, Round,
    SubmitWinnerResponse,
};
use activity_sync_client::{
    EngineError, EventStream, GameEvent, GatewayError, RemoteNotification, RequestGateway,
    StreamConnector,
};

// ── MockConnector ───────────────────────────────────────────────────

/// What the next `open` call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Accept,
    Fail,
}

enum ServerItem {
    Frame(String),
    Fail,
    HangUp,
}

/// Test-side handle of one open mock stream.
#[derive(Clone)]
pub struct StreamServer {
    tx: mpsc::UnboundedSender<ServerItem>,
    closed: Arc<AtomicBool>,
}

impl StreamServer {
    /// Push a notification to the client.
    pub fn notify(&self, notification: &RemoteNotification) {
        self.send_raw(&notification.to_frame());
    }

    /// Push a raw frame.
    pub fn send_raw(&self, frame: &str) {
        let _ = self.tx.send(ServerItem::Frame(frame.to_string()));
    }

    /// Make the stream fail with a transport error.
    pub fn fail(&self) {
        let _ = self.tx.send(ServerItem::Fail);
    }

    /// Close the stream from the server side.
    pub fn hang_up(&self) {
        let _ = self.tx.send(ServerItem::HangUp);
    }

    /// Whether the client called `close()`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<ServerItem>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl EventStream for MockStream {
    async fn recv(&mut self) -> Option<Result<String, EngineError>> {
        match self.rx.recv().await {
            Some(ServerItem::Frame(frame)) => Some(Ok(frame)),
            Some(ServerItem::Fail) => Some(Err(EngineError::Transport("stream reset".into()))),
            Some(ServerItem::HangUp) | None => None,
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorInner {
    script: StdMutex<VecDeque<OpenOutcome>>,
    opens: StdMutex<Vec<(String, Instant)>>,
    servers: StdMutex<Vec<StreamServer>>,
}

/// A connector whose `open` outcomes are scripted. Once the script runs out
/// every open is accepted.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = OpenOutcome>) -> Self {
        let connector = Self::default();
        connector.inner.script.lock().unwrap().extend(outcomes);
        connector
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.lock().unwrap().len()
    }

    /// Instants at which `open` was called.
    pub fn open_times(&self) -> Vec<Instant> {
        self.inner
            .opens
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    /// Game ids passed to `open`, in order.
    pub fn opened_games(&self) -> Vec<String> {
        self.inner
            .opens
            .lock()
            .unwrap()
            .iter()
            .map(|(game, _)| game.clone())
            .collect()
    }

    /// The `index`-th successfully opened stream.
    pub fn server(&self, index: usize) -> StreamServer {
        self.inner.servers.lock().unwrap()[index].clone()
    }

    /// The most recently opened stream.
    pub fn latest_server(&self) -> StreamServer {
        self.inner
            .servers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no stream has been opened")
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn open(&self, game_id: &str) -> Result<Box<dyn EventStream>, EngineError> {
        self.inner
            .opens
            .lock()
            .unwrap()
            .push((game_id.to_string(), Instant::now()));
        let outcome = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenOutcome::Accept);

        match outcome {
            OpenOutcome::Fail => Err(EngineError::Transport("connection refused".into())),
            OpenOutcome::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));
                self.inner.servers.lock().unwrap().push(StreamServer {
                    tx,
                    closed: Arc::clone(&closed),
                });
                Ok(Box::new(MockStream { rx, closed }))
            }
        }
    }
}

// ── MockGateway ─────────────────────────────────────────────────────

#[derive(Default)]
struct GatewayInner {
    snapshots: StdMutex<HashMap<String, GameSnapshot>>,
    fetch_calls: StdMutex<usize>,
    failing_fetches: StdMutex<usize>,
    fail_submissions: AtomicBool,
    game_won: AtomicBool,
    created_game_id: StdMutex<Option<String>>,
    calls: StdMutex<Vec<String>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

/// An in-memory game API. Snapshots are served per game id.
#[derive(Clone, Default)]
pub struct MockGateway {
    inner: Arc<GatewayInner>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `snapshot` for its game id from now on.
    pub fn set_snapshot(&self, snapshot: GameSnapshot) {
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Number of `fetch_game_snapshot` calls started so far.
    pub fn fetch_calls(&self) -> usize {
        *self.inner.fetch_calls.lock().unwrap()
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: usize) {
        *self.inner.failing_fetches.lock().unwrap() = n;
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.inner.fail_submissions.store(fail, Ordering::Release);
    }

    pub fn set_game_won(&self, won: bool) {
        self.inner.game_won.store(won, Ordering::Release);
    }

    pub fn set_created_game_id(&self, game_id: &str) {
        *self.inner.created_game_id.lock().unwrap() = Some(game_id.to_string());
    }

    /// Every mutation call, as `"<operation>:<game id>[:<arg>]"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Block all fetches until the guard is dropped. Fetches still count as
    /// started.
    pub async fn hold(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner.gate).lock_owned().await
    }

    fn record(&self, call: String) {
        self.inner.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RequestGateway for MockGateway {
    async fn create_game(&self) -> Result<String, GatewayError> {
        self.record("create".into());
        self.inner
            .created_game_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::new("Could not create game").with_status(500))
    }

    async fn join_game(&self, game_id: &str) -> Result<(), GatewayError> {
        self.record(format!("join:{game_id}"));
        if self.inner.snapshots.lock().unwrap().contains_key(game_id) {
            Ok(())
        } else {
            Err(GatewayError::new("Game not found").with_status(404))
        }
    }

    async fn start_game(&self, game_id: &str) -> Result<(), GatewayError> {
        self.record(format!("start:{game_id}"));
        Ok(())
    }

    async fn submit_round_winner(
        &self,
        game_id: &str,
        winner_id: &str,
    ) -> Result<SubmitWinnerResponse, GatewayError> {
        self.record(format!("submit:{game_id}:{winner_id}"));
        if self.inner.fail_submissions.load(Ordering::Acquire) {
            return Err(GatewayError::new("Network error"));
        }
        Ok(SubmitWinnerResponse {
            is_game_won: self.inner.game_won.load(Ordering::Acquire),
        })
    }

    async fn update_settings(
        &self,
        game_id: &str,
        settings: &GameSettings,
    ) -> Result<(), GatewayError> {
        self.record(format!(
            "settings:{game_id}:{}:{}",
            settings.timer_minutes, settings.max_score
        ));
        Ok(())
    }

    async fn fetch_game_snapshot(&self, game_id: &str) -> Result<GameSnapshot, GatewayError> {
        *self.inner.fetch_calls.lock().unwrap() += 1;
        let _gate = self.inner.gate.lock().await;

        {
            let mut failing = self.inner.failing_fetches.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(GatewayError::new("Internal server error").with_status(500));
            }
        }

        self.inner
            .snapshots
            .lock()
            .unwrap()
            .get(game_id)
            .cloned()
            .ok_or_else(|| GatewayError::new("Game not found").with_status(404))
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub const HOST_ID: &str = "p1";
pub const LOCAL_ID: &str = "p2";

pub fn player(id: &str, username: &str, score: u32) -> Player {
    Player {
        id: id.into(),
        username: username.into(),
        score: Some(score),
        is_host: id == HOST_ID,
    }
}

/// A two-player lobby hosted by `p1` (alice), with `p2` (bob) joined.
pub fn lobby(game_id: &str) -> GameSnapshot {
    GameSnapshot {
        id: game_id.into(),
        host: player(HOST_ID, "alice", 0),
        timer_minutes: 2,
        max_score: 3,
        players: vec![player(HOST_ID, "alice", 0), player(LOCAL_ID, "bob", 0)],
        enabled_methods: MethodType::ALL.to_vec(),
        status: GameStatus::Waiting,
        current_round: None,
    }
}

/// The lobby with a round in progress, alice drawing.
pub fn in_round(game_id: &str, round_id: &str) -> GameSnapshot {
    GameSnapshot {
        status: GameStatus::InProgress,
        current_round: Some(Round {
            id: round_id.into(),
            method_type: MethodType::Drawing,
            word: "lighthouse".into(),
            active_player_username: "alice".into(),
        }),
        ..lobby(game_id)
    }
}

pub fn finished(game_id: &str) -> GameSnapshot {
    let mut snapshot = lobby(game_id);
    snapshot.status = GameStatus::Finished;
    snapshot.players[1].score = Some(3);
    snapshot
}

pub fn notification(kind: NotificationKind) -> RemoteNotification {
    RemoteNotification::new(kind)
}

// ── Tracing ─────────────────────────────────────────────────────────

/// Route engine logs to the test output. Honors `RUST_LOG`; defaults to
/// `warn`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ── Event helpers ───────────────────────────────────────────────────

/// Virtual time budget for waiting on an event under a paused clock.
const WAIT_BUDGET: Duration = Duration::from_secs(600);

/// Receive events until one matches `pred`. Returns every event received,
/// the matching one last.
pub async fn collect_until<F>(
    events: &mut broadcast::Receiver<GameEvent>,
    mut pred: F,
) -> Vec<GameEvent>
where
    F: FnMut(&GameEvent) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT_BUDGET, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    panic!("event receiver lagged by {skipped} events");
                }
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event");
    seen
}

/// Receive events until one matches `pred` and return it.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<GameEvent>, pred: F) -> GameEvent
where
    F: FnMut(&GameEvent) -> bool,
{
    collect_until(events, pred)
        .await
        .pop()
        .expect("collect_until returns the matching event")
}

/// Everything already queued on the receiver.
pub fn drain(events: &mut broadcast::Receiver<GameEvent>) -> Vec<GameEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => return seen,
        }
    }
}

/// Let the engine loop run until it is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
