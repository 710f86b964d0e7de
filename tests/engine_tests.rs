#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for the synchronization engine.
//!
//! Every test runs on a paused Tokio clock so backoff delays and the turn
//! timer can be asserted exactly. Streams and the game API are the scripted
//! mocks from `tests/common`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use activity_sync_client::protocol::{GameSettings, MethodType, NotificationKind};
use activity_sync_client::{
    ConnectionState, EngineConfig, EngineError, GameEngine, GameEvent, GatewayError,
    LifecyclePhase, MemoryResumeStore, PreconditionError, ResumeStore, Session,
};

use common::{
    collect_until, drain, finished, in_round, init_tracing, lobby, notification, player, settle,
    wait_for, MockConnector, MockGateway, OpenOutcome, LOCAL_ID,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

struct Harness {
    engine: GameEngine,
    events: broadcast::Receiver<GameEvent>,
    connector: MockConnector,
    gateway: MockGateway,
    store: Arc<MemoryResumeStore>,
}

fn start_with(connector: MockConnector, session: Session, store: Arc<MemoryResumeStore>) -> Harness {
    init_tracing();
    let gateway = MockGateway::new();
    let config = EngineConfig::new(session);
    let (engine, events) =
        GameEngine::start(connector.clone(), gateway.clone(), Arc::clone(&store), config);
    Harness {
        engine,
        events,
        connector,
        gateway,
        store,
    }
}

fn start(connector: MockConnector) -> Harness {
    start_with(
        connector,
        Session::new().with_player(LOCAL_ID, "bob"),
        Arc::new(MemoryResumeStore::new()),
    )
}

fn is_connected(event: &GameEvent) -> bool {
    matches!(event, GameEvent::ConnectionChanged(ConnectionState::Connected))
}

fn is_snapshot(event: &GameEvent) -> bool {
    matches!(event, GameEvent::SnapshotUpdated(_))
}

/// Attach to `game_id` (serving `snapshot`) and wait for the initial sync.
async fn attach(h: &mut Harness, snapshot: activity_sync_client::GameSnapshot) {
    let game_id = snapshot.id.clone();
    h.gateway.set_snapshot(snapshot);
    h.engine.connect(&game_id).unwrap();
    wait_for(&mut h.events, is_snapshot).await;
}

fn round_starts(events: &[GameEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            GameEvent::RoundStarted { round } => Some(round.id.clone()),
            _ => None,
        })
        .collect()
}

// ════════════════════════════════════════════════════════════════════
// Connection manager
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn backoff_doubles_then_exhausts() {
    let mut h = start(MockConnector::scripted([OpenOutcome::Fail; 6]));
    h.engine.connect("g1").unwrap();

    let lost = wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::ConnectionLost { .. })
    })
    .await;
    assert_eq!(lost, GameEvent::ConnectionLost { attempts: 5 });
    assert_eq!(h.engine.connection_state(), ConnectionState::Exhausted);

    let opens = h.connector.open_times();
    assert_eq!(opens.len(), 6);
    let delays: Vec<u128> = opens
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis())
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);

    // No further automatic attempts.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.open_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_attempt_count() {
    let mut h = start(MockConnector::scripted([OpenOutcome::Fail, OpenOutcome::Fail]));
    h.gateway.set_snapshot(lobby("g1"));
    h.engine.connect("g1").unwrap();
    wait_for(&mut h.events, is_connected).await;
    assert_eq!(h.connector.open_count(), 3);

    let dropped_at = Instant::now();
    h.connector.latest_server().fail();
    wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::ConnectionChanged(ConnectionState::Disconnected))
    })
    .await;
    wait_for(&mut h.events, is_connected).await;

    // Back to the base delay, not the third step of the sequence.
    let reopened_at = h.connector.open_times()[3];
    assert_eq!(reopened_at - dropped_at, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn server_hang_up_triggers_reconnect_and_catch_up_pull() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;
    assert_eq!(h.gateway.fetch_calls(), 1);

    let mut with_carol = lobby("g1");
    with_carol.players.push(player("p3", "carol", 0));
    h.gateway.set_snapshot(with_carol);
    h.connector.latest_server().hang_up();

    wait_for(&mut h.events, is_connected).await;
    let updated = wait_for(&mut h.events, is_snapshot).await;
    let GameEvent::SnapshotUpdated(snapshot) = updated else {
        panic!("expected snapshot, got {updated:?}");
    };
    assert_eq!(snapshot.players.len(), 3);
    assert_eq!(h.connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_cancels_retry() {
    let mut h = start(MockConnector::scripted([OpenOutcome::Fail]));
    h.engine.connect("g1").unwrap();
    wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::ConnectionChanged(ConnectionState::Disconnected))
    })
    .await;

    assert_ok!(h.engine.disconnect());
    wait_for(&mut h.events, |e| {
        matches!(e, GameEvent::ConnectionChanged(ConnectionState::Idle))
    })
    .await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.open_count(), 1);
    assert_eq!(h.engine.connection_state(), ConnectionState::Idle);

    // Idempotent.
    assert_ok!(h.engine.disconnect());
    settle().await;
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn connecting_to_another_game_releases_previous_stream() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;
    let first = h.connector.server(0);

    h.gateway.set_snapshot(lobby("g2"));
    h.engine.connect("g2").unwrap();
    let updated = wait_for(&mut h.events, is_snapshot).await;

    assert!(matches!(updated, GameEvent::SnapshotUpdated(s) if s.id == "g2"));
    assert!(first.is_closed());
    assert_eq!(h.connector.opened_games(), vec!["g1", "g2"]);
    assert_eq!(h.engine.game_id().as_deref(), Some("g2"));
}

#[tokio::test(start_paused = true)]
async fn blank_game_id_is_rejected_without_connecting() {
    let h = start(MockConnector::new());
    let err = assert_err!(h.engine.connect("   "));
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::MissingGameId)
    ));
    settle().await;
    assert_eq!(h.connector.open_count(), 0);
    assert_eq!(h.engine.connection_state(), ConnectionState::Idle);
}

// ════════════════════════════════════════════════════════════════════
// Reconciler
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn notification_burst_coalesces_into_one_follow_up_pull() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;
    assert_eq!(h.gateway.fetch_calls(), 1);

    let server = h.connector.latest_server();
    let gate = h.gateway.hold().await;

    server.notify(&notification(NotificationKind::PlayerJoinedLobby).with_payload("p3"));
    settle().await;
    assert_eq!(h.gateway.fetch_calls(), 2);

    server.notify(&notification(NotificationKind::PlayerJoinedLobby).with_payload("p4"));
    server.notify(&notification(NotificationKind::PlayerLeftLobby).with_payload("\"p3\""));
    server.notify(&notification(NotificationKind::GameStarted));
    h.gateway.set_snapshot(in_round("g1", "r1"));
    settle().await;
    assert_eq!(h.gateway.fetch_calls(), 2, "pulls must not overlap");

    drop(gate);
    let events = collect_until(&mut h.events, |e| *e == GameEvent::GameStarted).await;
    settle().await;

    assert_eq!(h.gateway.fetch_calls(), 3);
    assert_eq!(h.engine.snapshot().unwrap().as_ref(), &in_round("g1", "r1"));

    let callbacks: Vec<&GameEvent> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                GameEvent::PlayerJoined { .. }
                    | GameEvent::PlayerLeft { .. }
                    | GameEvent::GameStarted
            )
        })
        .collect();
    assert_eq!(
        callbacks,
        vec![
            &GameEvent::PlayerJoined {
                payload: Some("p3".into())
            },
            &GameEvent::PlayerJoined {
                payload: Some("p4".into())
            },
            &GameEvent::PlayerLeft {
                player_id: Some("p3".into())
            },
            &GameEvent::GameStarted,
        ]
    );
    assert_eq!(round_starts(&events), vec!["r1"]);
}

#[tokio::test(start_paused = true)]
async fn identical_snapshots_are_idempotent() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;
    settle().await;
    drain(&mut h.events);

    assert_ok!(h.engine.refresh());
    settle().await;
    assert_ok!(h.engine.refresh());
    settle().await;

    assert_eq!(h.gateway.fetch_calls(), 3);
    assert!(drain(&mut h.events).is_empty());
    assert_eq!(h.engine.phase(), LifecyclePhase::Waiting);
}

#[tokio::test(start_paused = true)]
async fn repeated_notification_fires_callback_once() {
    let mut h = start(MockConnector::new());
    attach(&mut h, in_round("g1", "r1")).await;
    settle().await;
    drain(&mut h.events);

    let server = h.connector.latest_server();
    server.notify(&notification(NotificationKind::GameStarted));
    settle().await;
    server.notify(&notification(NotificationKind::GameStarted));
    settle().await;

    assert_eq!(h.gateway.fetch_calls(), 3);
    let events = drain(&mut h.events);
    let started = events.iter().filter(|e| **e == GameEvent::GameStarted).count();
    assert_eq!(started, 1);
    assert!(!events.iter().any(is_snapshot));

    // New content re-arms the callback.
    let mut scored = in_round("g1", "r1");
    scored.players[1].score = Some(1);
    h.gateway.set_snapshot(scored);
    server.notify(&notification(NotificationKind::GameStarted));
    settle().await;
    let events = drain(&mut h.events);
    assert_eq!(
        events.iter().filter(|e| **e == GameEvent::GameStarted).count(),
        1
    );
    assert!(round_starts(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn keep_alive_frames_do_not_pull() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;

    let server = h.connector.latest_server();
    server.send_raw(": keep-alive\n\n");
    server.send_raw("retry: 5000\n\n");
    settle().await;
    assert_eq!(h.gateway.fetch_calls(), 1);

    // Unknown event names still invalidate.
    server.send_raw("event: ScoreboardChanged\ndata: {}\n\n");
    settle().await;
    assert_eq!(h.gateway.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_pull_is_reported_and_recovers_on_refresh() {
    let mut h = start(MockConnector::new());
    h.gateway.set_snapshot(lobby("g1"));
    h.gateway.fail_next_fetches(1);
    h.engine.connect("g1").unwrap();

    let event = wait_for(&mut h.events, |e| matches!(e, GameEvent::SyncError { .. })).await;
    assert_eq!(
        event,
        GameEvent::SyncError {
            error: GatewayError::new("Internal server error").with_status(500)
        }
    );
    let error = event.error().unwrap();
    assert!(matches!(&error, EngineError::Refresh(e) if e.status == Some(500)));
    assert!(error.is_recoverable());
    assert!(h.engine.snapshot().is_none());
    assert_eq!(h.engine.connection_state(), ConnectionState::Connected);

    assert_ok!(h.engine.refresh());
    wait_for(&mut h.events, is_snapshot).await;
    assert_eq!(h.engine.snapshot().unwrap().id, "g1");
}

// ════════════════════════════════════════════════════════════════════
// Lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn full_game_round_trip() {
    let mut h = start(MockConnector::new());
    h.gateway.set_snapshot(lobby("g1"));
    h.engine.join_game("g1").await.unwrap();
    let session = h.engine.session().id;
    assert_eq!(h.store.load(session).unwrap().as_deref(), Some("g1"));

    let mut seen = collect_until(&mut h.events, is_snapshot).await;
    assert_eq!(h.engine.phase(), LifecyclePhase::Waiting);
    let server = h.connector.latest_server();

    // Waiting → RoundActive(r1)
    h.gateway.set_snapshot(in_round("g1", "r1"));
    server.notify(&notification(NotificationKind::GameStarted));
    seen.extend(collect_until(&mut h.events, |e| *e == GameEvent::GameStarted).await);
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundActive);
    assert!(seen.contains(&GameEvent::PhaseChanged {
        phase: LifecyclePhase::RoundActive
    }));
    assert_eq!(h.engine.timer().total_seconds, 120);

    // RoundActive(r1) → RoundActive(r2)
    let mut next = in_round("g1", "r2");
    next.players[0].score = Some(1);
    h.gateway.set_snapshot(next);
    server.notify(&notification(NotificationKind::RoundEnded));
    let round_two = collect_until(&mut h.events, |e| {
        matches!(e, GameEvent::RoundEnded { .. })
    })
    .await;
    assert!(!round_two
        .iter()
        .any(|e| matches!(e, GameEvent::PhaseChanged { .. })));
    seen.extend(round_two);
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundActive);
    assert_eq!(h.engine.timer().seconds_remaining, 120);

    // → Finished
    h.gateway.set_snapshot(finished("g1"));
    server.notify(&notification(NotificationKind::GameEnded).with_payload("\"p2\""));
    seen.extend(collect_until(&mut h.events, |e| matches!(e, GameEvent::GameEnded { .. })).await);
    assert_eq!(
        seen.last(),
        Some(&GameEvent::GameEnded {
            winner_id: Some("p2".into())
        })
    );
    assert_eq!(h.engine.phase(), LifecyclePhase::Finished);
    assert_eq!(round_starts(&seen), vec!["r1", "r2"]);

    settle().await;
    assert!(server.is_closed());
    assert_eq!(h.engine.connection_state(), ConnectionState::Idle);
    assert_eq!(h.store.load(session).unwrap(), None);
    assert!(!h.engine.timer().running);

    let leader = h.engine.snapshot().unwrap().leader().cloned().unwrap();
    assert_eq!(leader.id, "p2");
}

#[tokio::test(start_paused = true)]
async fn turn_timer_counts_down_and_expires_once() {
    let mut h = start(MockConnector::new());
    h.gateway.set_snapshot(in_round("g1", "r1"));
    h.engine.connect("g1").unwrap();
    wait_for(&mut h.events, |e| matches!(e, GameEvent::RoundStarted { .. })).await;

    let start = h.engine.timer();
    assert_eq!(start.seconds_remaining, 120);
    assert_eq!(start.total_seconds, 120);
    assert!(start.running);

    let events = collect_until(&mut h.events, |e| *e == GameEvent::TimerExpired).await;
    let ticks = events
        .iter()
        .filter(|e| matches!(e, GameEvent::TimerTick(t) if t.seconds_remaining < 120))
        .count();
    assert_eq!(ticks, 120);
    assert_eq!(h.engine.timer().seconds_remaining, 0);
    assert!(h.engine.timer().expired);

    // Still the same round; no re-firing at the boundary.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let later = drain(&mut h.events);
    assert!(!later.contains(&GameEvent::TimerExpired));
    assert!(!later.iter().any(|e| matches!(e, GameEvent::TimerTick(_))));
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundActive);
}

#[tokio::test(start_paused = true)]
async fn round_gap_resumes_timer_without_new_round() {
    let mut h = start(MockConnector::new());
    attach(&mut h, in_round("g1", "r1")).await;

    let mut gap = in_round("g1", "r1");
    gap.current_round = None;
    h.gateway.set_snapshot(gap);
    assert_ok!(h.engine.refresh());
    wait_for(&mut h.events, |e| {
        *e == GameEvent::PhaseChanged {
            phase: LifecyclePhase::RoundEnded,
        }
    })
    .await;
    let stopped = h.engine.timer();
    assert!(!stopped.running);
    drain(&mut h.events);

    h.gateway.set_snapshot(in_round("g1", "r1"));
    assert_ok!(h.engine.refresh());
    let mut events = collect_until(&mut h.events, |e| {
        *e == GameEvent::PhaseChanged {
            phase: LifecyclePhase::RoundActive,
        }
    })
    .await;
    settle().await;
    events.extend(drain(&mut h.events));

    assert!(round_starts(&events).is_empty());
    let resumed = h.engine.timer();
    assert!(resumed.running);
    assert_eq!(resumed.total_seconds, 120);
    assert_eq!(resumed.seconds_remaining, stopped.seconds_remaining);
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundActive);
}

#[tokio::test(start_paused = true)]
async fn failed_submission_keeps_round_and_selection() {
    let mut h = start(MockConnector::new());
    attach(&mut h, in_round("g1", "r1")).await;

    h.engine.select_winner("p2").await.unwrap();
    assert_eq!(h.engine.selected_winner().as_deref(), Some("p2"));

    h.gateway.fail_submissions(true);
    let err = h.engine.submit_round_winner().await.unwrap_err();
    assert!(matches!(&err, EngineError::Mutation(e) if e.message == "Network error"));
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundActive);
    assert_eq!(h.engine.selected_winner().as_deref(), Some("p2"));

    // The caller retries; the engine never does.
    h.gateway.fail_submissions(false);
    let response = h.engine.submit_round_winner().await.unwrap();
    assert!(!response.is_game_won);
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundEnded);
    assert_eq!(h.engine.selected_winner(), None);
    assert_eq!(h.gateway.calls(), vec!["submit:g1:p2", "submit:g1:p2"]);

    // A pull that still shows r1 does not reopen the round.
    settle().await;
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundEnded);

    h.gateway.set_snapshot(in_round("g1", "r2"));
    h.connector
        .latest_server()
        .notify(&notification(NotificationKind::RoundEnded));
    wait_for(
        &mut h.events,
        |e| matches!(e, GameEvent::RoundStarted { round } if round.id == "r2"),
    )
    .await;
    assert_eq!(h.engine.phase(), LifecyclePhase::RoundActive);
}

#[tokio::test(start_paused = true)]
async fn preconditions_are_checked_before_any_request() {
    let mut h = start(MockConnector::new());

    let err = h.engine.start_game().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::NoActiveGame)
    ));
    let err = h.engine.submit_round_winner().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::NoActiveRound)
    ));
    let bad = GameSettings {
        timer_minutes: 0,
        max_score: 5,
        enabled_methods: vec![MethodType::Mimic],
    };
    let err = h.engine.update_settings(&bad).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::InvalidSettings(_))
    ));

    attach(&mut h, lobby("g1")).await;
    let err = h.engine.select_winner("p1").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::NoActiveRound)
    ));

    h.gateway.set_snapshot(in_round("g1", "r1"));
    assert_ok!(h.engine.refresh());
    wait_for(&mut h.events, |e| matches!(e, GameEvent::RoundStarted { .. })).await;

    let err = h.engine.select_winner("nobody").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::UnknownPlayer(_))
    ));
    let err = h.engine.submit_round_winner().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::NoWinnerSelected)
    ));

    assert!(h.gateway.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_game_and_settings_refresh_afterwards() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;

    let settings = GameSettings {
        timer_minutes: 3,
        max_score: 5,
        enabled_methods: vec![MethodType::Drawing, MethodType::Mimic],
    };
    let mut updated = lobby("g1");
    updated.timer_minutes = 3;
    updated.max_score = 5;
    h.gateway.set_snapshot(updated);
    h.engine.update_settings(&settings).await.unwrap();
    let event = wait_for(&mut h.events, is_snapshot).await;
    assert!(matches!(event, GameEvent::SnapshotUpdated(s) if s.timer_minutes == 3));

    let mut started = in_round("g1", "r1");
    started.timer_minutes = 3;
    h.gateway.set_snapshot(started);
    h.engine.start_game().await.unwrap();
    wait_for(&mut h.events, |e| matches!(e, GameEvent::RoundStarted { .. })).await;
    assert_eq!(h.engine.timer().total_seconds, 180);

    assert_eq!(h.gateway.calls(), vec!["settings:g1:3:5", "start:g1"]);
}

#[tokio::test(start_paused = true)]
async fn mutations_rejected_after_game_finished() {
    let mut h = start(MockConnector::new());
    attach(&mut h, finished("g1")).await;
    settle().await;
    assert_eq!(h.engine.phase(), LifecyclePhase::Finished);

    let err = h.engine.start_game().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::GameFinished)
    ));
    let err = h.engine.submit_round_winner().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::GameFinished)
    ));
}

// ════════════════════════════════════════════════════════════════════
// Session and resume
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn resume_reattaches_saved_game() {
    let session = Session::new().with_player(LOCAL_ID, "bob");
    let store = Arc::new(MemoryResumeStore::new());
    store.save(session.id, "g1").unwrap();

    let mut h = start_with(MockConnector::new(), session, store);
    h.gateway.set_snapshot(lobby("g1"));

    assert_eq!(h.engine.resume().await.unwrap().as_deref(), Some("g1"));
    wait_for(&mut h.events, is_snapshot).await;
    assert_eq!(h.engine.game_id().as_deref(), Some("g1"));
    assert_eq!(h.connector.opened_games(), vec!["g1"]);
}

#[tokio::test(start_paused = true)]
async fn resume_without_saved_game_stays_idle() {
    let h = start(MockConnector::new());
    assert_eq!(h.engine.resume().await.unwrap(), None);
    settle().await;
    assert_eq!(h.connector.open_count(), 0);
    assert_eq!(h.engine.connection_state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn losing_membership_clears_resume_id() {
    let mut h = start(MockConnector::new());
    h.gateway.set_snapshot(lobby("g1"));
    h.engine.join_game("g1").await.unwrap();
    wait_for(&mut h.events, is_snapshot).await;
    let session = h.engine.session().id;
    assert!(h.store.load(session).unwrap().is_some());

    let mut kicked = lobby("g1");
    kicked.players.retain(|p| p.id != LOCAL_ID);
    h.gateway.set_snapshot(kicked);
    h.connector
        .latest_server()
        .notify(&notification(NotificationKind::PlayerLeftLobby).with_payload(LOCAL_ID));

    let events = collect_until(&mut h.events, |e| matches!(e, GameEvent::PlayerLeft { .. })).await;
    assert!(events.contains(&GameEvent::MembershipLost));
    assert_eq!(
        events.last(),
        Some(&GameEvent::PlayerLeft {
            player_id: Some(LOCAL_ID.into())
        })
    );
    assert_eq!(h.store.load(session).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn create_game_saves_and_connects() {
    let mut h = start(MockConnector::new());
    h.gateway.set_created_game_id("g9");
    h.gateway.set_snapshot(lobby("g9"));

    let game_id = h.engine.create_game().await.unwrap();
    assert_eq!(game_id, "g9");
    assert_eq!(
        h.store.load(h.engine.session().id).unwrap().as_deref(),
        Some("g9")
    );
    wait_for(&mut h.events, is_connected).await;
    assert_eq!(h.connector.opened_games(), vec!["g9"]);
}

#[tokio::test(start_paused = true)]
async fn join_failure_surfaces_server_message() {
    let h = start(MockConnector::new());
    let err = h.engine.join_game("missing").await.unwrap_err();
    assert!(matches!(&err, EngineError::Mutation(e) if e.status == Some(404)));
    assert_eq!(err.to_string(), "request failed: Game not found");
    assert_eq!(h.store.load(h.engine.session().id).unwrap(), None);
    settle().await;
    assert_eq!(h.connector.open_count(), 0);
}

// ════════════════════════════════════════════════════════════════════
// Handle
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn every_subscriber_sees_events() {
    let mut h = start(MockConnector::new());
    let mut second = h.engine.subscribe();
    let mut phases = h.engine.watch_phase();

    attach(&mut h, in_round("g1", "r1")).await;
    wait_for(&mut second, is_snapshot).await;

    phases.changed().await.unwrap();
    assert_eq!(*phases.borrow(), LifecyclePhase::RoundActive);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_stream_and_stops_engine() {
    let mut h = start(MockConnector::new());
    attach(&mut h, lobby("g1")).await;
    let server = h.connector.latest_server();

    h.engine.shutdown().await;
    assert!(server.is_closed());
    assert!(!h.engine.is_running());

    let err = assert_err!(h.engine.connect("g1"));
    assert!(matches!(err, EngineError::EngineStopped));
    let err = h.engine.select_winner("p1").await.unwrap_err();
    assert!(matches!(err, EngineError::EngineStopped));
}
