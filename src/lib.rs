//! # Activity Sync Client
//!
//! Real-time game state synchronization for turn-based party game clients.
//!
//! The server pushes payload-light notifications over a long-lived stream;
//! every notification is treated as an invalidation hint and answered with an
//! authoritative pull of the full game snapshot. From those snapshots the
//! engine derives the lifecycle phase, fires semantic events and runs the
//! local turn countdown.
//!
//! ## Features
//!
//! - **Self-healing connection** with bounded exponential backoff
//! - **Coalesced pulls**: at most one in flight, at most one queued
//! - **Lifecycle machine** deriving Waiting / RoundActive / RoundEnded / Finished
//! - **Turn timer** that resets exactly once per round
//! - **Transport-agnostic**: implement [`StreamConnector`] and
//!   [`RequestGateway`] for any backend; the default features provide
//!   `SseConnector` (`transport-sse`) and `HttpGateway` (`gateway-http`),
//!   and `transport-websocket` adds `WebSocketConnector`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let api = "https://games.example.com/api";
//! let (engine, mut events) = GameEngine::start(
//!     SseConnector::new(api).with_bearer_token(&token),
//!     HttpGateway::new(api).with_bearer_token(&token),
//!     JsonFileResumeStore::new("resume.json"),
//!     EngineConfig::new(Session::new().with_player(player_id, username)),
//! );
//!
//! if engine.resume().await?.is_none() {
//!     engine.join_game(&invite_code).await?;
//! }
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod gateway;
pub mod gateways;
pub mod lifecycle;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod timer;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use connection::{ConnectionState, RetryPolicy};
pub use engine::{EngineConfig, GameEngine};
pub use error::{EngineError, GatewayError, PreconditionError};
pub use event::GameEvent;
pub use gateway::RequestGateway;
pub use lifecycle::LifecyclePhase;
pub use protocol::{GameSettings, GameSnapshot, NotificationKind, RemoteNotification};
pub use session::{JsonFileResumeStore, MemoryResumeStore, ResumeStore, Session};
pub use timer::TimerState;
pub use transport::{EventStream, StreamConnector};

#[cfg(feature = "gateway-http")]
pub use gateways::HttpGateway;
#[cfg(feature = "transport-sse")]
pub use transports::SseConnector;
#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketConnector;
