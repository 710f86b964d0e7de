//! Push-stream transport implementations.
//!
//! Concrete [`StreamConnector`](crate::transport::StreamConnector)
//! implementations live behind feature gates:
//!
//! | Feature                | Connector              | Wire                         |
//! |------------------------|------------------------|------------------------------|
//! | `transport-sse`        | `SseConnector`         | HTTP `text/event-stream`     |
//! | `transport-websocket`  | `WebSocketConnector`   | event blocks in text frames  |
//!
//! # Example
//!
//! ```rust,ignore
//! use activity_sync_client::{EngineConfig, GameEngine, MemoryResumeStore, Session};
//! use activity_sync_client::SseConnector;
//!
//! let connector = SseConnector::new("https://games.example.com/api").with_bearer_token(token);
//! let (engine, events) = GameEngine::start(
//!     connector,
//!     my_gateway,
//!     MemoryResumeStore::new(),
//!     EngineConfig::new(Session::new()),
//! );
//! ```

#[cfg(feature = "transport-sse")]
pub mod sse;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-sse")]
pub use sse::{SseConnector, SseEventStream};

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketEventStream};
