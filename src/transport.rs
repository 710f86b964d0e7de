//! Push-stream abstraction.
//!
//! The push stream is a one-directional channel of server-sent-event blocks.
//! [`StreamConnector`] opens one stream per game; [`EventStream`] yields the
//! raw text blocks, which the engine decodes with
//! [`RemoteNotification::parse`](crate::protocol::RemoteNotification::parse).
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use activity_sync_client::error::EngineError;
//! use activity_sync_client::transport::{EventStream, StreamConnector};
//!
//! struct MyStream { /* ... */ }
//! struct MyConnector { /* ... */ }
//!
//! #[async_trait]
//! impl EventStream for MyStream {
//!     async fn recv(&mut self) -> Option<Result<String, EngineError>> {
//!         // Return the next event block, or None when the server closed the stream
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), EngineError> {
//!         Ok(())
//!     }
//! }
//!
//! #[async_trait]
//! impl StreamConnector for MyConnector {
//!     async fn open(&self, game_id: &str) -> Result<Box<dyn EventStream>, EngineError> {
//!         Ok(Box::new(MyStream {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::EngineError;

/// One open push stream.
///
/// # Cancel Safety
///
/// [`recv`](EventStream::recv) **MUST** be cancel-safe because the engine
/// polls it inside `tokio::select!`. Dropping a pending `recv` future must not
/// lose a message.
#[async_trait]
pub trait EventStream: Send + 'static {
    /// Receive the next event block.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: one complete event block
    /// - `Some(Err(e))`: a transport error; the stream is considered dead
    /// - `None`: the server closed the stream
    async fn recv(&mut self) -> Option<Result<String, EngineError>>;

    /// Release the underlying network resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations must
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), EngineError>;
}

/// Opens push streams for a game.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    /// Open the push stream for `game_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] (or another transport-class error)
    /// when the stream could not be established.
    async fn open(&self, game_id: &str) -> Result<Box<dyn EventStream>, EngineError>;
}
