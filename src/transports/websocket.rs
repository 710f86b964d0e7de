//! WebSocket push stream using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] opens `{base_url}/GameEvents/{game_id}` and yields a
//! [`WebSocketEventStream`]. Each text message carries one or more
//! server-sent-event blocks separated by blank lines; the stream hands them
//! to the engine one block at a time. Both `ws://` and `wss://` URLs are
//! supported via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature. Use it when the
//! server relays the event stream over a WebSocket; the default HTTP stream
//! is `SseConnector`.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), activity_sync_client::EngineError> {
//! use activity_sync_client::transport::{EventStream, StreamConnector};
//! use activity_sync_client::WebSocketConnector;
//!
//! let connector = WebSocketConnector::new("ws://localhost:5000");
//! let mut stream = connector.open("g-42").await?;
//!
//! if let Some(Ok(block)) = stream.recv().await {
//!     println!("event: {block}");
//! }
//!
//! stream.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::EngineError;
use crate::transport::{EventStream, StreamConnector};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens one WebSocket push stream per game.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
    connect_timeout: Option<Duration>,
}

impl WebSocketConnector {
    /// Create a connector for the server at `base_url` (e.g. `wss://host/api`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: None,
        }
    }

    /// Fail an open with [`EngineError::Timeout`] if the handshake takes
    /// longer than `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The stream URL for `game_id`.
    pub fn url_for(&self, game_id: &str) -> String {
        format!("{}/GameEvents/{game_id}", self.base_url.trim_end_matches('/'))
    }

    async fn connect(url: &str) -> Result<WebSocketEventStream, EngineError> {
        tracing::debug!(url = %url, "connecting to push stream");

        let (stream, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| match e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => EngineError::Io(io),
                    other => EngineError::Transport(other.to_string()),
                })?;

        tracing::info!(url = %url, "push stream established");
        Ok(WebSocketEventStream::from_stream(stream))
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn open(&self, game_id: &str) -> Result<Box<dyn EventStream>, EngineError> {
        let url = self.url_for(game_id);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, Self::connect(&url))
                .await
                .map_err(|_| EngineError::Timeout)??,
            None => Self::connect(&url).await?,
        };
        Ok(Box::new(stream))
    }
}

/// A push stream backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](EventStream::recv) is cancel-safe: blocks split out of a message
/// are buffered on the struct, and the underlying `StreamExt::next` does not
/// lose frames when dropped.
#[derive(Debug)]
pub struct WebSocketEventStream {
    stream: WsStream,
    pending: VecDeque<String>,
    closed: bool,
}

impl WebSocketEventStream {
    /// Wrap an already-established WebSocket stream (custom TLS, headers, …).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

/// Split a message into its non-empty event blocks.
fn split_blocks(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split("\n\n")
        .flat_map(|chunk| chunk.split("\r\n\r\n"))
        .filter(|block| !block.trim().is_empty())
        .map(str::to_string)
}

#[async_trait]
impl EventStream for WebSocketEventStream {
    async fn recv(&mut self) -> Option<Result<String, EngineError>> {
        loop {
            if let Some(block) = self.pending.pop_front() {
                return Some(Ok(block));
            }

            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Some(Err(EngineError::Transport(e.to_string()))),
                None => return None,
            };

            match msg {
                Message::Text(text) => {
                    self.pending.extend(split_blocks(text.as_str()));
                    if self.pending.is_empty() {
                        tracing::trace!("empty push message (keep-alive)");
                    }
                }
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite answers pings itself.
                }
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.stream
            .close(None)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn types_are_send_and_debug() {
        fn assert_send_debug<T: Send + std::fmt::Debug>() {}
        assert_send_debug::<WebSocketEventStream>();
        assert_send_debug::<WebSocketConnector>();
    }

    #[test]
    fn url_joins_base_and_game_id() {
        let connector = WebSocketConnector::new("wss://example.com/api/");
        assert_eq!(
            connector.url_for("g-1"),
            "wss://example.com/api/GameEvents/g-1"
        );
    }

    #[test]
    fn blocks_are_split_on_blank_lines() {
        let blocks: Vec<String> =
            split_blocks("event: GameStarted\n\nevent: RoundEnded\ndata: x\n\n\n").collect();
        assert_eq!(blocks, vec!["event: GameStarted", "event: RoundEnded\ndata: x"]);
    }

    #[tokio::test]
    async fn open_fails_with_invalid_url() {
        let connector = WebSocketConnector::new("not-a-valid-url");
        let err = connector.open("g1").await.err().unwrap();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn open_fails_with_unreachable_host() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        let err = connector.open("g1").await.err().unwrap();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[tokio::test]
    async fn open_times_out() {
        // Accepts the TCP connection but never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"))
            .with_connect_timeout(Duration::from_millis(50));
        let err = connector.open("g1").await.err().unwrap();
        assert!(matches!(err, EngineError::Timeout));
        server.abort();
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection. Returns the base URL and the request path the client used.
    async fn start_mock_server<F, Fut>(handler: F) -> (String, oneshot::Receiver<String>)
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (path_tx, path_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let _ = path_tx.send(req.uri().path().to_string());
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(tcp, record_path)
                .await
                .unwrap();
            handler(ws).await;
        });

        (format!("ws://{addr}"), path_rx)
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn open_requests_game_events_path() {
        let (url, path) = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let _stream = WebSocketConnector::new(url).open("g-7").await.unwrap();
        assert_eq!(path.await.unwrap(), "/GameEvents/g-7");
    }

    #[tokio::test]
    async fn recv_yields_one_block_at_a_time() {
        let (url, _) = start_mock_server(|mut ws| async move {
            ws.send(Message::Text(
                "event: UserJoinedLobby\ndata: p2\n\nevent: GameStarted\n\n".into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("event: RoundEnded\n\n".into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut stream = WebSocketConnector::new(url).open("g1").await.unwrap();
        assert_eq!(
            stream.recv().await.unwrap().unwrap(),
            "event: UserJoinedLobby\ndata: p2"
        );
        assert_eq!(stream.recv().await.unwrap().unwrap(), "event: GameStarted");
        assert_eq!(stream.recv().await.unwrap().unwrap(), "event: RoundEnded");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_and_empty_messages() {
        let (url, _) = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("\n\n".into())).await.unwrap();
            ws.send(Message::Text("event: GameEnded\ndata: p1".into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut stream = WebSocketConnector::new(url).open("g1").await.unwrap();
        assert_eq!(
            stream.recv().await.unwrap().unwrap(),
            "event: GameEnded\ndata: p1"
        );
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let (url, _) =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut stream = WebSocketConnector::new(url).open("g1").await.unwrap();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn recv_after_close_does_not_hang() {
        let (url, _) =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut stream = WebSocketConnector::new(url).open("g1").await.unwrap();
        stream.close().await.unwrap();

        match stream.recv().await {
            None | Some(Err(_)) => {}
            Some(Ok(block)) => panic!("expected None or error after close, got Ok({block:?})"),
        }
    }
}
