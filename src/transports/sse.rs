//! Server-sent-events push stream over HTTP using `reqwest`.
//!
//! [`SseConnector`] issues `GET {base_url}/GameEvents/{game_id}` with
//! `Accept: text/event-stream` and yields an [`SseEventStream`] that reads the
//! chunked response body. Chunks are buffered until a blank line completes an
//! event block; each block is handed to the engine as-is.
//!
//! # Feature gate
//!
//! Only available with the `transport-sse` feature (enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), activity_sync_client::EngineError> {
//! use activity_sync_client::transport::{EventStream, StreamConnector};
//! use activity_sync_client::SseConnector;
//!
//! let connector = SseConnector::new("https://games.example.com/api");
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
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Response};

use crate::error::EngineError;
use crate::transport::{EventStream, StreamConnector};

/// Opens one HTTP event stream per game.
#[derive(Debug, Clone)]
pub struct SseConnector {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
    connect_timeout: Option<Duration>,
}

impl SseConnector {
    /// Create a connector for the API at `base_url` (e.g. `https://host/api`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            bearer_token: None,
            connect_timeout: None,
        }
    }

    /// Use a preconfigured client (proxies, custom TLS roots, cookies).
    ///
    /// Do not set a total request timeout on it: the response body of an
    /// event stream never completes.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Send `Authorization: Bearer <token>` with every open.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Fail an open with [`EngineError::Timeout`] if the response headers
    /// take longer than `timeout` to arrive.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The stream URL for `game_id`.
    pub fn url_for(&self, game_id: &str) -> String {
        format!("{}/GameEvents/{game_id}", self.base_url.trim_end_matches('/'))
    }

    async fn connect(&self, url: &str) -> Result<SseEventStream, EngineError> {
        tracing::debug!(url = %url, "connecting to push stream");

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Transport(format!(
                "push stream rejected with status {status}"
            )));
        }

        tracing::info!(url = %url, "push stream established");
        Ok(SseEventStream::from_response(response))
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn open(&self, game_id: &str) -> Result<Box<dyn EventStream>, EngineError> {
        let url = self.url_for(game_id);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.connect(&url))
                .await
                .map_err(|_| EngineError::Timeout)??,
            None => self.connect(&url).await?,
        };
        Ok(Box::new(stream))
    }
}

/// A push stream backed by a `text/event-stream` response body.
///
/// # Cancel Safety
///
/// [`recv`](EventStream::recv) is cancel-safe: partial blocks live in the
/// struct's buffer, and `Response::chunk` only consumes body data when it
/// resolves.
#[derive(Debug)]
pub struct SseEventStream {
    response: Option<Response>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
}

impl SseEventStream {
    /// Wrap a response whose body is an event stream.
    pub fn from_response(response: Response) -> Self {
        Self {
            response: Some(response),
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn queue_complete_blocks(&mut self) {
        while let Some(block) = take_block(&mut self.buffer) {
            let text = String::from_utf8_lossy(&block);
            if text.trim().is_empty() {
                continue;
            }
            self.pending.push_back(text.into_owned());
        }
    }
}

/// Remove the first blank-line-terminated block from `buffer`.
///
/// Returns the block without its terminator, or `None` if no complete block
/// is buffered yet.
fn take_block(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let haystack: &[u8] = buffer;
    let (end, terminator) = [b"\n\n".as_slice(), b"\r\n\r\n".as_slice()]
        .into_iter()
        .filter_map(|sep| find(haystack, sep).map(|at| (at, sep.len())))
        .min_by_key(|(at, _)| *at)?;
    let rest = buffer.split_off(end + terminator);
    let mut block = std::mem::replace(buffer, rest);
    block.truncate(end);
    Some(block)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[async_trait]
impl EventStream for SseEventStream {
    async fn recv(&mut self) -> Option<Result<String, EngineError>> {
        loop {
            if let Some(block) = self.pending.pop_front() {
                return Some(Ok(block));
            }

            let response = self.response.as_mut()?;
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.queue_complete_blocks();
                }
                Ok(None) => {
                    self.response = None;
                    let rest = std::mem::take(&mut self.buffer);
                    if String::from_utf8_lossy(&rest).trim().is_empty() {
                        return None;
                    }
                    tracing::debug!(bytes = rest.len(), "push stream ended mid-event");
                    return Some(Err(EngineError::TransportClosed));
                }
                Err(e) => {
                    self.response = None;
                    return Some(Err(EngineError::Transport(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        // Dropping the response releases the connection.
        self.response = None;
        self.buffer.clear();
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn types_are_send_and_debug() {
        fn assert_send_debug<T: Send + std::fmt::Debug>() {}
        assert_send_debug::<SseEventStream>();
        assert_send_debug::<SseConnector>();
    }

    #[test]
    fn url_joins_base_and_game_id() {
        let connector = SseConnector::new("https://example.com/api/");
        assert_eq!(
            connector.url_for("g-1"),
            "https://example.com/api/GameEvents/g-1"
        );
    }

    #[test]
    fn blocks_wait_for_blank_line() {
        let mut buffer = b"event: GameStarted\n\nevent: Round".to_vec();
        assert_eq!(take_block(&mut buffer).unwrap(), b"event: GameStarted");
        assert!(take_block(&mut buffer).is_none());
        assert_eq!(buffer, b"event: Round");

        buffer.extend_from_slice(b"Ended\r\n\r\n: ping\n\n");
        assert_eq!(take_block(&mut buffer).unwrap(), b"event: RoundEnded");
        assert_eq!(take_block(&mut buffer).unwrap(), b": ping");
        assert!(buffer.is_empty());
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Serve one HTTP response on a local port: `head` is the status line
    /// plus headers, then each body chunk is written and flushed in turn.
    /// Returns the base URL and the raw request head the client sent.
    async fn start_mock_server(
        head: &'static str,
        chunks: Vec<&'static str>,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_tx, request_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while find(&request, b"\r\n\r\n").is_none() {
                let n = tcp.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let _ = request_tx.send(String::from_utf8_lossy(&request).into_owned());

            tcp.write_all(head.as_bytes()).await.unwrap();
            for chunk in chunks {
                tcp.write_all(chunk.as_bytes()).await.unwrap();
                tcp.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tcp.shutdown().await.unwrap();
        });

        (format!("http://{addr}"), request_rx)
    }

    const EVENT_STREAM_OK: &str = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/event-stream\r\n\
        Cache-Control: no-cache\r\n\
        Connection: close\r\n\r\n";

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn open_requests_event_stream_with_token() {
        let (url, request) = start_mock_server(EVENT_STREAM_OK, vec![]).await;

        let _stream = SseConnector::new(url)
            .with_bearer_token("secret")
            .open("g-7")
            .await
            .unwrap();

        let request = request.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("GET /GameEvents/g-7 HTTP/1.1\r\n"));
        assert!(lower.contains("accept: text/event-stream\r\n"));
        assert!(lower.contains("authorization: bearer secret\r\n"));
    }

    #[tokio::test]
    async fn recv_reassembles_blocks_across_chunks() {
        let (url, _) = start_mock_server(
            EVENT_STREAM_OK,
            vec![
                "event: UserJoinedLobby\ndata: p2\n\nevent: Game",
                "Started\n\n",
                ": keep-alive\r\n\r\n",
            ],
        )
        .await;

        let mut stream = SseConnector::new(url).open("g1").await.unwrap();
        assert_eq!(
            stream.recv().await.unwrap().unwrap(),
            "event: UserJoinedLobby\ndata: p2"
        );
        assert_eq!(stream.recv().await.unwrap().unwrap(), "event: GameStarted");
        assert_eq!(stream.recv().await.unwrap().unwrap(), ": keep-alive");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn body_ending_mid_event_reports_closed_transport() {
        let (url, _) =
            start_mock_server(EVENT_STREAM_OK, vec!["event: GameEnded\ndata: p1\n"]).await;

        let mut stream = SseConnector::new(url).open("g1").await.unwrap();
        let err = stream.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::TransportClosed));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn error_status_fails_open() {
        let (url, _) = start_mock_server(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            vec![],
        )
        .await;

        let err = SseConnector::new(url).open("missing").await.err().unwrap();
        assert!(matches!(&err, EngineError::Transport(m) if m.contains("404")));
    }

    #[tokio::test]
    async fn open_times_out_when_headers_never_arrive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = SseConnector::new(format!("http://{addr}"))
            .with_connect_timeout(Duration::from_millis(50))
            .open("g1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Timeout));
        server.abort();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_stream() {
        let (url, _) =
            start_mock_server(EVENT_STREAM_OK, vec!["event: GameStarted\n\n"]).await;

        let mut stream = SseConnector::new(url).open("g1").await.unwrap();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.recv().await.is_none());
    }
}
