//! JSON-over-HTTP game API client using `reqwest`.
//!
//! Every endpoint answers with the [`ApiResponse`] envelope. A non-2xx status
//! becomes a [`GatewayError`] carrying the status code and the envelope's
//! message when the body has one.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;

use crate::error::GatewayError;
use crate::gateway::RequestGateway;
use crate::protocol::{
    ApiResponse, CreateGameResponse, GameId, GameSettings, GameSnapshot, SubmitWinnerRequest,
    SubmitWinnerResponse,
};

/// [`RequestGateway`] backed by the game's REST API.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpGateway {
    /// Create a gateway for the API at `base_url` (e.g. `https://host/api`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            bearer_token: None,
        }
    }

    /// Use a preconfigured client (timeouts, proxies, cookies).
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Send `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn call<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, GatewayError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let mut request = self.request(method.clone(), path);
        if let Some(body) = body {
            request = request.json(body);
        }
        tracing::debug!(%method, path, "game api request");

        let response = request.send().await.map_err(|e| {
            let error = GatewayError::new(format!("request failed: {e}"));
            match e.status() {
                Some(status) => error.with_status(status.as_u16()),
                None => error,
            }
        })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::new(e.to_string()).with_status(status.as_u16()))?;

        match serde_json::from_slice::<ApiResponse<T>>(&body) {
            Ok(envelope) if status.is_success() => Ok(envelope),
            Ok(envelope) => {
                let message = envelope
                    .into_ack()
                    .err()
                    .map_or_else(|| status.to_string(), |e| e.message);
                Err(GatewayError::new(message).with_status(status.as_u16()))
            }
            Err(e) if status.is_success() => {
                tracing::warn!(path, "malformed api response: {e}");
                Err(GatewayError::new(format!("invalid response body: {e}"))
                    .with_status(status.as_u16()))
            }
            Err(_) => Err(GatewayError::new(status.to_string()).with_status(status.as_u16())),
        }
    }

    async fn ack(&self, method: Method, path: &str) -> Result<(), GatewayError> {
        self.call::<IgnoredAny, ()>(method, path, None)
            .await?
            .into_ack()
    }
}

#[async_trait]
impl RequestGateway for HttpGateway {
    async fn create_game(&self) -> Result<GameId, GatewayError> {
        let created: CreateGameResponse = self
            .call::<CreateGameResponse, ()>(Method::POST, "games/create", None)
            .await?
            .into_data()?;
        Ok(created.game_id)
    }

    async fn join_game(&self, game_id: &str) -> Result<(), GatewayError> {
        self.ack(Method::POST, &format!("games/join/{game_id}")).await
    }

    async fn start_game(&self, game_id: &str) -> Result<(), GatewayError> {
        self.ack(Method::POST, &format!("games/start/{game_id}")).await
    }

    async fn submit_round_winner(
        &self,
        game_id: &str,
        winner_id: &str,
    ) -> Result<SubmitWinnerResponse, GatewayError> {
        let request = SubmitWinnerRequest {
            winner_user_id: winner_id.to_string(),
        };
        self.call::<SubmitWinnerResponse, _>(
            Method::POST,
            &format!("games/end-turn/{game_id}"),
            Some(&request),
        )
        .await?
        .into_data()
    }

    async fn update_settings(
        &self,
        game_id: &str,
        settings: &GameSettings,
    ) -> Result<(), GatewayError> {
        self.call::<IgnoredAny, _>(
            Method::PUT,
            &format!("games/settings/{game_id}"),
            Some(settings),
        )
        .await?
        .into_ack()
    }

    async fn fetch_game_snapshot(&self, game_id: &str) -> Result<GameSnapshot, GatewayError> {
        self.call::<GameSnapshot, ()>(Method::GET, &format!("games/details/{game_id}"), None)
            .await?
            .into_data()
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
    use crate::protocol::{GameStatus, MethodType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// One captured request: the head and the body.
    struct Captured {
        head: String,
        body: String,
    }

    fn header_end(bytes: &[u8]) -> Option<usize> {
        bytes.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn content_length(head: &str) -> usize {
        head.lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Answer a single request with `status` and a JSON `body`.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, oneshot::Receiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            let end = loop {
                if let Some(end) = header_end(&raw) {
                    break end;
                }
                let n = tcp.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up before sending headers");
                raw.extend_from_slice(&buf[..n]);
            };
            let head = String::from_utf8_lossy(&raw[..end]).into_owned();
            let wanted = end + 4 + content_length(&head);
            while raw.len() < wanted {
                let n = tcp.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up mid-body");
                raw.extend_from_slice(&buf[..n]);
            }
            let body_text = String::from_utf8_lossy(&raw[end + 4..wanted]).into_owned();
            let _ = tx.send(Captured {
                head,
                body: body_text,
            });

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            tcp.write_all(response.as_bytes()).await.unwrap();
            tcp.shutdown().await.unwrap();
        });

        (format!("http://{addr}/api"), rx)
    }

    #[tokio::test]
    async fn fetch_snapshot_unwraps_envelope() {
        let (url, captured) = serve_once(
            "200 OK",
            r#"{"success":true,"message":"","data":{
                "id":"g1",
                "host":{"id":"p1","username":"alice","score":null,"isHost":true},
                "timer":2,"maxScore":3,
                "players":[{"id":"p1","username":"alice","score":null,"isHost":true}],
                "enabledMethods":[0,2],
                "status":1,
                "currentRound":{"id":"r1","methodType":0,"word":"kite","activePlayerUsername":"alice"}
            }}"#,
        )
        .await;

        let snapshot = HttpGateway::new(url)
            .with_bearer_token("tok")
            .fetch_game_snapshot("g1")
            .await
            .unwrap();
        assert_eq!(snapshot.status, GameStatus::InProgress);
        assert_eq!(snapshot.enabled_methods, vec![MethodType::Drawing, MethodType::Mimic]);
        assert_eq!(snapshot.current_round.unwrap().id, "r1");

        let captured = captured.await.unwrap();
        assert!(captured.head.starts_with("GET /api/games/details/g1 HTTP/1.1\r\n"));
        assert!(captured
            .head
            .to_ascii_lowercase()
            .contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn create_game_returns_new_id() {
        let (url, captured) =
            serve_once("200 OK", r#"{"success":true,"data":{"gameId":"g-new"}}"#).await;

        let id = HttpGateway::new(url).create_game().await.unwrap();
        assert_eq!(id, "g-new");
        let captured = captured.await.unwrap();
        assert!(captured.head.starts_with("POST /api/games/create HTTP/1.1\r\n"));
        assert!(!captured.head.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn submit_winner_sends_winner_user_id() {
        let (url, captured) =
            serve_once("200 OK", r#"{"success":true,"data":{"isGameWon":true}}"#).await;

        let response = HttpGateway::new(url)
            .submit_round_winner("g1", "p2")
            .await
            .unwrap();
        assert!(response.is_game_won);

        let captured = captured.await.unwrap();
        assert!(captured.head.starts_with("POST /api/games/end-turn/g1 HTTP/1.1\r\n"));
        let body: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
        assert_eq!(body, serde_json::json!({ "winnerUserId": "p2" }));
    }

    #[tokio::test]
    async fn update_settings_puts_settings_body() {
        let (url, captured) = serve_once("200 OK", r#"{"success":true,"message":"ok"}"#).await;

        let settings = GameSettings {
            timer_minutes: 3,
            max_score: 5,
            enabled_methods: vec![MethodType::Description],
        };
        HttpGateway::new(url)
            .update_settings("g1", &settings)
            .await
            .unwrap();

        let captured = captured.await.unwrap();
        assert!(captured.head.starts_with("PUT /api/games/settings/g1 HTTP/1.1\r\n"));
        let body: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "timer": 3, "maxScore": 5, "enabledMethods": [1] })
        );
    }

    #[tokio::test]
    async fn error_status_keeps_server_message_and_code() {
        let (url, _) = serve_once(
            "404 Not Found",
            r#"{"success":false,"message":"Game not found"}"#,
        )
        .await;

        let err = HttpGateway::new(url).join_game("nope").await.unwrap_err();
        assert_eq!(err, GatewayError::new("Game not found").with_status(404));
    }

    #[tokio::test]
    async fn unsuccessful_envelope_is_an_error() {
        let (url, _) = serve_once(
            "200 OK",
            r#"{"success":false,"message":"Only the host can start the game"}"#,
        )
        .await;

        let err = HttpGateway::new(url).start_game("g1").await.unwrap_err();
        assert_eq!(err.message, "Only the host can start the game");
        assert_eq!(err.status, None);
    }

    #[tokio::test]
    async fn non_json_error_body_falls_back_to_status() {
        let (url, _) = serve_once("502 Bad Gateway", "upstream down").await;

        let err = HttpGateway::new(url)
            .fetch_game_snapshot("g1")
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(502));
        assert_eq!(err.message, "502 Bad Gateway");
    }
}
