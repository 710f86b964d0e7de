//! Wire types for the game API and the push stream.
//!
//! Snapshot types mirror the JSON returned by the game details endpoint
//! (camelCase field names, numeric enums). Push notifications arrive as
//! server-sent-event blocks and are decoded by [`RemoteNotification::parse`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::lifecycle::LifecyclePhase;

// ── Type aliases ────────────────────────────────────────────────────

/// Server-issued game identifier.
pub type GameId = String;

/// Server-issued player identifier.
pub type PlayerId = String;

/// Server-issued round identifier.
pub type RoundId = String;

// ── Enums ───────────────────────────────────────────────────────────

/// Numeric-or-name representation accepted for server enums.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnumRepr {
    Index(u8),
    Name(String),
}

/// Server-side game status. The sole source of truth for progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr", into = "u8")]
pub enum GameStatus {
    /// Lobby: players are joining, settings may change.
    #[default]
    Waiting,
    /// Rounds are being played.
    InProgress,
    /// A player reached the maximum score.
    Finished,
}

impl TryFrom<EnumRepr> for GameStatus {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Index(0) => Ok(GameStatus::Waiting),
            EnumRepr::Index(1) => Ok(GameStatus::InProgress),
            EnumRepr::Index(2) => Ok(GameStatus::Finished),
            EnumRepr::Index(n) => Err(format!("unknown game status {n}")),
            EnumRepr::Name(name) => match name.as_str() {
                "Waiting" => Ok(GameStatus::Waiting),
                "InProgress" => Ok(GameStatus::InProgress),
                "Finished" => Ok(GameStatus::Finished),
                other => Err(format!("unknown game status {other:?}")),
            },
        }
    }
}

impl From<GameStatus> for u8 {
    fn from(status: GameStatus) -> Self {
        match status {
            GameStatus::Waiting => 0,
            GameStatus::InProgress => 1,
            GameStatus::Finished => 2,
        }
    }
}

/// How the active player conveys the word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr", into = "u8")]
pub enum MethodType {
    Drawing,
    Description,
    Mimic,
}

impl MethodType {
    /// All methods, in server index order.
    pub const ALL: [MethodType; 3] = [
        MethodType::Drawing,
        MethodType::Description,
        MethodType::Mimic,
    ];
}

impl TryFrom<EnumRepr> for MethodType {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Index(0) => Ok(MethodType::Drawing),
            EnumRepr::Index(1) => Ok(MethodType::Description),
            EnumRepr::Index(2) => Ok(MethodType::Mimic),
            EnumRepr::Index(n) => Err(format!("unknown method type {n}")),
            EnumRepr::Name(name) => match name.as_str() {
                "Drawing" => Ok(MethodType::Drawing),
                "Description" => Ok(MethodType::Description),
                "Mimic" => Ok(MethodType::Mimic),
                other => Err(format!("unknown method type {other:?}")),
            },
        }
    }
}

impl From<MethodType> for u8 {
    fn from(method: MethodType) -> Self {
        match method {
            MethodType::Drawing => 0,
            MethodType::Description => 1,
            MethodType::Mimic => 2,
        }
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodType::Drawing => "Drawing",
            MethodType::Description => "Description",
            MethodType::Mimic => "Mimic",
        };
        f.write_str(name)
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// A participant in a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    /// Rounds won so far. The server sends `null` before the game starts.
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub is_host: bool,
}

impl Player {
    /// Score with `null` treated as zero.
    pub fn points(&self) -> u32 {
        self.score.unwrap_or(0)
    }
}

/// The round currently being played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: RoundId,
    pub method_type: MethodType,
    pub word: String,
    pub active_player_username: String,
}

/// The authoritative game state returned by a pull.
///
/// Replaced wholesale on every successful pull; never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub id: GameId,
    pub host: Player,
    /// Minutes allotted per round.
    #[serde(rename = "timer")]
    pub timer_minutes: u32,
    pub max_score: u32,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub enabled_methods: Vec<MethodType>,
    pub status: GameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_round: Option<Round>,
}

impl GameSnapshot {
    /// The lifecycle phase this snapshot implies.
    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::of(self)
    }

    /// Seconds allotted per round.
    pub fn round_seconds(&self) -> u64 {
        u64::from(self.timer_minutes) * 60
    }

    /// Look up a player by id.
    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Returns `true` if `id` is the host or appears in the player list.
    pub fn is_member(&self, id: &str) -> bool {
        self.host.id == id || self.player(id).is_some()
    }

    /// Returns `true` if `username` is the active player of the current round.
    pub fn is_active_player(&self, username: &str) -> bool {
        self.current_round
            .as_ref()
            .is_some_and(|round| round.active_player_username == username)
    }

    /// Players ordered by score (highest first), ties broken by username.
    pub fn standings(&self) -> Vec<&Player> {
        let mut players: Vec<&Player> = self.players.iter().collect();
        players.sort_by(|a, b| {
            b.points()
                .cmp(&a.points())
                .then_with(|| a.username.cmp(&b.username))
        });
        players
    }

    /// The player currently in the lead, if any.
    pub fn leader(&self) -> Option<&Player> {
        self.standings().into_iter().next()
    }

    /// The round settings as a [`GameSettings`] value.
    pub fn settings(&self) -> GameSettings {
        GameSettings {
            timer_minutes: self.timer_minutes,
            max_score: self.max_score,
            enabled_methods: self.enabled_methods.clone(),
        }
    }
}

// ── Requests and responses ──────────────────────────────────────────

/// Lobby settings sent with `updateSettings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    #[serde(rename = "timer")]
    pub timer_minutes: u32,
    pub max_score: u32,
    pub enabled_methods: Vec<MethodType>,
}

impl GameSettings {
    /// Check the settings before they are sent to the server.
    ///
    /// # Errors
    ///
    /// Returns a description of the first out-of-range field.
    pub fn validate(&self) -> Result<(), String> {
        if self.timer_minutes == 0 {
            return Err("timer must be at least one minute".into());
        }
        if self.max_score == 0 {
            return Err("max score must be at least one".into());
        }
        if self.enabled_methods.is_empty() {
            return Err("at least one method must be enabled".into());
        }
        Ok(())
    }
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            timer_minutes: 2,
            max_score: 10,
            enabled_methods: MethodType::ALL.to_vec(),
        }
    }
}

/// Response body of `createGame`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameResponse {
    pub game_id: GameId,
}

/// Request body of `submitRoundWinner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitWinnerRequest {
    pub winner_user_id: PlayerId,
}

/// Response body of `submitRoundWinner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitWinnerResponse {
    /// `true` when this round's winner reached the maximum score.
    pub is_game_won: bool,
}

/// The `{success, message, data}` envelope wrapping every API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Unwrap the payload of a successful response.
    ///
    /// # Errors
    ///
    /// Returns the server message when `success` is false or `data` is absent.
    pub fn into_data(self) -> Result<T, GatewayError> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(GatewayError::new(non_empty(
                self.message,
                "response contained no data",
            ))),
            (false, _) => Err(GatewayError::new(non_empty(
                self.message,
                "request was not successful",
            ))),
        }
    }

    /// Check an acknowledgement-only response.
    ///
    /// # Errors
    ///
    /// Returns the server message when `success` is false.
    pub fn into_ack(self) -> Result<(), GatewayError> {
        if self.success {
            Ok(())
        } else {
            Err(GatewayError::new(non_empty(
                self.message,
                "request was not successful",
            )))
        }
    }
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

// ── Push notifications ──────────────────────────────────────────────

/// The kind of a push notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    PlayerJoinedLobby,
    PlayerLeftLobby,
    GameStarted,
    RoundEnded,
    GameEnded,
    /// Any event name this client does not recognise. Still treated as an
    /// invalidation hint.
    Other(String),
}

impl NotificationKind {
    /// Map a server event name to a kind.
    pub fn from_event_name(name: &str) -> Self {
        match name {
            "UserJoinedLobby" | "PlayerJoinedLobby" => NotificationKind::PlayerJoinedLobby,
            "UserLeftLobby" | "PlayerLeftLobby" => NotificationKind::PlayerLeftLobby,
            "GameStarted" => NotificationKind::GameStarted,
            "RoundEnded" => NotificationKind::RoundEnded,
            "GameEnded" => NotificationKind::GameEnded,
            other => NotificationKind::Other(other.to_string()),
        }
    }

    /// The canonical event name for this kind.
    pub fn event_name(&self) -> &str {
        match self {
            NotificationKind::PlayerJoinedLobby => "PlayerJoinedLobby",
            NotificationKind::PlayerLeftLobby => "PlayerLeftLobby",
            NotificationKind::GameStarted => "GameStarted",
            NotificationKind::RoundEnded => "RoundEnded",
            NotificationKind::GameEnded => "GameEnded",
            NotificationKind::Other(name) => name,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A payload-light signal that something changed server-side.
///
/// Never trusted as state: every notification only schedules a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNotification {
    pub kind: NotificationKind,
    /// Opaque identifier attached to the event (e.g. a winner id).
    pub payload: Option<String>,
    /// The stream's `id:` field. Not monotonic across reconnects.
    pub sequence: Option<String>,
}

impl RemoteNotification {
    /// Create a notification with no payload.
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            payload: None,
            sequence: None,
        }
    }

    /// Attach an opaque payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Decode one server-sent-event block.
    ///
    /// Returns `None` for keep-alive blocks (only comments, blank lines or
    /// `retry:` fields).
    pub fn parse(frame: &str) -> Option<Self> {
        let mut event: Option<&str> = None;
        let mut data: Vec<&str> = Vec::new();
        let mut sequence: Option<&str> = None;

        for line in frame.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value),
                "data" => data.push(value),
                "id" => sequence = Some(value),
                _ => {}
            }
        }

        if event.is_none() && data.is_empty() {
            return None;
        }

        let payload = data.join("\n");
        Some(Self {
            kind: NotificationKind::from_event_name(event.unwrap_or("message")),
            payload: (!payload.trim().is_empty()).then_some(payload),
            sequence: sequence.filter(|s| !s.is_empty()).map(str::to_string),
        })
    }

    /// Encode as a server-sent-event block.
    pub fn to_frame(&self) -> String {
        let mut frame = String::new();
        if let Some(seq) = &self.sequence {
            frame.push_str("id: ");
            frame.push_str(seq);
            frame.push('\n');
        }
        frame.push_str("event: ");
        frame.push_str(self.kind.event_name());
        frame.push('\n');
        if let Some(payload) = &self.payload {
            for line in payload.split('\n') {
                frame.push_str("data: ");
                frame.push_str(line);
                frame.push('\n');
            }
        }
        frame.push('\n');
        frame
    }

    /// The payload as a plain identifier, with JSON string quoting removed.
    pub fn payload_id(&self) -> Option<String> {
        let raw = self.payload.as_deref()?.trim();
        let id = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.to_string());
        (!id.is_empty()).then_some(id)
    }
}
