//! Local session identity and the resumable-game store.
//!
//! The process bootstrap creates one [`Session`] and hands it, together with
//! a [`ResumeStore`], to the engine. The store remembers which game the
//! session was attached to so a restarted client can re-attach with
//! [`GameEngine::resume`](crate::engine::GameEngine::resume).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{GameId, PlayerId};

/// The local participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Key for the resume store. Generated once per installation or process.
    pub id: Uuid,
    /// Server-issued player id, once known. Used for membership checks.
    pub player_id: Option<PlayerId>,
    pub username: Option<String>,
}

impl Session {
    /// Create a session with a fresh random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Create a session with an existing id.
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            player_id: None,
            username: None,
        }
    }

    /// Set the local player's identity.
    #[must_use]
    pub fn with_player(mut self, player_id: impl Into<PlayerId>, username: impl Into<String>) -> Self {
        self.player_id = Some(player_id.into());
        self.username = Some(username.into());
        self
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Persists one resumable game id per session.
pub trait ResumeStore: Send + Sync + 'static {
    /// Load the saved game id for `session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage could not be read.
    fn load(&self, session: Uuid) -> Result<Option<GameId>>;

    /// Save `game_id` for `session`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage could not be written.
    fn save(&self, session: Uuid, game_id: &str) -> Result<()>;

    /// Forget the saved game id for `session`. A no-op if none is saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage could not be written.
    fn clear(&self, session: Uuid) -> Result<()>;
}

impl<T: ResumeStore + ?Sized> ResumeStore for std::sync::Arc<T> {
    fn load(&self, session: Uuid) -> Result<Option<GameId>> {
        (**self).load(session)
    }

    fn save(&self, session: Uuid, game_id: &str) -> Result<()> {
        (**self).save(session, game_id)
    }

    fn clear(&self, session: Uuid) -> Result<()> {
        (**self).clear(session)
    }
}

// ── In-memory store ─────────────────────────────────────────────────

/// A [`ResumeStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    entries: Mutex<HashMap<Uuid, GameId>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, GameId>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ResumeStore for MemoryResumeStore {
    fn load(&self, session: Uuid) -> Result<Option<GameId>> {
        Ok(self.entries().get(&session).cloned())
    }

    fn save(&self, session: Uuid, game_id: &str) -> Result<()> {
        self.entries().insert(session, game_id.to_string());
        Ok(())
    }

    fn clear(&self, session: Uuid) -> Result<()> {
        self.entries().remove(&session);
        Ok(())
    }
}

// ── JSON file store ─────────────────────────────────────────────────

/// A [`ResumeStore`] backed by a JSON object on disk (session id → game id).
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write never leaves a truncated file behind.
#[derive(Debug)]
pub struct JsonFileResumeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileResumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<Uuid, GameId>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &HashMap<Uuid, GameId>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = entries.len(), "resume store written");
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<Uuid, GameId>) -> bool) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries = self.read_all()?;
        if f(&mut entries) {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

impl ResumeStore for JsonFileResumeStore {
    fn load(&self, session: Uuid) -> Result<Option<GameId>> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self.read_all()?.remove(&session))
    }

    fn save(&self, session: Uuid, game_id: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(session, game_id.to_string()).as_deref() != Some(game_id)
        })
    }

    fn clear(&self, session: Uuid) -> Result<()> {
        self.update(|entries| entries.remove(&session).is_some())
    }
}
