//! Notification-to-pull reconciliation.
//!
//! Notifications are invalidation hints. Each one schedules an authoritative
//! pull; pulls are strictly serialized (at most one in flight) and anything
//! arriving meanwhile is coalesced into exactly one follow-up pull. The
//! follow-up carries every coalesced notification so their semantic
//! callbacks still fire, in arrival order, once fresh state is in hand.

use tracing::debug;

use crate::protocol::{GameId, RemoteNotification};

/// One scheduled authoritative pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullTicket {
    pub game_id: GameId,
    /// Attachment epoch; results from an older epoch are discarded.
    pub epoch: u64,
    /// Notifications this pull answers. Empty for a manual refresh.
    pub notifications: Vec<RemoteNotification>,
}

/// Serializes and coalesces pulls.
#[derive(Debug, Default)]
pub struct Reconciler {
    game_id: Option<GameId>,
    epoch: u64,
    in_flight: bool,
    queued: Option<Vec<RemoteNotification>>,
    closed: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to `game_id`. Pending work for the previous game is dropped;
    /// a pull already in flight keeps its slot but its result will be stale.
    pub fn reset(&mut self, game_id: &str) {
        self.epoch += 1;
        self.game_id = Some(game_id.to_string());
        self.queued = None;
        self.closed = false;
    }

    /// Stop scheduling pulls (the game finished).
    pub fn close(&mut self) {
        self.closed = true;
        self.queued = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Returns `true` if a follow-up pull is queued.
    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    /// Returns `true` if the ticket's result should be applied.
    pub fn is_current(&self, ticket: &PullTicket) -> bool {
        ticket.epoch == self.epoch && self.game_id.as_deref() == Some(ticket.game_id.as_str())
    }

    /// A notification arrived. Returns a ticket to start now, or `None` if it
    /// was queued behind the in-flight pull.
    pub fn on_notification(&mut self, notification: RemoteNotification) -> Option<PullTicket> {
        self.schedule(Some(notification))
    }

    /// A manual refresh was requested.
    pub fn request_refresh(&mut self) -> Option<PullTicket> {
        self.schedule(None)
    }

    /// The in-flight pull finished (successfully or not). Returns the
    /// follow-up ticket if one was queued.
    pub fn complete(&mut self) -> Option<PullTicket> {
        self.in_flight = false;
        let notifications = self.queued.take()?;
        if self.closed {
            return None;
        }
        debug!(
            coalesced = notifications.len(),
            "starting follow-up pull"
        );
        self.issue(notifications)
    }

    fn schedule(&mut self, notification: Option<RemoteNotification>) -> Option<PullTicket> {
        if self.closed {
            debug!(?notification, "game finished, not scheduling a pull");
            return None;
        }
        if self.in_flight {
            let queue = self.queued.get_or_insert_with(Vec::new);
            queue.extend(notification);
            debug!(queued = queue.len(), "pull in flight, queued follow-up");
            return None;
        }
        self.issue(notification.into_iter().collect())
    }

    fn issue(&mut self, notifications: Vec<RemoteNotification>) -> Option<PullTicket> {
        let game_id = self.game_id.clone()?;
        self.in_flight = true;
        Some(PullTicket {
            game_id,
            epoch: self.epoch,
            notifications,
        })
    }
}
