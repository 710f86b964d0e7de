//! Local turn countdown.
//!
//! Purely advisory: the timer drives the on-screen countdown and a single
//! expiration signal. The authoritative end of a round always comes from the
//! server.

/// A point-in-time view of the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerState {
    pub seconds_remaining: u64,
    pub total_seconds: u64,
    pub running: bool,
    pub expired: bool,
}

impl TimerState {
    /// Fraction of the round remaining, from `1.0` (full) to `0.0`.
    pub fn progress(&self) -> f64 {
        if self.total_seconds == 0 {
            return 0.0;
        }
        self.seconds_remaining as f64 / self.total_seconds as f64
    }

    /// Remaining time as `m:ss`.
    pub fn format_clock(&self) -> String {
        let minutes = self.seconds_remaining / 60;
        let seconds = self.seconds_remaining % 60;
        format!("{minutes}:{seconds:02}")
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub state: TimerState,
    /// `true` only on the tick that reached zero.
    pub expired_now: bool,
}

#[derive(Debug, Default)]
pub struct TurnTimer {
    state: TimerState,
}

impl TurnTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Stop any countdown and start a new one from `total_seconds`.
    pub fn reset(&mut self, total_seconds: u64) -> TimerState {
        self.state = TimerState {
            seconds_remaining: total_seconds,
            total_seconds,
            running: true,
            expired: false,
        };
        self.state
    }

    /// Advance by one second.
    ///
    /// Returns `None` when nothing observable changed: the timer is stopped,
    /// or it already sat at zero after expiring.
    pub fn tick(&mut self) -> Option<TimerTick> {
        if !self.state.running || self.state.expired {
            return None;
        }
        self.state.seconds_remaining = self.state.seconds_remaining.saturating_sub(1);
        let expired_now = self.state.seconds_remaining == 0;
        if expired_now {
            self.state.expired = true;
        }
        Some(TimerTick {
            state: self.state,
            expired_now,
        })
    }

    /// Continue a stopped countdown from where it halted.
    ///
    /// Returns `None` if the timer is already running, expired, or was never
    /// started.
    pub fn resume(&mut self) -> Option<TimerState> {
        if self.state.running || self.state.expired || self.state.seconds_remaining == 0 {
            return None;
        }
        self.state.running = true;
        Some(self.state)
    }

    /// Halt ticking, keeping the remaining time.
    pub fn stop(&mut self) -> TimerState {
        self.state.running = false;
        self.state
    }
}
