//! Session lifetime: remaining time, phase, and the one-shot end alert.
//!
//! The store has no push-based timer. Remaining time is a pure function of
//! the room record and the local wall clock, re-evaluated on every tick.

use crate::models::room::RoomRecord;

/// Session length when nothing better is known.
pub const DEFAULT_DURATION_MINUTES: i64 = 5;

/// Milliseconds per minute.
pub const MS_PER_MINUTE: i64 = 60_000;

/// Guesses the session length from the room id.
///
/// Room ids minted for longer sessions carry the length in the name
/// (`abc20` is a 20 minute room). Only a fallback until the room record's
/// `durationMinutes` is read, and superseded by explicit configuration.
pub fn derive_duration_from_room_id(room_id: &str) -> i64 {
    let id = room_id.to_lowercase();
    if id.contains("20") {
        20
    } else {
        DEFAULT_DURATION_MINUTES
    }
}

/// Where a session is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// No coach message yet; sending is allowed.
    NotStarted,
    /// Timer running and time left.
    Running,
    /// Time ran out.
    Expired,
    /// Ended explicitly. Overrides all timer math.
    Ended,
}

impl TimerPhase {
    /// Whether new messages may be sent in this phase.
    pub fn accepts_messages(self) -> bool {
        matches!(self, TimerPhase::NotStarted | TimerPhase::Running)
    }
}

/// Milliseconds left in the session.
///
/// `Some(0)` once ended, `None` while the timer has not started.
pub fn remaining_ms(
    timer_start: Option<i64>,
    duration_minutes: i64,
    ended: bool,
    now_ms: i64,
) -> Option<i64> {
    if ended {
        return Some(0);
    }
    let start = timer_start?;
    let end = start.saturating_add(duration_minutes.saturating_mul(MS_PER_MINUTE));
    Some(end.saturating_sub(now_ms).max(0))
}

/// Renders remaining time as `m:ss`.
pub fn format_remaining(remaining: Option<i64>) -> String {
    match remaining {
        None => "Waiting for the first coach message".to_string(),
        Some(ms) if ms <= 0 => "Session ended".to_string(),
        Some(ms) => {
            let minutes = ms / MS_PER_MINUTE;
            let seconds = (ms % MS_PER_MINUTE) / 1000;
            format!("{}:{:02}", minutes, seconds)
        }
    }
}

/// Local view of the room's timer fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimer {
    timer_start: Option<i64>,
    duration_minutes: i64,
    ended: bool,
    expired: bool,
}

impl SessionTimer {
    /// Creates a timer with the local duration guess.
    pub fn new(default_duration_minutes: i64) -> Self {
        let duration_minutes = if default_duration_minutes > 0 {
            default_duration_minutes
        } else {
            DEFAULT_DURATION_MINUTES
        };
        Self {
            timer_start: None,
            duration_minutes,
            ended: false,
            expired: false,
        }
    }

    /// Folds a room snapshot into the local view.
    ///
    /// `ended` only ever goes from false to true locally, even if a later
    /// snapshot omits it.
    pub fn apply_record(&mut self, record: &RoomRecord) {
        if let Some(start) = record.timer_start {
            if self.timer_start.is_some_and(|current| current != start) {
                tracing::debug!("Timer start moved from {:?} to {}", self.timer_start, start);
            }
            self.timer_start = Some(start);
        }
        if let Some(minutes) = record.duration_minutes.filter(|m| *m > 0) {
            self.duration_minutes = minutes;
        }
        if record.ended == Some(true) && !self.ended {
            tracing::info!("🛑 Session marked as ended");
            self.ended = true;
        }
    }

    /// Marks the session ended locally.
    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Latches `Expired` if the time has run out at `now_ms`.
    ///
    /// Once latched the timer stays expired, whatever later snapshots or a
    /// wall clock stepping backwards would say.
    pub fn observe(&mut self, now_ms: i64) -> TimerPhase {
        let phase = self.phase(now_ms);
        if phase == TimerPhase::Expired && !self.expired {
            tracing::info!("⏱️  Session time is up");
            self.expired = true;
        }
        phase
    }

    /// Milliseconds left, see [`remaining_ms`].
    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        if self.expired {
            return Some(0);
        }
        remaining_ms(self.timer_start, self.duration_minutes, self.ended, now_ms)
    }

    /// Current phase.
    pub fn phase(&self, now_ms: i64) -> TimerPhase {
        if self.ended {
            return TimerPhase::Ended;
        }
        if self.expired {
            return TimerPhase::Expired;
        }
        match self.remaining_ms(now_ms) {
            None => TimerPhase::NotStarted,
            Some(ms) if ms > 0 => TimerPhase::Running,
            Some(_) => TimerPhase::Expired,
        }
    }

    /// When the timer started, if it has.
    pub fn timer_start(&self) -> Option<i64> {
        self.timer_start
    }

    /// Session length in effect.
    pub fn duration_minutes(&self) -> i64 {
        self.duration_minutes
    }

    /// Whether the session was ended explicitly.
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// Latch for the "session ended" notification.
#[derive(Debug, Clone, Default)]
pub struct EndAlert {
    fired: bool,
}

impl EndAlert {
    /// Creates an unfired latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once: the first time the session is seen over.
    pub fn check(&mut self, timer: &SessionTimer, now_ms: i64) -> bool {
        if self.fired {
            return false;
        }
        let over = matches!(timer.phase(now_ms), TimerPhase::Expired | TimerPhase::Ended);
        if over {
            self.fired = true;
        }
        over
    }

    /// Whether the alert already fired.
    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
