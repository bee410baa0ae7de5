use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use crate::error::{AppError, Result};
use crate::store::Snapshot;

/// Field names on the room record.
pub mod fields {
    /// Base64 `nonce || ciphertext` of the session key under the envelope key.
    pub const SESSION_KEY_ENVELOPE: &str = "sessionKeyEnvelope";
    /// Unix milliseconds of the first coach message. Set once.
    pub const TIMER_START: &str = "timerStart";
    /// Session length in minutes. Set at most once.
    pub const DURATION_MINUTES: &str = "durationMinutes";
    /// One-way flag, only ever written as `true`.
    pub const ENDED: &str = "ended";
}

/// Opaque room identifier shared by both participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Creates a room id, rejecting empty or path-breaking values.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AppError::Validation("Room id must not be empty".to_string()));
        }
        if id.contains('/') || id.chars().any(char::is_control) {
            return Err(AppError::Validation(
                "Room id cannot contain '/' or control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the conversation a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Starts the timer with the first message and may end the chat.
    Coach,
    /// The counterpart who joins with a display name.
    User,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coach => "coach",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coach" => Ok(Role::Coach),
            "user" => Ok(Role::User),
            other => Err(AppError::Validation(format!("Unknown role '{}'", other))),
        }
    }
}

/// Typed view of the room record as last seen in the store.
///
/// Every field is optional: the record is created lazily and the two
/// participants fill it in at different times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomRecord {
    /// The wrapped session key.
    pub session_key_envelope: Option<String>,
    /// When the timer started, in Unix milliseconds.
    pub timer_start: Option<i64>,
    /// Session length in minutes.
    pub duration_minutes: Option<i64>,
    /// Whether the chat was ended explicitly.
    pub ended: Option<bool>,
}

impl RoomRecord {
    /// Parses a store snapshot. Unparseable fields are treated as absent.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            session_key_envelope: snapshot
                .get(fields::SESSION_KEY_ENVELOPE)
                .filter(|v| !v.is_empty())
                .cloned(),
            timer_start: parse_field(snapshot, fields::TIMER_START),
            duration_minutes: parse_field(snapshot, fields::DURATION_MINUTES),
            ended: parse_field(snapshot, fields::ENDED),
        }
    }
}

fn parse_field<T: FromStr>(snapshot: &Snapshot, field: &str) -> Option<T> {
    let raw = snapshot.get(field)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("⚠️  Ignoring malformed room field {}={:?}", field, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> Snapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_full_record() {
        let record = RoomRecord::from_snapshot(&snapshot(&[
            (fields::SESSION_KEY_ENVELOPE, "abc"),
            (fields::TIMER_START, "1700000000000"),
            (fields::DURATION_MINUTES, "20"),
            (fields::ENDED, "true"),
        ]));

        assert_eq!(record.session_key_envelope.as_deref(), Some("abc"));
        assert_eq!(record.timer_start, Some(1_700_000_000_000));
        assert_eq!(record.duration_minutes, Some(20));
        assert_eq!(record.ended, Some(true));
    }

    #[test]
    fn malformed_fields_are_absent() {
        let record = RoomRecord::from_snapshot(&snapshot(&[
            (fields::TIMER_START, "soon"),
            (fields::ENDED, "yes"),
            (fields::SESSION_KEY_ENVELOPE, ""),
        ]));

        assert_eq!(record, RoomRecord::default());
    }

    #[test]
    fn room_id_rejects_empty_and_slashes() {
        assert!(RoomId::new("  ").is_err());
        assert!(RoomId::new("a/b").is_err());
        assert_eq!(RoomId::new("abc20").unwrap().as_str(), "abc20");
    }

    #[test]
    fn role_parsing() {
        assert_eq!("Coach".parse::<Role>().unwrap(), Role::Coach);
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("admin".parse::<Role>().is_err());
    }
}
