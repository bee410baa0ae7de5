use std::env;
use std::str::FromStr;
use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Salt used when `SESSION_SALT` is missing. Anyone who knows it can open
/// every room's key envelope, so running with it is a misconfiguration.
pub const DEFAULT_SESSION_SALT: &str = "please-set-env-salt";

/// How a participant publishes a freshly generated session key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyWritePolicy {
    /// Unconditional write; if two participants race, the last writer wins.
    #[default]
    Overwrite,
    /// Write only if no envelope exists; the loser adopts the winner's key.
    IfAbsent,
}

impl FromStr for KeyWritePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "if-absent" | "if_absent" | "ifabsent" => Ok(Self::IfAbsent),
            other => anyhow::bail!("Unknown KEY_WRITE_POLICY '{}' (expected overwrite or if-absent)", other),
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// Secret mixed into every room's envelope key.
    pub session_salt: Zeroizing<String>,
    /// Whether `session_salt` is the built-in fallback.
    pub salt_is_default: bool,
    /// The URL of the Redis server backing the shared store.
    pub redis_url: String,
    /// Prefix prepended to every store key and pub/sub channel.
    pub store_prefix: String,
    /// Explicit session duration; overrides the room-id heuristic when set.
    pub chat_duration_minutes: Option<i64>,
    /// Name attached to every coach message.
    pub coach_display_name: String,
    /// How freshly generated session keys are published.
    pub key_write_policy: KeyWritePolicy,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let salt = env::var("SESSION_SALT").ok().filter(|s| !s.is_empty());
        let salt_is_default = salt.is_none();
        if salt_is_default {
            tracing::warn!(
                "⚠️  SESSION_SALT is not set, falling back to the insecure default salt; \
                 room key envelopes are readable by anyone with store access"
            );
        }

        let chat_duration_minutes = match env::var("CHAT_DURATION_MINUTES") {
            Ok(raw) => {
                let minutes: i64 = raw.parse().context("Invalid CHAT_DURATION_MINUTES")?;
                if minutes <= 0 {
                    anyhow::bail!("CHAT_DURATION_MINUTES must be positive");
                }
                Some(minutes)
            }
            Err(_) => None,
        };

        Ok(Self {
            session_salt: Zeroizing::new(salt.unwrap_or_else(|| DEFAULT_SESSION_SALT.to_string())),
            salt_is_default,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            store_prefix: env::var("STORE_PREFIX").unwrap_or_default(),
            chat_duration_minutes,
            coach_display_name: env::var("COACH_DISPLAY_NAME")
                .unwrap_or_else(|_| "coach".to_string()),
            key_write_policy: env::var("KEY_WRITE_POLICY")
                .ok()
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or_default(),
        })
    }

    /// Builds a configuration around an explicit salt, with every other
    /// setting at its default.
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self {
            session_salt: Zeroizing::new(salt.into()),
            salt_is_default: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_prefix: String::new(),
            chat_duration_minutes: None,
            coach_display_name: "coach".to_string(),
            key_write_policy: KeyWritePolicy::Overwrite,
        }
    }
}
