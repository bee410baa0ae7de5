use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Config;
use crate::crypto::cipher::SecureKey;
use crate::crypto::envelope::derive_envelope_key;
use crate::error::{AppError, Result};
use crate::models::message::{MessageEntry, RenderedMessage};
use crate::models::room::{Role, RoomId, RoomRecord};
use crate::services::messages::{self, MessageChannel, SendOutcome};
use crate::services::session_key::{KeyState, SessionKeyManager};
use crate::services::timer::{self, EndAlert, SessionTimer, TimerPhase};
use crate::store::{SharedStore, Snapshot, StorePath};
use crate::validation::message::validate_message;

/// Display name used for users who joined without one.
pub const DEFAULT_USER_NAME: &str = "user";

/// One participant's view of a room, from mount to unmount.
///
/// Owns the session key, the timer view and the transcript. Nothing here is
/// shared across rooms or persisted; dropping the view drops the key.
pub struct ChatSession {
    room_id: RoomId,
    role: Role,
    display_name: String,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    keys: SessionKeyManager,
    channel: MessageChannel,
    timer: SessionTimer,
    alert: EndAlert,
    messages: Vec<MessageEntry>,
}

impl ChatSession {
    /// Creates a session view.
    ///
    /// # Arguments
    ///
    /// * `config` - Supplies the salt, duration override, coach name and key write policy.
    /// * `room_id` - The room to join.
    /// * `role` - Which side this participant is on.
    /// * `display_name` - Name for user messages; coaches use the configured name.
    /// * `store` - The shared store.
    /// * `clock` - Wall clock for timestamps and the timer.
    pub fn new(
        config: &Config,
        room_id: RoomId,
        role: Role,
        display_name: impl Into<String>,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let envelope_key = derive_envelope_key(room_id.as_str(), config.session_salt.as_str());
        let keys = SessionKeyManager::new(
            store.clone(),
            &room_id,
            Some(envelope_key),
            config.key_write_policy,
        );
        let channel = MessageChannel::new(store.clone(), &room_id);

        let default_duration = config
            .chat_duration_minutes
            .unwrap_or_else(|| timer::derive_duration_from_room_id(room_id.as_str()));

        let display_name = match role {
            Role::Coach => config.coach_display_name.clone(),
            Role::User => {
                let name: String = display_name.into();
                let name = name.trim();
                if name.is_empty() {
                    DEFAULT_USER_NAME.to_string()
                } else {
                    name.to_string()
                }
            }
        };

        tracing::info!(
            "✅ Session view for room {} as {} ({} min default)",
            room_id,
            role,
            default_duration
        );

        Self {
            room_id,
            role,
            display_name,
            store,
            clock,
            keys,
            channel,
            timer: SessionTimer::new(default_duration),
            alert: EndAlert::new(),
            messages: Vec::new(),
        }
    }

    /// The room this view is bound to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// This participant's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Name attached to outgoing messages.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The shared store backing this view.
    pub fn store(&self) -> Arc<dyn SharedStore> {
        self.store.clone()
    }

    /// Path of the room record.
    pub fn room_path(&self) -> StorePath {
        StorePath::room(&self.room_id)
    }

    /// Path of the message collection.
    pub fn messages_path(&self) -> StorePath {
        self.channel.messages_path().clone()
    }

    /// Whether the session key is held.
    pub fn key_state(&self) -> KeyState {
        self.keys.state()
    }

    /// The cached session key, if any.
    pub fn session_key(&self) -> Option<&SecureKey> {
        self.keys.cached()
    }

    /// Local view of the timer.
    pub fn timer(&self) -> &SessionTimer {
        &self.timer
    }

    /// Folds a pushed room snapshot into the view.
    ///
    /// Returns `true` if a session key was adopted or replaced.
    pub fn apply_room_snapshot(&mut self, snapshot: &Snapshot) -> bool {
        let record = RoomRecord::from_snapshot(snapshot);
        self.timer.observe(self.clock.now_ms());
        self.timer.apply_record(&record);
        self.keys.adopt_from_record(&record)
    }

    /// Replaces the known messages with a pushed collection snapshot.
    pub fn apply_messages_snapshot(&mut self, snapshot: &Snapshot) {
        self.messages = messages::order_messages(snapshot);
        tracing::debug!("Room {} now has {} messages", self.room_id, self.messages.len());
    }

    /// Decrypted transcript in timestamp order.
    pub fn transcript(&self) -> Vec<RenderedMessage> {
        messages::render_messages(&self.messages, self.keys.cached())
    }

    /// Milliseconds left; `None` before the timer starts.
    pub fn remaining_ms(&self) -> Option<i64> {
        self.timer.remaining_ms(self.clock.now_ms())
    }

    /// Current phase.
    pub fn phase(&self) -> TimerPhase {
        self.timer.phase(self.clock.now_ms())
    }

    /// Whether a send would be accepted right now.
    pub fn can_send(&self) -> bool {
        self.phase().accepts_messages()
    }

    /// Re-evaluates the timer. Returns `true` the one time the session is
    /// first seen as over.
    pub fn poll_end_alert(&mut self) -> bool {
        let now = self.clock.now_ms();
        self.timer.observe(now);
        self.alert.check(&self.timer, now)
    }

    /// Returns the session key, fetching or creating it as needed.
    pub async fn ensure_session_key(&mut self) -> Result<Option<SecureKey>> {
        self.keys.ensure_session_key(self.timer.duration_minutes()).await
    }

    /// Encrypts and sends a message.
    ///
    /// Rejects blank text and sends after the session is over. When the
    /// session key is not available yet nothing is written and
    /// `SendOutcome::Deferred` is returned. A coach send also starts the
    /// timer if it is not running yet; once the message is stored, a failure
    /// there is reported in `timer_error` instead of as an error.
    pub async fn send_message(&mut self, text: &str) -> Result<SendOutcome> {
        let text = validate_message(text)?;
        if !self.timer.observe(self.clock.now_ms()).accepts_messages() {
            return Err(AppError::SessionEnded);
        }

        let Some(key) = self.ensure_session_key().await? else {
            tracing::debug!("Send deferred, session key unavailable");
            return Ok(SendOutcome::Deferred);
        };

        let id = self
            .channel
            .post(&key, text, self.role, &self.display_name, self.clock.now_ms())
            .await?;

        // Already stored; timer failures are reported, not returned.
        let (timer_started, timer_error) = match self.role {
            Role::Coach => match self.channel.start_timer_if_absent(self.clock.now_ms()).await {
                Ok(started) => (started, None),
                Err(e) => {
                    tracing::error!("❌ Message {} sent but timer start failed: {}", id, e);
                    (false, Some(e.to_string()))
                }
            },
            Role::User => (false, None),
        };

        Ok(SendOutcome::Sent {
            id,
            timer_started,
            timer_error,
        })
    }

    /// Ends the chat for both participants. Coach only.
    pub async fn end_chat(&mut self) -> Result<()> {
        if self.role != Role::Coach {
            return Err(AppError::Unauthorized);
        }
        self.channel.mark_ended().await?;
        self.timer.mark_ended();
        Ok(())
    }
}
