use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use crate::crypto::cipher::{self, SecureKey};
use crate::error::Result;
use crate::models::message::{MessageEntry, RenderedMessage, StoredMessage};
use crate::models::room::{fields, Role, RoomId, RoomRecord};
use crate::store::{SharedStore, Snapshot, StorePath};

/// Shown while the session key is not available yet.
pub const PENDING_PLACEHOLDER: &str = "…";
/// Shown for a message that fails to decrypt.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt]";

/// Result of opening one stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// The message opened cleanly.
    Plaintext(String),
    /// The ciphertext is corrupt, tampered with, or sealed under another key.
    AuthFailure,
    /// No session key to try yet.
    KeyUnavailable,
}

impl DecryptOutcome {
    /// Text to display for this outcome.
    pub fn display_text(&self) -> &str {
        match self {
            DecryptOutcome::Plaintext(text) => text,
            DecryptOutcome::AuthFailure => UNDECRYPTABLE_PLACEHOLDER,
            DecryptOutcome::KeyUnavailable => PENDING_PLACEHOLDER,
        }
    }
}

/// What happened to a send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Appended to the room under `id`.
    Sent {
        /// Store-assigned message id.
        id: String,
        /// Whether this send started the session timer.
        timer_started: bool,
        /// Set when the message was stored but starting the timer failed.
        /// The next coach send tries again.
        timer_error: Option<String>,
    },
    /// No session key yet; nothing was written.
    Deferred,
}

/// Seals a plaintext into a storable message with a fresh nonce.
pub fn encrypt_message(
    key: &SecureKey,
    plaintext: &str,
    sender: Role,
    name: &str,
    ts: i64,
) -> Result<StoredMessage> {
    let nonce = cipher::generate_nonce();
    let ciphertext = cipher::seal(key, &nonce, plaintext.as_bytes())?;

    Ok(StoredMessage {
        sender: Some(sender),
        name: name.to_string(),
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
        ts: Some(ts),
    })
}

/// Opens one stored message. Never fails; see [`DecryptOutcome`].
pub fn decrypt_message(message: &StoredMessage, key: Option<&SecureKey>) -> DecryptOutcome {
    let Some(key) = key else {
        return DecryptOutcome::KeyUnavailable;
    };

    let opened = general_purpose::STANDARD
        .decode(&message.nonce)
        .map_err(crate::error::AppError::from)
        .and_then(|nonce| cipher::nonce_from_slice(&nonce))
        .and_then(|nonce| {
            let ciphertext = general_purpose::STANDARD.decode(&message.ciphertext)?;
            cipher::open(key, &nonce, &ciphertext)
        });

    match opened.map(String::from_utf8) {
        Ok(Ok(text)) => DecryptOutcome::Plaintext(text),
        Ok(Err(_)) | Err(_) => DecryptOutcome::AuthFailure,
    }
}

/// Parses a message collection snapshot and orders it by timestamp.
///
/// Entries that do not parse are skipped. The sort is stable, so equal
/// timestamps keep their id order.
pub fn order_messages(snapshot: &Snapshot) -> Vec<MessageEntry> {
    let mut entries: Vec<MessageEntry> = snapshot
        .iter()
        .filter_map(|(id, raw)| match sonic_rs::from_str::<StoredMessage>(raw) {
            Ok(message) => Some(MessageEntry {
                id: id.clone(),
                message,
            }),
            Err(e) => {
                tracing::warn!("⚠️  Skipping malformed message {}: {}", id, e);
                None
            }
        })
        .collect();

    entries.sort_by_key(|entry| entry.message.sort_key());
    entries
}

/// Name shown for entries whose sender could not be read.
pub const UNKNOWN_SENDER_NAME: &str = "unknown";

/// Decrypts every entry independently for display.
pub fn render_messages(entries: &[MessageEntry], key: Option<&SecureKey>) -> Vec<RenderedMessage> {
    entries
        .iter()
        .map(|entry| {
            let message = &entry.message;
            let display_name = if message.name.trim().is_empty() {
                message
                    .sender
                    .map_or(UNKNOWN_SENDER_NAME, |role| role.as_str())
                    .to_string()
            } else {
                message.name.clone()
            };
            RenderedMessage {
                id: entry.id.clone(),
                sender: message.sender,
                display_name,
                text: decrypt_message(message, key).display_text().to_string(),
                ts: message.sort_key(),
            }
        })
        .collect()
}

/// Store-facing half of the message channel for one room.
pub struct MessageChannel {
    store: Arc<dyn SharedStore>,
    room_path: StorePath,
    messages_path: StorePath,
}

impl MessageChannel {
    /// Creates a channel for `room_id`.
    pub fn new(store: Arc<dyn SharedStore>, room_id: &RoomId) -> Self {
        Self {
            store,
            room_path: StorePath::room(room_id),
            messages_path: StorePath::messages(room_id),
        }
    }

    /// Path of the room's message collection.
    pub fn messages_path(&self) -> &StorePath {
        &self.messages_path
    }

    /// Encrypts and appends a message.
    ///
    /// # Returns
    ///
    /// The store-assigned id.
    pub async fn post(
        &self,
        key: &SecureKey,
        plaintext: &str,
        sender: Role,
        name: &str,
        now_ms: i64,
    ) -> Result<String> {
        let message = encrypt_message(key, plaintext, sender, name, now_ms)?;
        let id = self
            .store
            .append_child(&self.messages_path, sonic_rs::to_string(&message)?)
            .await?;

        tracing::debug!("Message {} appended to {}", id, self.messages_path);
        Ok(id)
    }

    /// Sets `timerStart` if the room has none yet.
    ///
    /// Read-then-write without a lock: two coach sends racing here may both
    /// write, each with roughly the same timestamp.
    pub async fn start_timer_if_absent(&self, now_ms: i64) -> Result<bool> {
        let snapshot = self.store.read_once(&self.room_path).await?;
        if RoomRecord::from_snapshot(&snapshot).timer_start.is_some() {
            return Ok(false);
        }

        self.store
            .write(
                &self.room_path,
                vec![(fields::TIMER_START.to_string(), now_ms.to_string())],
            )
            .await?;
        tracing::info!("⏱️  Session timer started for {}", self.room_path);
        Ok(true)
    }

    /// Writes `ended: true` unconditionally.
    pub async fn mark_ended(&self) -> Result<()> {
        self.store
            .write(
                &self.room_path,
                vec![(fields::ENDED.to_string(), "true".to_string())],
            )
            .await?;
        tracing::info!("🛑 Session ended for {}", self.room_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_snapshot(entries: &[(&str, &StoredMessage)]) -> Snapshot {
        entries
            .iter()
            .map(|(id, m)| (id.to_string(), sonic_rs::to_string(m).unwrap()))
            .collect()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = cipher::generate_key();
        let message = encrypt_message(&key, "hi there", Role::User, "sam", 42).unwrap();

        assert_eq!(message.ts, Some(42));
        assert!(!message.ciphertext.contains("hi there"));
        assert_eq!(
            decrypt_message(&message, Some(&key)),
            DecryptOutcome::Plaintext("hi there".to_string())
        );
    }

    #[test]
    fn decrypt_distinguishes_missing_key_from_wrong_key() {
        let key = cipher::generate_key();
        let message = encrypt_message(&key, "hello", Role::Coach, "coach", 1).unwrap();

        assert_eq!(decrypt_message(&message, None), DecryptOutcome::KeyUnavailable);
        assert_eq!(
            decrypt_message(&message, Some(&cipher::generate_key())),
            DecryptOutcome::AuthFailure
        );
    }

    #[test]
    fn malformed_fields_are_auth_failures() {
        let key = cipher::generate_key();
        let mut message = encrypt_message(&key, "hello", Role::Coach, "coach", 1).unwrap();
        message.nonce = "AAAA".to_string();
        assert_eq!(decrypt_message(&message, Some(&key)), DecryptOutcome::AuthFailure);

        message.nonce = String::new();
        assert_eq!(decrypt_message(&message, Some(&key)), DecryptOutcome::AuthFailure);
    }

    #[test]
    fn nonces_differ_per_message() {
        let key = cipher::generate_key();
        let a = encrypt_message(&key, "same", Role::User, "u", 1).unwrap();
        let b = encrypt_message(&key, "same", Role::User, "u", 1).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn orders_by_timestamp_with_missing_first() {
        let key = cipher::generate_key();
        let late = encrypt_message(&key, "late", Role::User, "u", 300).unwrap();
        let early = encrypt_message(&key, "early", Role::Coach, "c", 100).unwrap();
        let mut untimed = encrypt_message(&key, "untimed", Role::User, "u", 0).unwrap();
        untimed.ts = None;

        let mut snapshot = entry_snapshot(&[("a", &late), ("b", &early), ("c", &untimed)]);
        snapshot.insert("d".to_string(), "{not json".to_string());

        let ordered = order_messages(&snapshot);
        let ids: Vec<&str> = ordered.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn one_bad_message_does_not_block_others() {
        let key = cipher::generate_key();
        let good = encrypt_message(&key, "good", Role::User, "", 1).unwrap();
        let foreign = encrypt_message(&cipher::generate_key(), "foreign", Role::Coach, "c", 2).unwrap();

        let ordered = order_messages(&entry_snapshot(&[("x", &good), ("y", &foreign)]));
        let rendered = render_messages(&ordered, Some(&key));

        assert_eq!(rendered[0].text, "good");
        assert_eq!(rendered[0].display_name, "user");
        assert_eq!(rendered[1].text, UNDECRYPTABLE_PLACEHOLDER);

        let pending = render_messages(&ordered, None);
        assert!(pending.iter().all(|m| m.text == PENDING_PLACEHOLDER));
    }

    #[test]
    fn stored_message_uses_camel_case_wire_names() {
        let key = cipher::generate_key();
        let message = encrypt_message(&key, "x", Role::Coach, "c", 7).unwrap();
        let json = sonic_rs::to_string(&message).unwrap();

        assert!(json.contains("\"sender\":\"coach\""));
        assert!(json.contains("\"ts\":7"));
        let back: StoredMessage = sonic_rs::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn entries_without_a_known_sender_still_render() {
        let key = cipher::generate_key();
        let message = encrypt_message(&key, "who am i", Role::User, "", 5).unwrap();
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "missing".to_string(),
            format!(
                r#"{{"name":"","nonce":"{}","ciphertext":"{}","ts":5}}"#,
                message.nonce, message.ciphertext
            ),
        );
        snapshot.insert(
            "odd".to_string(),
            format!(
                r#"{{"sender":"admin","name":"mallory","nonce":"{}","ciphertext":"{}","ts":6}}"#,
                message.nonce, message.ciphertext
            ),
        );

        let rendered = render_messages(&order_messages(&snapshot), Some(&key));
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].sender, None);
        assert_eq!(rendered[0].display_name, UNKNOWN_SENDER_NAME);
        assert_eq!(rendered[0].text, "who am i");
        assert_eq!(rendered[1].sender, None);
        assert_eq!(rendered[1].display_name, "mallory");
    }
}
