use serde::{Deserialize, Deserializer, Serialize};
use crate::models::room::Role;

/// A chat message as stored in the room's message collection.
///
/// ⚠️ Only ciphertext is stored. `nonce` and `ciphertext` are Base64 and
/// MUST be opened with the room's session key before display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Who sent the message. `None` when the stored value is missing or not
    /// a known role; the entry still renders.
    #[serde(
        default,
        deserialize_with = "lenient_role",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender: Option<Role>,
    /// Display name chosen by the sender.
    #[serde(default)]
    pub name: String,
    /// Base64 of the 24-byte nonce.
    #[serde(default)]
    pub nonce: String,
    /// Base64 of the ciphertext including the tag.
    #[serde(default)]
    pub ciphertext: String,
    /// Send time in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl StoredMessage {
    /// Ordering key; messages without a timestamp sort first.
    pub fn sort_key(&self) -> i64 {
        self.ts.unwrap_or(0)
    }
}

fn lenient_role<'de, D>(deserializer: D) -> Result<Option<Role>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|role| role.parse().ok()))
}

/// A stored message together with its store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    /// Store-assigned unique id.
    pub id: String,
    /// The stored payload.
    pub message: StoredMessage,
}

/// A message ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// Store-assigned unique id.
    pub id: String,
    /// Who sent the message, if known.
    pub sender: Option<Role>,
    /// Sender name, or the role name when the sender left it blank.
    pub display_name: String,
    /// Plaintext, or a placeholder if it could not be decrypted (yet).
    pub text: String,
    /// Send time in Unix milliseconds, 0 when missing.
    pub ts: i64,
}
