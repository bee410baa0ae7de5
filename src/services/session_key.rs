use std::sync::Arc;

use crate::config::KeyWritePolicy;
use crate::crypto::cipher::{self, SecureKey};
use crate::crypto::envelope::{self, EnvelopeKey};
use crate::error::{AppError, Result};
use crate::models::room::{fields, RoomId, RoomRecord};
use crate::store::{SharedStore, StorePath};

/// Whether the room's session key is held locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Nothing known yet.
    Unknown,
    /// Session key cached in memory.
    Established,
}

/// Owns one room's session key for the lifetime of a session view.
///
/// The key lives only in memory and is zeroized when the manager is dropped.
pub struct SessionKeyManager {
    store: Arc<dyn SharedStore>,
    room_path: StorePath,
    envelope_key: Option<EnvelopeKey>,
    session_key: Option<SecureKey>,
    policy: KeyWritePolicy,
}

impl SessionKeyManager {
    /// Creates a manager with no cached key.
    ///
    /// `envelope_key` may be `None` while its inputs are not ready; the
    /// manager then refuses to touch the store until one is provided.
    pub fn new(
        store: Arc<dyn SharedStore>,
        room_id: &RoomId,
        envelope_key: Option<EnvelopeKey>,
        policy: KeyWritePolicy,
    ) -> Self {
        Self {
            store,
            room_path: StorePath::room(room_id),
            envelope_key,
            session_key: None,
            policy,
        }
    }

    /// Provides the envelope key once it can be derived.
    pub fn set_envelope_key(&mut self, envelope_key: EnvelopeKey) {
        self.envelope_key = Some(envelope_key);
    }

    /// Current state.
    pub fn state(&self) -> KeyState {
        if self.session_key.is_some() {
            KeyState::Established
        } else {
            KeyState::Unknown
        }
    }

    /// The cached session key, if established.
    pub fn cached(&self) -> Option<&SecureKey> {
        self.session_key.as_ref()
    }

    /// Returns the session key, fetching or creating it if needed.
    ///
    /// 1. Cached key: returned without any I/O.
    /// 2. Otherwise one read of the room record; a valid envelope is opened
    ///    and cached. An envelope that fails to open counts as absent.
    /// 3. Otherwise a fresh key is generated, sealed and written according to
    ///    the write policy, together with `duration_minutes` if the room has
    ///    none yet.
    ///
    /// `Ok(None)` means the envelope key is not available yet; nothing was
    /// read or written and the caller should retry later.
    pub async fn ensure_session_key(&mut self, duration_minutes: i64) -> Result<Option<SecureKey>> {
        if let Some(key) = &self.session_key {
            tracing::debug!("✅ Session key {} retrieved from cache", key.fingerprint());
            return Ok(Some(key.clone()));
        }
        let Some(envelope_key) = self.envelope_key.clone() else {
            tracing::debug!("Envelope key not ready, deferring session key");
            return Ok(None);
        };

        let snapshot = self.store.read_once(&self.room_path).await?;
        let record = RoomRecord::from_snapshot(&snapshot);
        if let Some(key) = record
            .session_key_envelope
            .as_deref()
            .and_then(|sealed| open_envelope(&envelope_key, sealed))
        {
            tracing::info!("🔐 Session key {} recovered from {}", key.fingerprint(), self.room_path);
            self.session_key = Some(key.clone());
            return Ok(Some(key));
        }

        tracing::warn!("⚠️  No usable session key in {}, creating...", self.room_path);
        let key = cipher::generate_key();
        let sealed = envelope::seal_session_key(&envelope_key, &key)?;

        match self.policy {
            KeyWritePolicy::Overwrite => {
                self.store
                    .write(
                        &self.room_path,
                        vec![(fields::SESSION_KEY_ENVELOPE.to_string(), sealed)],
                    )
                    .await?;
            }
            KeyWritePolicy::IfAbsent => {
                let written = self
                    .store
                    .write_if_absent(&self.room_path, fields::SESSION_KEY_ENVELOPE, sealed)
                    .await?;
                if !written {
                    return self.adopt_winner(&envelope_key).await.map(Some);
                }
            }
        }

        self.store
            .write_if_absent(
                &self.room_path,
                fields::DURATION_MINUTES,
                duration_minutes.to_string(),
            )
            .await?;

        tracing::info!("✅ Session key {} created for {}", key.fingerprint(), self.room_path);
        self.session_key = Some(key.clone());
        Ok(Some(key))
    }

    /// Opportunistically adopts a key from a pushed room record.
    ///
    /// Returns `true` if the cached key changed. A different valid envelope
    /// replaces the cached key, since the last write in the store wins.
    pub fn adopt_from_record(&mut self, record: &RoomRecord) -> bool {
        let (Some(envelope_key), Some(sealed)) =
            (self.envelope_key.as_ref(), record.session_key_envelope.as_deref())
        else {
            return false;
        };
        let Some(key) = open_envelope(envelope_key, sealed) else {
            return false;
        };
        if self.session_key.as_ref() == Some(&key) {
            return false;
        }

        match &self.session_key {
            Some(previous) => tracing::warn!(
                "⚠️  Session key replaced in store: {} -> {}",
                previous.fingerprint(),
                key.fingerprint()
            ),
            None => tracing::info!("🔐 Session key {} adopted from store", key.fingerprint()),
        }
        self.session_key = Some(key);
        true
    }

    async fn adopt_winner(&mut self, envelope_key: &EnvelopeKey) -> Result<SecureKey> {
        let snapshot = self.store.read_once(&self.room_path).await?;
        let record = RoomRecord::from_snapshot(&snapshot);
        let key = record
            .session_key_envelope
            .as_deref()
            .and_then(|sealed| open_envelope(envelope_key, sealed))
            .ok_or_else(|| {
                AppError::AlreadyExists(format!(
                    "{} holds a session key envelope that cannot be opened",
                    self.room_path
                ))
            })?;

        tracing::info!("🔐 Lost key creation race, adopting {}", key.fingerprint());
        self.session_key = Some(key.clone());
        Ok(key)
    }
}

fn open_envelope(envelope_key: &EnvelopeKey, sealed: &str) -> Option<SecureKey> {
    match envelope::open_session_key(envelope_key, sealed) {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::warn!("⚠️  Ignoring unreadable session key envelope: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use async_trait::async_trait;
    use crate::crypto::envelope::derive_envelope_key;
    use crate::store::memory::MemoryStore;
    use crate::store::{Snapshot, Subscription};

    /// Serves one empty read, as if the other participant's write had not
    /// propagated yet.
    struct StaleOnce {
        inner: MemoryStore,
        stale: AtomicBool,
    }

    #[async_trait]
    impl SharedStore for StaleOnce {
        async fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
            self.inner.subscribe(path).await
        }

        async fn read_once(&self, path: &StorePath) -> Result<Snapshot> {
            if self.stale.swap(false, Ordering::SeqCst) {
                return Ok(Snapshot::new());
            }
            self.inner.read_once(path).await
        }

        async fn write(&self, path: &StorePath, fields: Vec<(String, String)>) -> Result<()> {
            self.inner.write(path, fields).await
        }

        async fn write_if_absent(&self, path: &StorePath, field: &str, value: String) -> Result<bool> {
            self.inner.write_if_absent(path, field, value).await
        }

        async fn append_child(&self, path: &StorePath, value: String) -> Result<String> {
            self.inner.append_child(path, value).await
        }
    }

    fn room() -> RoomId {
        RoomId::new("key-room").unwrap()
    }

    fn manager(store: &MemoryStore, policy: KeyWritePolicy) -> SessionKeyManager {
        SessionKeyManager::new(
            Arc::new(store.clone()),
            &room(),
            Some(derive_envelope_key("key-room", "salt")),
            policy,
        )
    }

    #[tokio::test]
    async fn without_envelope_key_nothing_is_touched() {
        let store = MemoryStore::new();
        let mut keys =
            SessionKeyManager::new(Arc::new(store.clone()), &room(), None, KeyWritePolicy::Overwrite);

        assert!(keys.ensure_session_key(5).await.unwrap().is_none());
        assert_eq!(store.read_count(), 0);
        assert_eq!(store.write_count(), 0);
        assert_eq!(keys.state(), KeyState::Unknown);
    }

    #[tokio::test]
    async fn creates_key_and_duration_once() {
        let store = MemoryStore::new();
        let mut keys = manager(&store, KeyWritePolicy::Overwrite);

        let key = keys.ensure_session_key(20).await.unwrap().unwrap();
        assert_eq!(keys.state(), KeyState::Established);

        let record = RoomRecord::from_snapshot(&store.read_once(&StorePath::room(&room())).await.unwrap());
        assert!(record.session_key_envelope.is_some());
        assert_eq!(record.duration_minutes, Some(20));

        let reads = store.read_count();
        let writes = store.write_count();
        for _ in 0..3 {
            assert_eq!(keys.ensure_session_key(20).await.unwrap().unwrap(), key);
        }
        assert_eq!(store.read_count(), reads);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn corrupt_envelope_is_replaced() {
        let store = MemoryStore::new();
        store
            .write(
                &StorePath::room(&room()),
                vec![(fields::SESSION_KEY_ENVELOPE.to_string(), "garbage".to_string())],
            )
            .await
            .unwrap();

        let mut keys = manager(&store, KeyWritePolicy::Overwrite);
        let key = keys.ensure_session_key(5).await.unwrap().unwrap();

        let record = RoomRecord::from_snapshot(&store.read_once(&StorePath::room(&room())).await.unwrap());
        let sealed = record.session_key_envelope.unwrap();
        assert_ne!(sealed, "garbage");
        let reopened = envelope::open_session_key(&derive_envelope_key("key-room", "salt"), &sealed).unwrap();
        assert_eq!(reopened, key);
    }

    #[tokio::test]
    async fn if_absent_refuses_to_clobber_unreadable_envelope() {
        let store = MemoryStore::new();
        store
            .write(
                &StorePath::room(&room()),
                vec![(fields::SESSION_KEY_ENVELOPE.to_string(), "garbage".to_string())],
            )
            .await
            .unwrap();

        let mut keys = manager(&store, KeyWritePolicy::IfAbsent);
        let err = keys.ensure_session_key(5).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
        assert_eq!(keys.state(), KeyState::Unknown);
    }

    #[tokio::test]
    async fn if_absent_fills_empty_envelope() {
        let store = MemoryStore::new();
        store
            .write(
                &StorePath::room(&room()),
                vec![(fields::SESSION_KEY_ENVELOPE.to_string(), String::new())],
            )
            .await
            .unwrap();

        let mut keys = manager(&store, KeyWritePolicy::IfAbsent);
        let key = keys.ensure_session_key(5).await.unwrap().unwrap();

        let record = RoomRecord::from_snapshot(&store.read_once(&StorePath::room(&room())).await.unwrap());
        let stored = envelope::open_session_key(
            &derive_envelope_key("key-room", "salt"),
            &record.session_key_envelope.unwrap(),
        )
        .unwrap();
        assert_eq!(stored, key);
    }

    #[tokio::test]
    async fn if_absent_loser_adopts_winner() {
        let store = MemoryStore::new();
        let winner = manager(&store, KeyWritePolicy::IfAbsent)
            .ensure_session_key(5)
            .await
            .unwrap()
            .unwrap();

        let racing = StaleOnce {
            inner: store.clone(),
            stale: AtomicBool::new(true),
        };
        let mut loser = SessionKeyManager::new(
            Arc::new(racing),
            &room(),
            Some(derive_envelope_key("key-room", "salt")),
            KeyWritePolicy::IfAbsent,
        );

        let adopted = loser.ensure_session_key(5).await.unwrap().unwrap();
        assert_eq!(adopted, winner);
    }

    #[tokio::test]
    async fn overwrite_loser_clobbers_winner() {
        let store = MemoryStore::new();
        let first = manager(&store, KeyWritePolicy::Overwrite)
            .ensure_session_key(5)
            .await
            .unwrap()
            .unwrap();

        let racing = StaleOnce {
            inner: store.clone(),
            stale: AtomicBool::new(true),
        };
        let mut second = SessionKeyManager::new(
            Arc::new(racing),
            &room(),
            Some(derive_envelope_key("key-room", "salt")),
            KeyWritePolicy::Overwrite,
        );
        let last = second.ensure_session_key(5).await.unwrap().unwrap();
        assert_ne!(first, last);

        let record = RoomRecord::from_snapshot(&store.read_once(&StorePath::room(&room())).await.unwrap());
        let stored = envelope::open_session_key(
            &derive_envelope_key("key-room", "salt"),
            &record.session_key_envelope.unwrap(),
        )
        .unwrap();
        assert_eq!(stored, last);
    }

    #[tokio::test]
    async fn adopts_key_pushed_later() {
        let store = MemoryStore::new();
        let mut creator = manager(&store, KeyWritePolicy::Overwrite);
        let mut observer = manager(&store, KeyWritePolicy::Overwrite);

        assert!(!observer.adopt_from_record(&RoomRecord::default()));

        let key = creator.ensure_session_key(5).await.unwrap().unwrap();
        let record = RoomRecord::from_snapshot(&store.read_once(&StorePath::room(&room())).await.unwrap());

        assert!(observer.adopt_from_record(&record));
        assert_eq!(observer.cached(), Some(&key));
        assert!(!observer.adopt_from_record(&record));
    }

    #[tokio::test]
    async fn wrong_salt_never_adopts() {
        let store = MemoryStore::new();
        let mut creator = manager(&store, KeyWritePolicy::Overwrite);
        creator.ensure_session_key(5).await.unwrap();

        let mut outsider = SessionKeyManager::new(
            Arc::new(store.clone()),
            &room(),
            Some(derive_envelope_key("key-room", "wrong")),
            KeyWritePolicy::Overwrite,
        );
        let record = RoomRecord::from_snapshot(&store.read_once(&StorePath::room(&room())).await.unwrap());
        assert!(!outsider.adopt_from_record(&record));
        assert_eq!(outsider.state(), KeyState::Unknown);
    }
}
