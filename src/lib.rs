//! Ephemeral, end-to-end encrypted two-party chat rooms over an untrusted
//! shared key-value store.
//!
//! Each room has a symmetric session key. It is generated by whichever
//! participant needs it first, sealed under an envelope key derived from the
//! room id and a configured salt, and written to the room record. Messages
//! are sealed under the session key with a fresh nonce each. A timer started
//! by the first coach message, plus an explicit ended flag, decides when the
//! room stops accepting messages.

pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod session;

pub mod crypto {
    pub mod cipher;
    pub mod envelope;
}

pub mod models {
    pub mod message;
    pub mod room;
}

pub mod services {
    pub mod messages;
    pub mod session_key;
    pub mod timer;
}

pub mod store {
    mod shared;
    pub mod memory;
    pub mod redis_store;

    pub use shared::{Snapshot, SharedStore, StorePath, Subscription, SUBSCRIPTION_BUFFER};
}

pub mod validation {
    pub mod message;
}
