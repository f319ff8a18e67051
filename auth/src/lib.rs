//! Authorization for aircast
//!
//! Gates the broadcaster and listener roles behind shared secrets and owns
//! the sticky session key: generated once on first successful broadcaster
//! authorization, persisted through the key store, and reused across
//! restarts until explicitly rotated.
//!
//! Authorization here is deliberately a verbatim string comparison against
//! a secret known in advance. The hard problem this subsystem solves is
//! session lifecycle, not cryptographic identity.

use cast_core::SessionKey;
use key_store::{KeyStore, StoredKeys};
use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;

/// Why an authorization attempt was rejected. Terminal for the attempt,
/// user-correctable, never retried automatically.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("broadcaster secret does not match")]
    WrongSecret,

    #[error("key does not match the published session, or no broadcast exists yet")]
    WrongKeyOrNoBroadcastYet,
}

/// Validates role authorization attempts and manages the session key.
///
/// Reads through to the key store on every check so that two instances on
/// the same device observe each other's writes; with a non-persistent
/// store it falls back to its own in-memory record.
pub struct Authorizer {
    /// The broadcaster secret, compared verbatim and never stored
    secret: String,
    store: KeyStore,
    /// In-memory record, authoritative only when the store is not persistent
    cached: StoredKeys,
}

impl Authorizer {
    pub fn new(secret: impl Into<String>, store: KeyStore) -> Self {
        let cached = store.load();
        Self {
            secret: secret.into(),
            store,
            cached,
        }
    }

    /// Whether authorized keys survive a restart
    pub fn persistent(&self) -> bool {
        self.store.persistent()
    }

    /// Authorize the broadcaster role. On success, returns the session key
    /// to publish under, generating and persisting one if none exists yet.
    /// A failed attempt never mutates the session key.
    pub fn authorize_broadcaster(&mut self, candidate: &str) -> Result<SessionKey, AuthError> {
        if candidate != self.secret {
            debug!("Broadcaster authorization rejected");
            return Err(AuthError::WrongSecret);
        }

        Ok(self.ensure_session_key())
    }

    /// Authorize the listener role against the published session key. On
    /// success the listener authorization record is persisted so the role
    /// is restored without re-prompting. Failure writes nothing.
    pub fn authorize_listener(&mut self, candidate: &str) -> Result<SessionKey, AuthError> {
        let mut keys = self.keys();
        match &keys.broadcast_key {
            Some(published) if published.as_str() == candidate => {
                let published = published.clone();
                keys.listener_authorized = true;
                keys.listener_key = Some(published.clone());
                self.persist(keys);
                info!("Listener authorized for session key {}", published);
                Ok(published)
            }
            _ => {
                debug!("Listener authorization rejected");
                Err(AuthError::WrongKeyOrNoBroadcastYet)
            }
        }
    }

    /// Restore a previously-authorized listener from the stored record.
    /// Returns the key the listener is authorized for, if any.
    pub fn restore_listener(&mut self) -> Option<SessionKey> {
        let keys = self.keys();
        if keys.listener_authorized {
            keys.listener_key
        } else {
            None
        }
    }

    /// The current session key, if one has ever been generated
    pub fn session_key(&mut self) -> Option<SessionKey> {
        self.keys().broadcast_key
    }

    /// Return the current session key, generating and persisting one if
    /// none exists yet.
    pub fn ensure_session_key(&mut self) -> SessionKey {
        let mut keys = self.keys();
        match keys.broadcast_key {
            Some(key) => key,
            None => {
                let key = generate_session_key();
                info!("Generated session key {}", key);
                keys.broadcast_key = Some(key.clone());
                self.persist(keys);
                key
            }
        }
    }

    /// Force a fresh session key and persist it. Listeners holding the old
    /// key will see a mismatch on the next session start.
    pub fn rotate_key(&mut self) -> SessionKey {
        let key = generate_session_key();
        info!("Rotated session key to {}", key);
        let mut keys = self.keys();
        keys.broadcast_key = Some(key.clone());
        self.persist(keys);
        key
    }

    /// Current record, read through from the store when it is persistent
    fn keys(&mut self) -> StoredKeys {
        if self.store.persistent() {
            self.cached = self.store.load();
        }
        self.cached.clone()
    }

    fn persist(&mut self, keys: StoredKeys) {
        self.cached = keys;
        if let Err(e) = self.store.save(&self.cached) {
            warn!("Failed to persist keys: {}", e);
        }
    }
}

/// Generate a six-digit numeric session key. Uniformly random; collisions
/// across independent deployments are accepted as negligible.
fn generate_session_key() -> SessionKey {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    SessionKey::new(format!("{:06}", n))
}
