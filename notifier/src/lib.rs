//! Session notifications for aircast
//!
//! Fans session lifecycle notices out to every client instance on the same
//! device. The in-process medium is a tokio broadcast channel; the wire
//! schema is fixed and serde-backed so an out-of-process medium can carry
//! the same messages.
//!
//! Delivery is best-effort: duplicates are possible and subscribers must
//! treat a repeated `Start` for an already-joined session as a no-op.

use cast_core::{Error, SessionKey};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Notices a slow subscriber can fall behind by before it starts skipping
pub const NOTICE_CAPACITY: usize = 16;

/// A session lifecycle notice.
///
/// Serializes as `{"type":"START","key":"482913"}` / `{"type":"STOP"}` —
/// the one structured schema every producer and consumer agrees on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notice {
    /// A broadcast went live under the given key
    #[serde(rename = "START")]
    Start {
        /// Key the session is published under
        key: SessionKey,
    },

    /// The broadcast ended
    #[serde(rename = "STOP")]
    Stop,
}

/// Serialize a notice to its wire form
pub fn to_json(notice: &Notice) -> Result<String, Error> {
    serde_json::to_string(notice)
        .map_err(|e| Error::Serialization(format!("Failed to serialize notice: {}", e)))
}

/// Parse a notice from its wire form
pub fn from_json(json: &str) -> Result<Notice, Error> {
    serde_json::from_str(json)
        .map_err(|e| Error::Serialization(format!("Failed to parse notice: {}", e)))
}

/// Same-device publish/subscribe channel for [`Notice`]s.
///
/// Cloning shares the underlying channel. Every subscriber sees every
/// notice published after it subscribed, including the publisher's own —
/// publishers that should not react to themselves filter by role.
#[derive(Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    /// Publish a notice to all current subscribers. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, notice: Notice) {
        debug!("Publishing notice {:?}", notice);
        let _ = self.tx.send(notice);
    }

    /// Subscribe to notices published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}
