use log::trace;
use serde::{Deserialize, Serialize};
use std;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Key under which a broadcaster publishes itself on the media transport.
///
/// Six decimal digits, generated once and reused across restarts until
/// explicitly rotated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a media call between two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only the first 8 characters for brevity
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Anonymous identity of a client instance on the media transport.
/// Listeners mint a fresh one per call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Role a client instance is authorized for. Set once authorization
/// succeeds and mutually exclusive per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Not yet authorized for anything
    #[default]
    None,
    /// Publishes live audio under the session key
    Broadcaster,
    /// Receives live audio from the broadcaster
    Listener,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "None"),
            Role::Broadcaster => write!(f, "Broadcaster"),
            Role::Listener => write!(f, "Listener"),
        }
    }
}

/// A reportable condition: authorization failures, collaborator faults and
/// degradations surfaced to the user. Conditions never carry payloads; the
/// state snapshot accompanying them tells the rest of the story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Broadcaster secret did not match
    WrongSecret,
    /// Listener key did not match the published session key, or no
    /// broadcast has been published yet
    WrongKeyOrNoBroadcastYet,
    /// Audio capture could not be acquired (permission or device)
    MicrophoneUnavailable,
    /// Dialed session key has no registered broadcaster
    BroadcasterUnreachable,
    /// Media arrived but playback needs a user gesture
    AutoplayBlocked,
    /// Key persistence is unavailable; running memory-only
    StorageUnavailable,
    /// Stored listener key does not match an announced session
    KeyMismatch,
    /// Session key is already registered by another broadcaster
    KeyInUse,
    /// Start requested without broadcaster authorization
    NotAuthorized,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::WrongSecret => write!(f, "wrong broadcaster secret"),
            Condition::WrongKeyOrNoBroadcastYet => {
                write!(f, "wrong key, or no broadcast published yet")
            }
            Condition::MicrophoneUnavailable => write!(f, "microphone unavailable"),
            Condition::BroadcasterUnreachable => write!(f, "broadcaster unreachable"),
            Condition::AutoplayBlocked => write!(f, "playback blocked, tap play to resume"),
            Condition::StorageUnavailable => {
                write!(f, "key storage unavailable, keys will not persist")
            }
            Condition::KeyMismatch => write!(f, "stored key does not match the announced session"),
            Condition::KeyInUse => write!(f, "session key already in use by another broadcaster"),
            Condition::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

/// Lifecycle state of a client instance.
///
/// `Idle`, `AwaitingAuthorization`, `Active` and `Stopped` are the states a
/// user sees; `Publishing` and `Dialing` are the transitional states the
/// call orchestrator passes through on the way to `Active`. `Failed` is
/// terminal for the attempt and carries the condition that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing in progress
    #[default]
    Idle,
    /// Listener is authorized and passively awaiting a session start
    AwaitingAuthorization,
    /// Broadcaster is acquiring capture and registering on the transport
    Publishing,
    /// Listener is calling the broadcaster
    Dialing,
    /// Media is flowing
    Active,
    /// Teardown in progress; settles to Idle
    Stopped,
    /// Start attempt failed; retry with a fresh start
    Failed(Condition),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::AwaitingAuthorization => write!(f, "Awaiting session start"),
            SessionState::Publishing => write!(f, "Publishing"),
            SessionState::Dialing => write!(f, "Dialing"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Stopped => write!(f, "Stopping"),
            SessionState::Failed(condition) => write!(f, "Failed ({})", condition),
        }
    }
}

/// Unified error type for the application.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key store error: {0}")]
    Store(String), // Placeholder for key_store crate errors

    #[error("Authorization error: {0}")]
    Auth(String), // Placeholder for auth crate errors

    #[error("Capture error: {0}")]
    Capture(String), // Placeholder for audio capture errors

    #[error("Playback error: {0}")]
    Playback(String), // Placeholder for audio sink errors

    #[error("Transport error: {0}")]
    Transport(String), // Placeholder for transport crate errors

    #[error("Session error: {0}")]
    Session(String), // Placeholder for session logic errors

    #[error("Serialization error: {0}")]
    Serialization(String), // Placeholder for serialization errors

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error), // Catch-all for other errors
}

// Basic audio format definitions
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 1; // Mono

/// Represents a buffer of audio samples.
/// Samples are typically f32.
pub type AudioBuffer = Vec<f32>;

/// A live, receive-only audio stream handed across the transport seam.
///
/// Wraps a broadcast receiver so any number of listeners can tap the same
/// capture. Late receivers skip what they missed; live audio never
/// backlogs.
pub struct MediaStream {
    rx: broadcast::Receiver<AudioBuffer>,
}

impl MediaStream {
    pub fn new(rx: broadcast::Receiver<AudioBuffer>) -> Self {
        Self { rx }
    }

    /// Receive the next audio frame, skipping over any frames dropped while
    /// this receiver lagged. Returns `None` once the sending side is gone.
    pub async fn recv(&mut self) -> Option<AudioBuffer> {
        loop {
            match self.rx.recv().await {
                Ok(buffer) => return Some(buffer),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("media stream lagged, skipped {} frames", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream").finish_non_exhaustive()
    }
}

/// Commands that can be sent to the session handler
#[derive(Debug, Clone)]
pub enum CastCommand {
    /// Submit the broadcaster secret for authorization
    SubmitBroadcasterSecret {
        /// Candidate secret, compared verbatim
        secret: String,
    },

    /// Submit a session key to authorize as listener (and join)
    SubmitListenerKey {
        /// Candidate key, compared against the published session key
        key: String,
    },

    /// Start broadcasting under the current session key
    StartBroadcast,

    /// Stop broadcasting or listening and settle back to idle
    StopBroadcast,

    /// Force a fresh session key (refused while a broadcast is live)
    RotateKey,

    /// Request the current state snapshot
    RequestState,

    /// Shutdown the handler (used for testing)
    Shutdown,
}

/// Commands that the session handler sends to the transport
#[derive(Debug)]
pub enum TransportCommand {
    /// Claim a session key as this instance's address
    Register {
        /// Key to register under
        key: SessionKey,
    },

    /// Release the registered session key
    Deregister,

    /// Call the broadcaster registered under a key
    Dial {
        /// Key to dial
        key: SessionKey,
    },

    /// Answer an incoming call with outbound media
    Answer {
        /// Call to answer
        call: CallId,
        /// Stream to attach as outbound media
        stream: MediaStream,
    },

    /// Hang up this instance's outstanding or established call
    Hangup,
}

pub mod events;

// Re-export commonly used types from events
pub use events::{CastEvent, TransportEvent};
