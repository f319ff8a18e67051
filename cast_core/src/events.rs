use crate::{CallId, Condition, EndpointId, MediaStream, Role, SessionKey, SessionState};

/// Session events emitted to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum CastEvent {
    /// The authoritative {role, state, key} tuple changed; observers get a
    /// snapshot by value, never shared mutable state
    StateChanged {
        /// Current role
        role: Role,
        /// Current lifecycle state
        state: SessionState,
        /// Current session key, if one exists
        session_key: Option<SessionKey>,
    },

    /// A condition worth surfacing to the user was reported
    ConditionReported(Condition),

    /// Number of live listener calls changed (broadcaster side)
    ListenerCountChanged {
        /// Live call count
        count: usize,
    },
}

/// Events emitted by the transport to the session handler
#[derive(Debug)]
pub enum TransportEvent {
    /// The session key was registered as this instance's address
    Registered {
        /// Key that was registered
        key: SessionKey,
    },

    /// Registration was rejected (key already claimed)
    RegisterFailed {
        /// Key that was rejected
        key: SessionKey,
        /// Reason for the rejection
        reason: String,
    },

    /// A listener is calling (broadcaster side)
    IncomingCall {
        /// Call to answer
        call: CallId,
        /// Anonymous identity of the caller
        caller: EndpointId,
    },

    /// The remote side answered with media (listener side)
    StreamReceived {
        /// Call the stream belongs to
        call: CallId,
        /// The live audio stream
        stream: MediaStream,
    },

    /// A dial attempt failed before any media flowed
    CallFailed {
        /// Key that was dialed
        key: SessionKey,
        /// Reason for the failure
        reason: String,
    },

    /// An established call ended
    CallClosed {
        /// Call that ended
        call: CallId,
    },
}
