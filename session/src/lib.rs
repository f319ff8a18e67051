//! Session state for aircast
//!
//! This crate owns the per-instance session lifecycle: the authoritative
//! {role, state, session key} tuple and the handler that mutates it.
//! Nothing else in the application writes this state; observers receive
//! value snapshots over the event channel.

use cast_core::{CastEvent, Condition, Role, SessionKey, SessionState};

pub mod handler;

pub use handler::SessionHandler;

/// The authoritative session tuple.
///
/// Every transition returns the snapshot event observers should see, so
/// the handler can never mutate without announcing. Transitions carry no
/// guards of their own; the handler decides legality before calling, which
/// keeps each transition trivially unit-testable.
#[derive(Debug)]
pub struct CastState {
    role: Role,
    state: SessionState,
    /// Broadcaster: the sticky key published under. Listener: the key
    /// authorized for. Survives stop; cleared never.
    session_key: Option<SessionKey>,
}

impl CastState {
    pub fn new() -> Self {
        Self {
            role: Role::None,
            state: SessionState::Idle,
            session_key: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Whether a session is in progress (start through teardown)
    pub fn is_engaged(&self) -> bool {
        matches!(
            self.state,
            SessionState::Publishing
                | SessionState::Dialing
                | SessionState::Active
                | SessionState::Stopped
        )
    }

    /// Current snapshot, as the event observers receive
    pub fn snapshot(&self) -> CastEvent {
        CastEvent::StateChanged {
            role: self.role,
            state: self.state,
            session_key: self.session_key.clone(),
        }
    }

    /// Broadcaster authorization succeeded with this session key
    pub fn grant_broadcaster(&mut self, key: SessionKey) -> CastEvent {
        self.role = Role::Broadcaster;
        self.session_key = Some(key);
        self.snapshot()
    }

    /// Listener authorization succeeded (or was restored) for this key.
    /// The listener passively awaits a session start from here.
    pub fn grant_listener(&mut self, key: SessionKey) -> CastEvent {
        self.role = Role::Listener;
        self.session_key = Some(key);
        self.state = SessionState::AwaitingAuthorization;
        self.snapshot()
    }

    /// The session key was rotated
    pub fn set_session_key(&mut self, key: SessionKey) -> CastEvent {
        self.session_key = Some(key);
        self.snapshot()
    }

    /// Start accepted: acquiring capture and registering under `key`
    pub fn begin_publishing(&mut self, key: SessionKey) -> CastEvent {
        self.session_key = Some(key);
        self.state = SessionState::Publishing;
        self.snapshot()
    }

    /// Join accepted: calling the broadcaster
    pub fn begin_dialing(&mut self) -> CastEvent {
        self.state = SessionState::Dialing;
        self.snapshot()
    }

    /// Media is flowing
    pub fn mark_active(&mut self) -> CastEvent {
        self.state = SessionState::Active;
        self.snapshot()
    }

    /// The attempt failed; terminal until a fresh start
    pub fn mark_failed(&mut self, condition: Condition) -> CastEvent {
        self.state = SessionState::Failed(condition);
        self.snapshot()
    }

    /// Teardown begins
    pub fn begin_stopping(&mut self) -> CastEvent {
        self.state = SessionState::Stopped;
        self.snapshot()
    }

    /// Teardown finished; role and key are retained
    pub fn settle_idle(&mut self) -> CastEvent {
        self.state = SessionState::Idle;
        self.snapshot()
    }

    /// Listener falls back to awaiting the next session start
    pub fn await_session(&mut self) -> CastEvent {
        self.state = SessionState::AwaitingAuthorization;
        self.snapshot()
    }
}

impl Default for CastState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s)
    }

    #[test]
    fn starts_idle_with_no_role() {
        let state = CastState::new();
        assert_eq!(state.role(), Role::None);
        assert_eq!(state.state(), SessionState::Idle);
        assert_eq!(state.session_key(), None);
        assert!(!state.is_engaged());
    }

    #[test]
    fn broadcaster_walks_idle_to_active_and_back() {
        let mut state = CastState::new();
        state.grant_broadcaster(key("482913"));
        assert_eq!(state.role(), Role::Broadcaster);
        assert_eq!(state.state(), SessionState::Idle);

        state.begin_publishing(key("482913"));
        assert_eq!(state.state(), SessionState::Publishing);
        assert!(state.is_engaged());

        state.mark_active();
        assert_eq!(state.state(), SessionState::Active);

        state.begin_stopping();
        assert_eq!(state.state(), SessionState::Stopped);

        state.settle_idle();
        assert_eq!(state.state(), SessionState::Idle);
        // Role and key survive the stop
        assert_eq!(state.role(), Role::Broadcaster);
        assert_eq!(state.session_key(), Some(&key("482913")));
    }

    #[test]
    fn listener_falls_back_to_standby_on_dial_failure() {
        let mut state = CastState::new();
        state.grant_listener(key("482913"));
        assert_eq!(state.state(), SessionState::AwaitingAuthorization);

        state.begin_dialing();
        assert_eq!(state.state(), SessionState::Dialing);

        state.await_session();
        assert_eq!(state.state(), SessionState::AwaitingAuthorization);
        assert_eq!(state.session_key(), Some(&key("482913")));
    }

    #[test]
    fn failed_carries_its_condition() {
        let mut state = CastState::new();
        state.grant_broadcaster(key("000001"));
        state.begin_publishing(key("000001"));
        state.mark_failed(Condition::MicrophoneUnavailable);
        assert_eq!(
            state.state(),
            SessionState::Failed(Condition::MicrophoneUnavailable)
        );
        assert!(!state.is_engaged());
    }

    #[test]
    fn transitions_return_matching_snapshots() {
        let mut state = CastState::new();
        let event = state.grant_listener(key("777777"));
        assert_eq!(
            event,
            CastEvent::StateChanged {
                role: Role::Listener,
                state: SessionState::AwaitingAuthorization,
                session_key: Some(key("777777")),
            }
        );
        assert_eq!(event, state.snapshot());
    }

    #[test]
    fn rotation_replaces_the_key_in_place() {
        let mut state = CastState::new();
        state.grant_broadcaster(key("111111"));
        state.set_session_key(key("222222"));
        assert_eq!(state.session_key(), Some(&key("222222")));
        assert_eq!(state.state(), SessionState::Idle);
    }
}
