//! In-process transport namespace.
//!
//! The hub is the shared registry every loopback instance talks to: who
//! owns which session key, which calls are awaiting an answer, which are
//! established. Instances look up their counterpart's event sender here
//! and deliver events to it directly; the hub itself never sends while
//! holding its lock.

use crate::TransportError;
use cast_core::{CallId, SessionKey, TransportEvent};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct Registration {
    events: mpsc::Sender<TransportEvent>,
}

struct PendingCall {
    key: SessionKey,
    caller_events: mpsc::Sender<TransportEvent>,
}

struct ActiveCall {
    key: SessionKey,
    caller_events: mpsc::Sender<TransportEvent>,
    broadcaster_events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct HubState {
    broadcasters: HashMap<SessionKey, Registration>,
    pending: HashMap<CallId, PendingCall>,
    active: HashMap<CallId, ActiveCall>,
}

/// Calls torn down by a deregistration, for the caller to notify
pub struct Teardown {
    /// Calls that were still awaiting an answer
    pub pending: Vec<(CallId, mpsc::Sender<TransportEvent>)>,
    /// Established calls
    pub active: Vec<(CallId, mpsc::Sender<TransportEvent>)>,
}

/// Shared registry standing in for the transport namespace. Cloning
/// shares the registry; every instance in one process holds the same hub.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a session key. Exactly one live broadcaster may own a key.
    pub async fn register(
        &self,
        key: SessionKey,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.broadcasters.contains_key(&key) {
            return Err(TransportError::KeyTaken(key));
        }
        debug!("Hub: registered broadcaster under key {}", key);
        state.broadcasters.insert(key, Registration { events });
        Ok(())
    }

    /// Release a session key and collect every call that dies with it
    pub async fn deregister(&self, key: &SessionKey) -> Teardown {
        let mut state = self.state.lock().await;
        state.broadcasters.remove(key);

        let pending_ids: Vec<CallId> = state
            .pending
            .iter()
            .filter(|(_, call)| call.key == *key)
            .map(|(id, _)| *id)
            .collect();
        let pending = pending_ids
            .into_iter()
            .filter_map(|id| state.pending.remove(&id).map(|call| (id, call.caller_events)))
            .collect();

        let active_ids: Vec<CallId> = state
            .active
            .iter()
            .filter(|(_, call)| call.key == *key)
            .map(|(id, _)| *id)
            .collect();
        let active = active_ids
            .into_iter()
            .filter_map(|id| state.active.remove(&id).map(|call| (id, call.caller_events)))
            .collect();

        debug!("Hub: deregistered key {}", key);
        Teardown { pending, active }
    }

    /// Place a call to the broadcaster registered under `key`. Returns the
    /// new call id and the broadcaster's event sender so the caller can
    /// deliver the incoming-call event itself.
    pub async fn dial(
        &self,
        key: &SessionKey,
        caller_events: mpsc::Sender<TransportEvent>,
    ) -> Result<(CallId, mpsc::Sender<TransportEvent>), TransportError> {
        let mut state = self.state.lock().await;
        let broadcaster_events = match state.broadcasters.get(key) {
            Some(registration) => registration.events.clone(),
            None => return Err(TransportError::Unreachable(key.clone())),
        };

        let call = CallId::new();
        state.pending.insert(
            call,
            PendingCall {
                key: key.clone(),
                caller_events,
            },
        );
        debug!("Hub: call {} dialing key {}", call, key);
        Ok((call, broadcaster_events))
    }

    /// Answer a pending call, promoting it to active. Returns the caller's
    /// event sender, or `None` if the call is no longer pending.
    pub async fn answer(&self, call: CallId) -> Option<mpsc::Sender<TransportEvent>> {
        let mut state = self.state.lock().await;
        let pending = state.pending.remove(&call)?;

        let broadcaster_events = match state.broadcasters.get(&pending.key) {
            Some(registration) => registration.events.clone(),
            None => {
                debug!("Hub: call {} answered after its key was released", call);
                return None;
            }
        };

        let caller_events = pending.caller_events.clone();
        state.active.insert(
            call,
            ActiveCall {
                key: pending.key,
                caller_events: pending.caller_events,
                broadcaster_events,
            },
        );
        debug!("Hub: call {} active", call);
        Some(caller_events)
    }

    /// Hang up a pending or active call from the caller side. Returns the
    /// broadcaster's event sender to notify, if it is still around.
    pub async fn hangup(&self, call: CallId) -> Option<mpsc::Sender<TransportEvent>> {
        let mut state = self.state.lock().await;

        if let Some(pending) = state.pending.remove(&call) {
            debug!("Hub: call {} abandoned before answer", call);
            return state
                .broadcasters
                .get(&pending.key)
                .map(|registration| registration.events.clone());
        }

        if let Some(active) = state.active.remove(&call) {
            debug!("Hub: call {} hung up", call);
            return Some(active.broadcaster_events);
        }

        None
    }

    /// Whether a broadcaster currently owns `key`
    pub async fn is_registered(&self, key: &SessionKey) -> bool {
        self.state.lock().await.broadcasters.contains_key(key)
    }
}
