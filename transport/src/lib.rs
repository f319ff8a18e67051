//! Media transport for aircast
//!
//! The session core drives the transport through a command/event channel
//! pair and never sees negotiation details. This crate provides the
//! loopback implementation: instances in the same process meet through a
//! shared [`LoopbackHub`] and hand each other live [`MediaStream`]s. A
//! networked transport replaces this crate behind the same channels.

use cast_core::{EndpointId, SessionKey, TransportCommand, TransportEvent};
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod hub;

pub use hub::LoopbackHub;

/// Channel depth for transport commands and events
const CHANNEL_CAPACITY: usize = 100;

/// Errors the transport namespace can report
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("session key {0} is already registered")]
    KeyTaken(SessionKey),

    #[error("no broadcaster is registered under key {0}")]
    Unreachable(SessionKey),
}

/// One client instance's connection to the loopback namespace.
///
/// Owns this instance's registration and its single outstanding call (a
/// listener dials one broadcaster at a time; a broadcaster answers any
/// number of calls, which the hub tracks per call id).
pub struct LoopbackTransport {
    hub: LoopbackHub,
    command_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    registered: Option<SessionKey>,
    current_call: Option<cast_core::CallId>,
}

impl LoopbackTransport {
    pub fn new(
        hub: LoopbackHub,
        command_rx: mpsc::Receiver<TransportCommand>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            hub,
            command_rx,
            event_tx,
            registered: None,
            current_call: None,
        }
    }

    /// Spawn a transport instance on the given hub, returning the channel
    /// pair the session drives it through.
    pub fn spawn(
        hub: LoopbackHub,
    ) -> (
        mpsc::Sender<TransportCommand>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut transport = Self::new(hub, command_rx, event_tx);
        tokio::spawn(async move {
            transport.run().await;
        });
        (command_tx, event_rx)
    }

    /// Process commands until the session drops its sender, then release
    /// whatever this instance still holds in the namespace.
    pub async fn run(&mut self) {
        while let Some(command) = self.command_rx.recv().await {
            self.handle_command(command).await;
        }

        // Session side is gone; release the namespace
        if self.registered.is_some() {
            self.deregister().await;
        }
        if self.current_call.is_some() {
            self.hangup().await;
        }
        debug!("Loopback transport exiting");
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Register { key } => {
                match self.hub.register(key.clone(), self.event_tx.clone()).await {
                    Ok(()) => {
                        self.registered = Some(key.clone());
                        self.emit(TransportEvent::Registered { key }).await;
                    }
                    Err(e) => {
                        warn!("Registration of key {} rejected: {}", key, e);
                        self.emit(TransportEvent::RegisterFailed {
                            key,
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }

            TransportCommand::Deregister => {
                self.deregister().await;
            }

            TransportCommand::Dial { key } => {
                // Fresh anonymous identity per call attempt
                let caller = EndpointId::new();
                match self.hub.dial(&key, self.event_tx.clone()).await {
                    Ok((call, broadcaster_events)) => {
                        debug!("Endpoint {} dialing key {} as call {}", caller, key, call);
                        self.current_call = Some(call);
                        if broadcaster_events
                            .send(TransportEvent::IncomingCall { call, caller })
                            .await
                            .is_err()
                        {
                            // Broadcaster's event channel is gone; undo the dial
                            self.hub.hangup(call).await;
                            self.current_call = None;
                            self.emit(TransportEvent::CallFailed {
                                key,
                                reason: "broadcaster is not listening".to_string(),
                            })
                            .await;
                        }
                    }
                    Err(e) => {
                        debug!("Dial to key {} failed: {}", key, e);
                        self.emit(TransportEvent::CallFailed {
                            key,
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }

            TransportCommand::Answer { call, stream } => match self.hub.answer(call).await {
                Some(caller_events) => {
                    if caller_events
                        .send(TransportEvent::StreamReceived { call, stream })
                        .await
                        .is_err()
                    {
                        // Caller vanished between dial and answer
                        if let Some(peer) = self.hub.hangup(call).await {
                            let _ = peer.send(TransportEvent::CallClosed { call }).await;
                        }
                    }
                }
                None => {
                    debug!("Call {} is no longer pending, answer dropped", call);
                    self.emit(TransportEvent::CallClosed { call }).await;
                }
            },

            TransportCommand::Hangup => {
                self.hangup().await;
            }
        }
    }

    async fn deregister(&mut self) {
        let Some(key) = self.registered.take() else {
            debug!("Deregister with nothing registered, ignoring");
            return;
        };

        let teardown = self.hub.deregister(&key).await;
        for (call, caller) in teardown.pending {
            debug!("Failing pending call {} after deregistration", call);
            let _ = caller
                .send(TransportEvent::CallFailed {
                    key: key.clone(),
                    reason: "broadcaster went away".to_string(),
                })
                .await;
        }
        for (call, caller) in teardown.active {
            debug!("Closing call {} after deregistration", call);
            let _ = caller.send(TransportEvent::CallClosed { call }).await;
        }
    }

    async fn hangup(&mut self) {
        let Some(call) = self.current_call.take() else {
            debug!("Hangup with no outstanding call, ignoring");
            return;
        };

        if let Some(peer) = self.hub.hangup(call).await {
            let _ = peer.send(TransportEvent::CallClosed { call }).await;
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Session side gone, transport event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_core::{AudioBuffer, MediaStream};
    use tokio::sync::broadcast;

    async fn recv(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        rx.recv().await.expect("transport event")
    }

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s)
    }

    #[test_log::test(tokio::test)]
    async fn register_dial_answer_delivers_stream() {
        let hub = LoopbackHub::new();
        let (b_cmd, mut b_events) = LoopbackTransport::spawn(hub.clone());
        let (l_cmd, mut l_events) = LoopbackTransport::spawn(hub.clone());

        b_cmd
            .send(TransportCommand::Register { key: key("482913") })
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut b_events).await,
            TransportEvent::Registered { .. }
        ));

        l_cmd
            .send(TransportCommand::Dial { key: key("482913") })
            .await
            .unwrap();
        let call = match recv(&mut b_events).await {
            TransportEvent::IncomingCall { call, .. } => call,
            other => panic!("expected IncomingCall, got {:?}", other),
        };

        let (frames, stream_rx) = broadcast::channel::<AudioBuffer>(4);
        b_cmd
            .send(TransportCommand::Answer {
                call,
                stream: MediaStream::new(stream_rx),
            })
            .await
            .unwrap();

        let mut stream = match recv(&mut l_events).await {
            TransportEvent::StreamReceived { stream, .. } => stream,
            other => panic!("expected StreamReceived, got {:?}", other),
        };

        // Media flows end to end
        frames.send(vec![0.5; 4]).unwrap();
        assert_eq!(stream.recv().await, Some(vec![0.5; 4]));
    }

    #[tokio::test]
    async fn second_registration_of_live_key_rejected() {
        let hub = LoopbackHub::new();
        let (first_cmd, mut first_events) = LoopbackTransport::spawn(hub.clone());
        let (second_cmd, mut second_events) = LoopbackTransport::spawn(hub.clone());

        first_cmd
            .send(TransportCommand::Register { key: key("111111") })
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut first_events).await,
            TransportEvent::Registered { .. }
        ));

        second_cmd
            .send(TransportCommand::Register { key: key("111111") })
            .await
            .unwrap();
        match recv(&mut second_events).await {
            TransportEvent::RegisterFailed { reason, .. } => {
                assert!(reason.contains("already registered"));
            }
            other => panic!("expected RegisterFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dialing_unregistered_key_fails_cleanly() {
        let hub = LoopbackHub::new();
        let (l_cmd, mut l_events) = LoopbackTransport::spawn(hub);

        l_cmd
            .send(TransportCommand::Dial { key: key("000000") })
            .await
            .unwrap();
        match recv(&mut l_events).await {
            TransportEvent::CallFailed { key: failed, .. } => {
                assert_eq!(failed, key("000000"));
            }
            other => panic!("expected CallFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn deregister_fails_pending_and_closes_active_calls() {
        let hub = LoopbackHub::new();
        let (b_cmd, mut b_events) = LoopbackTransport::spawn(hub.clone());
        let (l_cmd, mut l_events) = LoopbackTransport::spawn(hub.clone());

        b_cmd
            .send(TransportCommand::Register { key: key("222222") })
            .await
            .unwrap();
        recv(&mut b_events).await;

        // Establish a call
        l_cmd
            .send(TransportCommand::Dial { key: key("222222") })
            .await
            .unwrap();
        let call = match recv(&mut b_events).await {
            TransportEvent::IncomingCall { call, .. } => call,
            other => panic!("expected IncomingCall, got {:?}", other),
        };
        let (_frames, stream_rx) = broadcast::channel::<AudioBuffer>(4);
        b_cmd
            .send(TransportCommand::Answer {
                call,
                stream: MediaStream::new(stream_rx),
            })
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut l_events).await,
            TransportEvent::StreamReceived { .. }
        ));

        b_cmd.send(TransportCommand::Deregister).await.unwrap();
        match recv(&mut l_events).await {
            TransportEvent::CallClosed { call: closed } => assert_eq!(closed, call),
            other => panic!("expected CallClosed, got {:?}", other),
        }

        // The key is free again
        assert!(!hub.is_registered(&key("222222")).await);
    }

    #[tokio::test]
    async fn listener_hangup_notifies_broadcaster() {
        let hub = LoopbackHub::new();
        let (b_cmd, mut b_events) = LoopbackTransport::spawn(hub.clone());
        let (l_cmd, mut l_events) = LoopbackTransport::spawn(hub.clone());

        b_cmd
            .send(TransportCommand::Register { key: key("333333") })
            .await
            .unwrap();
        recv(&mut b_events).await;

        l_cmd
            .send(TransportCommand::Dial { key: key("333333") })
            .await
            .unwrap();
        let call = match recv(&mut b_events).await {
            TransportEvent::IncomingCall { call, .. } => call,
            other => panic!("expected IncomingCall, got {:?}", other),
        };
        let (_frames, stream_rx) = broadcast::channel::<AudioBuffer>(4);
        b_cmd
            .send(TransportCommand::Answer {
                call,
                stream: MediaStream::new(stream_rx),
            })
            .await
            .unwrap();
        recv(&mut l_events).await;

        l_cmd.send(TransportCommand::Hangup).await.unwrap();
        match recv(&mut b_events).await {
            TransportEvent::CallClosed { call: closed } => assert_eq!(closed, call),
            other => panic!("expected CallClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_command_channel_releases_registration() {
        let hub = LoopbackHub::new();
        let (b_cmd, mut b_events) = LoopbackTransport::spawn(hub.clone());

        b_cmd
            .send(TransportCommand::Register { key: key("444444") })
            .await
            .unwrap();
        recv(&mut b_events).await;
        assert!(hub.is_registered(&key("444444")).await);

        drop(b_cmd);
        // The run loop exits and releases the key
        let mut tries = 0;
        while hub.is_registered(&key("444444")).await {
            tries += 1;
            assert!(tries < 50, "registration was never released");
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    }
}
