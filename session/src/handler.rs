use crate::CastState;
use auth::{AuthError, Authorizer};
use audio_io::{AudioCapture, AudioSink, CaptureHandle, SinkHandle};
use cast_core::{
    CallId, CastCommand, CastEvent, Condition, Error, Role, SessionState, TransportCommand,
    TransportEvent,
};
use log::{debug, error, info, warn};
use notifier::{Notice, NoticeBus};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Handler for session operations, coordinating authorization, the
/// transport and the audio seams.
///
/// The only component allowed to mutate [`CastState`]. Every transition
/// happens inside this task, reacting to one command, notice or transport
/// event at a time; anything arriving while a start is mid-flight queues
/// behind it.
pub struct SessionHandler {
    /// The session state
    state: CastState,
    /// Authorization and session key lifecycle
    authorizer: Authorizer,
    /// Local audio source
    capture: Arc<dyn AudioCapture>,
    /// Local playback destination
    sink: Arc<dyn AudioSink>,
    /// Channel for receiving session commands from the UI
    command_rx: mpsc::Receiver<CastCommand>,
    /// Channel for sending transport commands
    transport_tx: mpsc::Sender<TransportCommand>,
    /// Channel for receiving transport events
    transport_rx: mpsc::Receiver<TransportEvent>,
    /// Same-device session notices
    notices: NoticeBus,
    /// Subscription to session notices
    notice_rx: broadcast::Receiver<Notice>,
    /// Channel for sending session events to the UI
    event_tx: mpsc::Sender<CastEvent>,
    /// Capture held for the duration of a broadcast
    capture_handle: Option<CaptureHandle>,
    /// Sink held while listening
    sink_handle: Option<SinkHandle>,
    /// Live listener calls (broadcaster side)
    live_calls: HashSet<CallId>,
}

impl SessionHandler {
    /// Create a new session handler
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        authorizer: Authorizer,
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
        command_rx: mpsc::Receiver<CastCommand>,
        transport_tx: mpsc::Sender<TransportCommand>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        notices: NoticeBus,
        event_tx: mpsc::Sender<CastEvent>,
    ) -> Self {
        let notice_rx = notices.subscribe();
        Self {
            state: CastState::new(),
            authorizer,
            capture,
            sink,
            command_rx,
            transport_tx,
            transport_rx,
            notices,
            notice_rx,
            event_tx,
            capture_handle: None,
            sink_handle: None,
            live_calls: HashSet::new(),
        }
    }

    /// Run the session handler, processing commands, notices and
    /// transport events
    pub async fn run(&mut self) -> Result<(), Error> {
        self.restore().await?;

        loop {
            tokio::select! {
                // Process commands from the UI
                command = self.command_rx.recv() => {
                    match command {
                        Some(CastCommand::Shutdown) => {
                            info!("Received shutdown command, exiting handler");
                            break;
                        }
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                error!("Error handling cast command: {}", e);
                            }
                        }
                        None => {
                            debug!("Command channel closed, exiting handler");
                            break;
                        }
                    }
                }

                // Process events from the transport
                Some(event) = self.transport_rx.recv() => {
                    if let Err(e) = self.handle_transport_event(event).await {
                        error!("Error handling transport event: {}", e);
                    }
                }

                // Process session notices from other instances
                notice = self.notice_rx.recv() => {
                    match notice {
                        Ok(notice) => {
                            if let Err(e) = self.handle_notice(notice).await {
                                error!("Error handling notice: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Notice subscription lagged, skipped {} notices", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                // Check for task cancellation
                else => break,
            }
        }

        // Release anything still held before exiting
        if self.state.is_engaged() || self.capture_handle.is_some() || self.sink_handle.is_some() {
            if let Err(e) = self.stop_session().await {
                debug!("Teardown on exit: {}", e);
            }
        }

        Ok(())
    }

    /// Restore persisted authorization and emit the initial snapshot
    async fn restore(&mut self) -> Result<(), Error> {
        if !self.authorizer.persistent() {
            self.report(Condition::StorageUnavailable).await?;
        }

        if let Some(key) = self.authorizer.restore_listener() {
            // Previously-authorized listener: arm for the next session
            // start instead of re-prompting
            info!("Restored listener authorization for key {}", key);
            let event = self.state.grant_listener(key);
            self.emit(event).await
        } else {
            self.emit(self.state.snapshot()).await
        }
    }

    /// Handle a command from the UI
    async fn handle_command(&mut self, command: CastCommand) -> Result<(), Error> {
        match command {
            CastCommand::SubmitBroadcasterSecret { secret } => {
                if self.state.is_engaged() {
                    warn!(
                        "Ignoring broadcaster authorization while {}",
                        self.state.state()
                    );
                    return Ok(());
                }
                if self.state.role() == Role::Listener {
                    warn!("Instance is authorized as listener, ignoring broadcaster secret");
                    return Ok(());
                }

                match self.authorizer.authorize_broadcaster(&secret) {
                    Ok(key) => {
                        info!("Broadcaster authorized, session key {}", key);
                        let event = self.state.grant_broadcaster(key);
                        self.emit(event).await?;
                    }
                    Err(e) => {
                        self.report(condition_for(e)).await?;
                    }
                }
            }

            CastCommand::SubmitListenerKey { key } => {
                if self.state.is_engaged() {
                    warn!("Ignoring listener authorization while {}", self.state.state());
                    return Ok(());
                }
                if self.state.role() == Role::Broadcaster {
                    warn!("Instance is authorized as broadcaster, ignoring listener key");
                    return Ok(());
                }

                match self.authorizer.authorize_listener(&key) {
                    Ok(key) => {
                        let event = self.state.grant_listener(key);
                        self.emit(event).await?;
                        // Explicit join: dial right away
                        self.begin_dial().await?;
                    }
                    Err(e) => {
                        self.report(condition_for(e)).await?;
                    }
                }
            }

            CastCommand::StartBroadcast => {
                self.start_broadcast().await?;
            }

            CastCommand::StopBroadcast => {
                self.stop_session().await?;
            }

            CastCommand::RotateKey => {
                if self.state.role() != Role::Broadcaster {
                    warn!("Ignoring key rotation without broadcaster authorization");
                    return Ok(());
                }
                if self.state.is_engaged() {
                    warn!("Refusing key rotation while {}", self.state.state());
                    return Ok(());
                }

                let key = self.authorizer.rotate_key();
                let event = self.state.set_session_key(key);
                self.emit(event).await?;
            }

            CastCommand::RequestState => {
                debug!("Sending current session state to UI");
                self.emit(self.state.snapshot()).await?;
            }

            CastCommand::Shutdown => {
                // This is handled in the run method before we reach here
                unreachable!()
            }
        }

        Ok(())
    }

    /// Begin a broadcast: acquire capture, then register the session key
    async fn start_broadcast(&mut self) -> Result<(), Error> {
        if self.state.role() != Role::Broadcaster {
            warn!("Start requested without broadcaster authorization");
            return self.report(Condition::NotAuthorized).await;
        }

        if matches!(
            self.state.state(),
            SessionState::Active | SessionState::Publishing
        ) {
            // Idempotent start: the existing session key is reused, never
            // regenerated
            info!("Broadcast already {}, start ignored", self.state.state());
            return self.emit(self.state.snapshot()).await;
        }

        let key = self.authorizer.ensure_session_key();
        let event = self.state.begin_publishing(key.clone());
        self.emit(event).await?;

        // May prompt for permission; transitions stay serialized behind
        // this await
        let handle = match self.capture.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Could not acquire capture: {}", e);
                let event = self.state.mark_failed(Condition::MicrophoneUnavailable);
                self.emit(event).await?;
                return self.report(Condition::MicrophoneUnavailable).await;
            }
        };
        self.capture_handle = Some(handle);

        self.send_transport(TransportCommand::Register { key }).await
    }

    /// Tear the session down and settle back to idle. Safe to call after a
    /// partial start; every step tolerates the resource being absent.
    async fn stop_session(&mut self) -> Result<(), Error> {
        if self.state.state() == SessionState::Idle
            && self.capture_handle.is_none()
            && self.sink_handle.is_none()
        {
            debug!("Stop with nothing in progress, ignoring");
            return Ok(());
        }

        let stopped = self.state.begin_stopping();
        self.emit(stopped).await?;

        match self.state.role() {
            Role::Broadcaster => {
                self.capture_handle = None;
                self.send_transport(TransportCommand::Deregister).await?;
                if !self.live_calls.is_empty() {
                    self.live_calls.clear();
                    self.emit(CastEvent::ListenerCountChanged { count: 0 }).await?;
                }
                // Announced even when no listener ever connected
                self.notices.publish(Notice::Stop);
            }
            Role::Listener => {
                self.sink_handle = None;
                self.send_transport(TransportCommand::Hangup).await?;
            }
            Role::None => {}
        }

        let idle = self.state.settle_idle();
        self.emit(idle).await
    }

    /// Dial the broadcaster under the authorized key
    async fn begin_dial(&mut self) -> Result<(), Error> {
        let Some(key) = self.state.session_key().cloned() else {
            return Err(Error::InvalidState(
                "dial without an authorized key".to_string(),
            ));
        };

        let event = self.state.begin_dialing();
        self.emit(event).await?;
        self.send_transport(TransportCommand::Dial { key }).await
    }

    /// Handle an event from the transport
    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), Error> {
        match event {
            TransportEvent::Registered { key } => {
                if self.state.state() != SessionState::Publishing {
                    debug!("Stale registration of key {}, ignoring", key);
                    return Ok(());
                }

                info!("Broadcasting under key {}, waiting for listeners", key);
                let event = self.state.mark_active();
                self.emit(event).await?;
                // Announce only once the transport owns the key, so a
                // notice-triggered dial can never race the registration
                self.notices.publish(Notice::Start { key });
            }

            TransportEvent::RegisterFailed { key, reason } => {
                if self.state.state() != SessionState::Publishing {
                    debug!("Stale registration failure for key {}, ignoring", key);
                    return Ok(());
                }

                warn!("Could not register key {}: {}", key, reason);
                // Release the source acquired for this attempt
                self.capture_handle = None;
                let event = self.state.mark_failed(Condition::KeyInUse);
                self.emit(event).await?;
                self.report(Condition::KeyInUse).await?;
            }

            TransportEvent::IncomingCall { call, caller } => {
                if self.state.state() != SessionState::Active
                    || self.state.role() != Role::Broadcaster
                {
                    debug!("Incoming call {} while {}, ignoring", call, self.state.state());
                    return Ok(());
                }
                let Some(capture) = &self.capture_handle else {
                    debug!("Incoming call {} with no live capture, ignoring", call);
                    return Ok(());
                };

                info!("Listener {} connected on call {}", caller, call);
                let stream = capture.stream();
                self.send_transport(TransportCommand::Answer { call, stream })
                    .await?;
                self.live_calls.insert(call);
                self.emit(CastEvent::ListenerCountChanged {
                    count: self.live_calls.len(),
                })
                .await?;
            }

            TransportEvent::StreamReceived { call, stream } => {
                if self.state.state() != SessionState::Dialing {
                    debug!("Stream for call {} while {}, ignoring", call, self.state.state());
                    return Ok(());
                }

                let handle = self.sink.attach(stream);
                let blocked = handle.play().is_err();
                self.sink_handle = Some(handle);

                let event = self.state.mark_active();
                self.emit(event).await?;
                if blocked {
                    // Media is flowing; only the audible side needs a
                    // user gesture
                    info!("Connected on call {}, playback awaiting user gesture", call);
                    self.report(Condition::AutoplayBlocked).await?;
                } else {
                    info!("Connected on call {}, playing", call);
                }
            }

            TransportEvent::CallFailed { key, reason } => {
                if self.state.state() != SessionState::Dialing {
                    debug!("Dial failure for key {} while {}, ignoring", key, self.state.state());
                    return Ok(());
                }

                // Fail fast; the user or the next start notice retries
                warn!("Could not reach broadcaster under key {}: {}", key, reason);
                let event = self.state.await_session();
                self.emit(event).await?;
                self.report(Condition::BroadcasterUnreachable).await?;
            }

            TransportEvent::CallClosed { call } => match self.state.role() {
                Role::Broadcaster => {
                    if self.live_calls.remove(&call) {
                        info!("Listener on call {} left", call);
                        self.emit(CastEvent::ListenerCountChanged {
                            count: self.live_calls.len(),
                        })
                        .await?;
                    }
                }
                Role::Listener => {
                    if self.state.state() == SessionState::Active {
                        // The broadcast went away without a stop notice;
                        // re-arm for the next start
                        info!("Call {} closed by the far side", call);
                        self.sink_handle = None;
                        let event = self.state.await_session();
                        self.emit(event).await?;
                    }
                }
                Role::None => {
                    debug!("Call {} closed with no role, ignoring", call);
                }
            },
        }

        Ok(())
    }

    /// Handle a session notice from another instance on this device
    async fn handle_notice(&mut self, notice: Notice) -> Result<(), Error> {
        if self.state.role() == Role::Broadcaster {
            // We originate these; the in-process bus loops them back
            debug!("Ignoring own notice {:?}", notice);
            return Ok(());
        }

        match notice {
            Notice::Start { key } => {
                if self.state.role() != Role::Listener {
                    debug!("Start notice without listener authorization, ignoring");
                    return Ok(());
                }

                match self.state.state() {
                    SessionState::Dialing | SessionState::Active => {
                        // Duplicate announcement, or an announcement for a
                        // different session: either way we stay on the
                        // session we're attached to until explicitly stopped
                        debug!("Start notice for key {} while {}, ignoring", key, self.state.state());
                    }
                    _ => {
                        if self.state.session_key() == Some(&key) {
                            info!("Session {} started, auto-joining", key);
                            self.begin_dial().await?;
                        } else {
                            warn!(
                                "Start notice for key {} does not match the stored key",
                                key
                            );
                            self.report(Condition::KeyMismatch).await?;
                        }
                    }
                }
            }

            Notice::Stop => match self.state.state() {
                SessionState::Dialing | SessionState::Active => {
                    info!("Session stopped, disconnecting");
                    self.sink_handle = None;
                    self.send_transport(TransportCommand::Hangup).await?;
                    let stopped = self.state.begin_stopping();
                    self.emit(stopped).await?;
                    let idle = self.state.settle_idle();
                    self.emit(idle).await?;
                }
                _ => {
                    debug!("Stop notice while {}, nothing to do", self.state.state());
                }
            },
        }

        Ok(())
    }

    /// Emit a session event to the UI
    async fn emit(&self, event: CastEvent) -> Result<(), Error> {
        self.event_tx
            .send(event)
            .await
            .map_err(|e| Error::Session(format!("Failed to send cast event: {}", e)))
    }

    /// Report a condition to the UI
    async fn report(&self, condition: Condition) -> Result<(), Error> {
        self.emit(CastEvent::ConditionReported(condition)).await
    }

    /// Send a command to the transport
    async fn send_transport(&self, command: TransportCommand) -> Result<(), Error> {
        self.transport_tx
            .send(command)
            .await
            .map_err(|e| Error::Transport(format!("Failed to send transport command: {}", e)))
    }
}

fn condition_for(error: AuthError) -> Condition {
    match error {
        AuthError::WrongSecret => Condition::WrongSecret,
        AuthError::WrongKeyOrNoBroadcastYet => Condition::WrongKeyOrNoBroadcastYet,
    }
}
