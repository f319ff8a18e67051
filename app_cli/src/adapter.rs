use audio_io::{AudioCapture, AudioSink};
use auth::Authorizer;
use cast_core::{CastCommand, CastEvent};
use key_store::KeyStore;
use log::error;
use notifier::NoticeBus;
use session::SessionHandler;
use std::sync::Arc;
use tokio::sync::mpsc;
use transport::{LoopbackHub, LoopbackTransport};

/// Cast adapter connects the UI to one client instance: a session handler
/// wired to its own transport on the shared hub and the shared notice bus
pub struct CastAdapter {
    /// Channel for sending session commands
    cast_cmd_tx: mpsc::Sender<CastCommand>,
    /// Channel for receiving session events
    cast_event_rx: mpsc::Receiver<CastEvent>,
}

impl CastAdapter {
    /// Create a new cast adapter and start its background tasks
    pub fn new(
        secret: &str,
        store: KeyStore,
        hub: LoopbackHub,
        bus: NoticeBus,
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        // Create channels
        let (cast_cmd_tx, cast_cmd_rx) = mpsc::channel(100);
        let (cast_event_tx, cast_event_rx) = mpsc::channel(100);

        // The transport task owns this instance's registration and calls
        let (transport_cmd_tx, transport_event_rx) = LoopbackTransport::spawn(hub);

        let mut handler = SessionHandler::new(
            Authorizer::new(secret, store),
            capture,
            sink,
            cast_cmd_rx,
            transport_cmd_tx,
            transport_event_rx,
            bus,
            cast_event_tx,
        );

        // Start the session handler in a background task
        tokio::spawn(async move {
            if let Err(e) = handler.run().await {
                error!("Session handler error: {}", e);
            }
        });

        Self {
            cast_cmd_tx,
            cast_event_rx,
        }
    }

    /// Submit the broadcaster secret
    pub async fn submit_secret(
        &self,
        secret: &str,
    ) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx
            .send(CastCommand::SubmitBroadcasterSecret {
                secret: secret.to_string(),
            })
            .await
    }

    /// Submit a session key to authorize as listener and join
    pub async fn submit_key(&self, key: &str) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx
            .send(CastCommand::SubmitListenerKey {
                key: key.to_string(),
            })
            .await
    }

    /// Start broadcasting
    pub async fn start(&self) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx.send(CastCommand::StartBroadcast).await
    }

    /// Stop broadcasting or listening
    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx.send(CastCommand::StopBroadcast).await
    }

    /// Mint a fresh session key
    pub async fn rotate_key(&self) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx.send(CastCommand::RotateKey).await
    }

    /// Request the current session state
    pub async fn request_state(&self) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx.send(CastCommand::RequestState).await
    }

    /// Shut the instance down
    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<CastCommand>> {
        self.cast_cmd_tx.send(CastCommand::Shutdown).await
    }

    /// Receive the next session event; `None` once the handler is gone
    pub async fn recv_event(&mut self) -> Option<CastEvent> {
        self.cast_event_rx.recv().await
    }
}
