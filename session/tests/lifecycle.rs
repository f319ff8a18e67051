use audio_io::{AudioSink, PlayPolicy, SinkHandle, SyntheticCapture};
use auth::Authorizer;
use cast_core::{CastCommand, CastEvent, Condition, MediaStream, Role, SessionKey, SessionState};
use key_store::KeyStore;
use notifier::NoticeBus;
use session::SessionHandler;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, Duration};
use transport::{LoopbackHub, LoopbackTransport};

const SECRET: &str = "1234";

/// Sink that counts drained frames into a counter the test can watch
struct CountingSink {
    frames: Arc<AtomicU64>,
}

impl CountingSink {
    fn new() -> (Self, Arc<AtomicU64>) {
        let frames = Arc::new(AtomicU64::new(0));
        (
            Self {
                frames: frames.clone(),
            },
            frames,
        )
    }
}

impl AudioSink for CountingSink {
    fn attach(&self, mut stream: MediaStream) -> SinkHandle {
        let playing = Arc::new(AtomicBool::new(false));
        let frames_seen = Arc::new(AtomicU64::new(0));
        let shared = self.frames.clone();
        let seen = frames_seen.clone();
        let drain = tokio::spawn(async move {
            while stream.recv().await.is_some() {
                seen.fetch_add(1, Ordering::Relaxed);
                shared.fetch_add(1, Ordering::Relaxed);
            }
        });
        SinkHandle::new(playing, frames_seen, PlayPolicy::Auto, drain)
    }
}

/// One client instance: a session handler wired to its own transport on the
/// shared hub, sharing the device-wide notice bus and key file
struct Instance {
    commands: mpsc::Sender<CastCommand>,
    events: mpsc::Receiver<CastEvent>,
    task: JoinHandle<()>,
}

impl Instance {
    async fn send(&self, command: CastCommand) {
        self.commands.send(command).await.expect("handler gone");
    }

    async fn shutdown(self) {
        let _ = self.commands.send(CastCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

fn spawn_instance(key_path: &Path, hub: &LoopbackHub, bus: &NoticeBus) -> Instance {
    spawn_instance_with_sink(key_path, hub, bus, Arc::new(audio_io::MonitorSink::new()))
}

fn spawn_instance_with_sink(
    key_path: &Path,
    hub: &LoopbackHub,
    bus: &NoticeBus,
    sink: Arc<dyn AudioSink>,
) -> Instance {
    let (transport_tx, transport_rx) = LoopbackTransport::spawn(hub.clone());
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(32);

    let mut handler = SessionHandler::new(
        Authorizer::new(SECRET, KeyStore::with_file(key_path)),
        Arc::new(SyntheticCapture::new()),
        sink,
        command_rx,
        transport_tx,
        transport_rx,
        bus.clone(),
        event_tx,
    );
    let task = tokio::spawn(async move {
        handler.run().await.expect("handler failed");
    });

    Instance {
        commands: command_tx,
        events: event_rx,
        task,
    }
}

/// Read events until one matches, panicking if it never arrives
async fn wait_for(
    instance: &mut Instance,
    description: &str,
    predicate: impl Fn(&CastEvent) -> bool,
) -> CastEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = instance.events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", description))
}

async fn wait_for_state(instance: &mut Instance, wanted: SessionState) -> Option<SessionKey> {
    let event = wait_for(instance, &format!("state {}", wanted), |e| {
        matches!(e, CastEvent::StateChanged { state, .. } if *state == wanted)
    })
    .await;
    match event {
        CastEvent::StateChanged { session_key, .. } => session_key,
        _ => unreachable!(),
    }
}

/// Wait for the instance to settle into a standby state after a session
/// ends. Depending on whether the stop notice or the transport close lands
/// first, that is Idle or the armed listener standby.
async fn wait_for_standby(instance: &mut Instance) {
    wait_for(instance, "a standby state", |e| {
        matches!(
            e,
            CastEvent::StateChanged {
                state: SessionState::Idle | SessionState::AwaitingAuthorization,
                ..
            }
        )
    })
    .await;
}

async fn wait_for_condition(instance: &mut Instance, wanted: Condition) {
    wait_for(instance, &format!("condition {}", wanted), |e| {
        matches!(e, CastEvent::ConditionReported(condition) if *condition == wanted)
    })
    .await;
}

async fn wait_for_count(instance: &mut Instance, wanted: usize) {
    wait_for(instance, &format!("listener count {}", wanted), |e| {
        matches!(e, CastEvent::ListenerCountChanged { count } if *count == wanted)
    })
    .await;
}

#[tokio::test]
async fn full_session_lifecycle() {
    let dir = tempdir().unwrap();
    let key_path = dir.path().join("keys.toml");
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    let mut broadcaster = spawn_instance(&key_path, &hub, &bus);
    let (sink, frames) = CountingSink::new();
    let mut listener = spawn_instance_with_sink(&key_path, &hub, &bus, Arc::new(sink));
    wait_for_state(&mut broadcaster, SessionState::Idle).await;
    wait_for_state(&mut listener, SessionState::Idle).await;

    // Step 1: broadcaster authorizes with the shared secret
    broadcaster
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    let event = wait_for(&mut broadcaster, "broadcaster authorization", |e| {
        matches!(
            e,
            CastEvent::StateChanged {
                role: Role::Broadcaster,
                ..
            }
        )
    })
    .await;
    let key = match event {
        CastEvent::StateChanged { session_key, .. } => session_key.expect("no session key"),
        _ => unreachable!(),
    };
    println!("Broadcaster authorized with session key {}", key);

    // Step 2: broadcaster goes live
    broadcaster.send(CastCommand::StartBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Active).await;

    // Step 3: listener authorizes with the key and joins
    listener
        .send(CastCommand::SubmitListenerKey {
            key: key.as_str().to_string(),
        })
        .await;
    wait_for_state(&mut listener, SessionState::Active).await;
    wait_for_count(&mut broadcaster, 1).await;

    // Step 4: audio flows from the broadcaster's capture to the listener's
    // sink
    let mut heard = false;
    for _ in 0..50 {
        if frames.load(Ordering::Relaxed) > 0 {
            heard = true;
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert!(heard, "no audio frames reached the listener");

    // Step 5: broadcaster ends the session; both sides settle
    broadcaster.send(CastCommand::StopBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Stopped).await;
    wait_for_count(&mut broadcaster, 0).await;
    wait_for_state(&mut broadcaster, SessionState::Idle).await;
    wait_for_standby(&mut listener).await;

    broadcaster.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test]
async fn early_dial_fails_fast_then_start_notice_joins() {
    let dir = tempdir().unwrap();
    let key_path = dir.path().join("keys.toml");
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    let mut broadcaster = spawn_instance(&key_path, &hub, &bus);
    let mut listener = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut broadcaster, SessionState::Idle).await;
    wait_for_state(&mut listener, SessionState::Idle).await;

    // The broadcaster has authorized (so the key exists) but is not live yet
    broadcaster
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    let key = wait_for_state(&mut broadcaster, SessionState::Idle)
        .await
        .expect("no session key");

    // The listener's explicit join fails immediately, no retry loop
    listener
        .send(CastCommand::SubmitListenerKey {
            key: key.as_str().to_string(),
        })
        .await;
    wait_for_state(&mut listener, SessionState::Dialing).await;
    wait_for_state(&mut listener, SessionState::AwaitingAuthorization).await;
    wait_for_condition(&mut listener, Condition::BroadcasterUnreachable).await;

    // Once the broadcast goes live, the start notice pulls the armed
    // listener in without any user action
    broadcaster.send(CastCommand::StartBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Active).await;
    wait_for_state(&mut listener, SessionState::Active).await;
    wait_for_count(&mut broadcaster, 1).await;

    broadcaster.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test]
async fn restart_reuses_session_key() {
    let dir = tempdir().unwrap();
    let key_path = dir.path().join("keys.toml");
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    // First run mints the key
    let mut first = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut first, SessionState::Idle).await;
    first
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    let minted = wait_for_state(&mut first, SessionState::Idle)
        .await
        .expect("no session key");
    first.shutdown().await;

    // A fresh instance over the same store authorizes to the same key and
    // broadcasts under it
    let mut second = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut second, SessionState::Idle).await;
    second
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    let restored = wait_for_state(&mut second, SessionState::Idle)
        .await
        .expect("no session key");
    assert_eq!(restored, minted);

    second.send(CastCommand::StartBroadcast).await;
    let active_key = wait_for_state(&mut second, SessionState::Active).await;
    assert_eq!(active_key, Some(minted));
    second.shutdown().await;
}

#[tokio::test]
async fn second_broadcaster_cannot_take_a_live_key() {
    let dir = tempdir().unwrap();
    let key_path = dir.path().join("keys.toml");
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    let mut first = spawn_instance(&key_path, &hub, &bus);
    let mut second = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut first, SessionState::Idle).await;
    wait_for_state(&mut second, SessionState::Idle).await;

    // Both instances authorize over the shared store, so both hold the
    // same session key
    first
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    wait_for_state(&mut first, SessionState::Idle).await;
    second
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    wait_for_state(&mut second, SessionState::Idle).await;

    first.send(CastCommand::StartBroadcast).await;
    wait_for_state(&mut first, SessionState::Active).await;

    // The key is live; the second registration is rejected
    second.send(CastCommand::StartBroadcast).await;
    wait_for(&mut second, "registration rejection", |e| {
        matches!(
            e,
            CastEvent::StateChanged {
                state: SessionState::Failed(Condition::KeyInUse),
                ..
            }
        )
    })
    .await;
    wait_for_condition(&mut second, Condition::KeyInUse).await;

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn listener_leaving_keeps_the_broadcast_running() {
    let dir = tempdir().unwrap();
    let key_path = dir.path().join("keys.toml");
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    let mut broadcaster = spawn_instance(&key_path, &hub, &bus);
    let mut listener = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut broadcaster, SessionState::Idle).await;
    wait_for_state(&mut listener, SessionState::Idle).await;

    broadcaster
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    let key = wait_for_state(&mut broadcaster, SessionState::Idle)
        .await
        .expect("no session key");
    broadcaster.send(CastCommand::StartBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Active).await;

    listener
        .send(CastCommand::SubmitListenerKey {
            key: key.as_str().to_string(),
        })
        .await;
    wait_for_state(&mut listener, SessionState::Active).await;
    wait_for_count(&mut broadcaster, 1).await;

    // The listener hangs up; the broadcast itself stays live
    listener.send(CastCommand::StopBroadcast).await;
    wait_for_state(&mut listener, SessionState::Idle).await;
    wait_for_count(&mut broadcaster, 0).await;

    broadcaster.send(CastCommand::RequestState).await;
    let event = wait_for(&mut broadcaster, "broadcaster snapshot", |e| {
        matches!(e, CastEvent::StateChanged { .. })
    })
    .await;
    assert!(matches!(
        event,
        CastEvent::StateChanged {
            state: SessionState::Active,
            ..
        }
    ));

    broadcaster.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test]
async fn restored_listener_rejoins_the_next_session() {
    let dir = tempdir().unwrap();
    let key_path = dir.path().join("keys.toml");
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    let mut broadcaster = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut broadcaster, SessionState::Idle).await;
    broadcaster
        .send(CastCommand::SubmitBroadcasterSecret {
            secret: SECRET.to_string(),
        })
        .await;
    let key = wait_for_state(&mut broadcaster, SessionState::Idle)
        .await
        .expect("no session key");
    broadcaster.send(CastCommand::StartBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Active).await;

    // A listener authorizes, connects, then goes away
    let mut listener = spawn_instance(&key_path, &hub, &bus);
    wait_for_state(&mut listener, SessionState::Idle).await;
    listener
        .send(CastCommand::SubmitListenerKey {
            key: key.as_str().to_string(),
        })
        .await;
    wait_for_state(&mut listener, SessionState::Active).await;
    wait_for_count(&mut broadcaster, 1).await;
    listener.shutdown().await;
    wait_for_count(&mut broadcaster, 0).await;

    // A fresh instance restores the authorization from disk and arms
    // itself without dialing
    let (sink, frames) = CountingSink::new();
    let mut restored = spawn_instance_with_sink(&key_path, &hub, &bus, Arc::new(sink));
    let restored_key = wait_for_state(&mut restored, SessionState::AwaitingAuthorization).await;
    assert_eq!(restored_key, Some(key));

    // The next session start pulls it in automatically
    broadcaster.send(CastCommand::StopBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Idle).await;
    broadcaster.send(CastCommand::StartBroadcast).await;
    wait_for_state(&mut broadcaster, SessionState::Active).await;
    wait_for_state(&mut restored, SessionState::Active).await;

    let mut heard = false;
    for _ in 0..50 {
        if frames.load(Ordering::Relaxed) > 0 {
            heard = true;
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert!(heard, "no audio frames reached the restored listener");

    broadcaster.shutdown().await;
    restored.shutdown().await;
}
