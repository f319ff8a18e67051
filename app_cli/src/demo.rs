//! Scripted walkthrough: both roles in one process.
//!
//! Runs a broadcaster instance and a listener instance side by side on the
//! shared hub and notice bus, walks a full session and prints every event
//! each side sees.

use crate::adapter::CastAdapter;
use crate::describe;
use anyhow::{bail, Context, Result};
use audio_io::{MonitorSink, SyntheticCapture};
use cast_core::{CastEvent, Role, SessionState};
use key_store::KeyStore;
use notifier::NoticeBus;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use transport::LoopbackHub;

/// Print the instance's events until one matches
async fn drive(
    label: &str,
    adapter: &mut CastAdapter,
    description: &str,
    predicate: impl Fn(&CastEvent) -> bool,
) -> Result<CastEvent> {
    timeout(Duration::from_secs(5), async {
        loop {
            match adapter.recv_event().await {
                Some(event) => {
                    println!("[{}] {}", label, describe(&event));
                    if predicate(&event) {
                        return Ok(event);
                    }
                }
                None => bail!("[{}] handler exited early", label),
            }
        }
    })
    .await
    .with_context(|| format!("demo timed out waiting for {}", description))?
}

fn is_state(event: &CastEvent, wanted: SessionState) -> bool {
    matches!(event, CastEvent::StateChanged { state, .. } if *state == wanted)
}

pub async fn run(secret: &str, broadcaster_store: KeyStore, listener_store: KeyStore) -> Result<()> {
    println!("aircast demo: one broadcaster, one listener, one process");
    println!();

    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();

    let mut broadcaster = CastAdapter::new(
        secret,
        broadcaster_store,
        hub.clone(),
        bus.clone(),
        Arc::new(SyntheticCapture::new()),
        Arc::new(MonitorSink::new()),
    );
    let mut listener = CastAdapter::new(
        secret,
        listener_store,
        hub,
        bus,
        Arc::new(SyntheticCapture::new()),
        Arc::new(MonitorSink::new()),
    );

    // Both instances report their restored state first
    drive("broadcaster", &mut broadcaster, "broadcaster snapshot", |e| {
        matches!(e, CastEvent::StateChanged { .. })
    })
    .await?;
    drive("listener", &mut listener, "listener snapshot", |e| {
        matches!(e, CastEvent::StateChanged { .. })
    })
    .await?;

    // The broadcaster authorizes; the sticky session key comes back
    println!();
    println!("--- broadcaster authorizes with the secret");
    broadcaster.submit_secret(secret).await?;
    let event = drive("broadcaster", &mut broadcaster, "broadcaster authorization", |e| {
        matches!(
            e,
            CastEvent::StateChanged {
                role: Role::Broadcaster,
                ..
            }
        )
    })
    .await?;
    let key = match event {
        CastEvent::StateChanged {
            session_key: Some(key),
            ..
        } => key,
        _ => bail!("authorization snapshot carried no session key"),
    };

    println!();
    println!("--- broadcaster goes live");
    broadcaster.start().await?;
    drive("broadcaster", &mut broadcaster, "broadcast to go live", |e| {
        is_state(e, SessionState::Active)
    })
    .await?;

    // The listener joins with the key the broadcaster would have shared
    // out of band
    println!();
    println!("--- listener joins with key {}", key);
    listener.submit_key(key.as_str()).await?;
    drive("listener", &mut listener, "listener to connect", |e| {
        is_state(e, SessionState::Active)
    })
    .await?;
    drive("broadcaster", &mut broadcaster, "listener count", |e| {
        matches!(e, CastEvent::ListenerCountChanged { count } if *count > 0)
    })
    .await?;

    println!();
    println!("--- live audio flowing (synthetic tone), letting it run...");
    sleep(Duration::from_secs(3)).await;

    println!();
    println!("--- broadcaster ends the session");
    broadcaster.stop().await?;
    drive("broadcaster", &mut broadcaster, "broadcaster teardown", |e| {
        is_state(e, SessionState::Idle)
    })
    .await?;
    drive("listener", &mut listener, "listener to settle", |e| {
        is_state(e, SessionState::Idle) || is_state(e, SessionState::AwaitingAuthorization)
    })
    .await?;

    broadcaster.shutdown().await?;
    listener.shutdown().await?;
    println!();
    println!("Demo complete. The session key {} is sticky: run again and", key);
    println!("the same key comes back until you /rotate it.");

    Ok(())
}
