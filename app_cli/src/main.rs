//! CLI application for aircast

mod adapter;
mod commands;
mod demo;

use adapter::CastAdapter;
use anyhow::Result;
use audio_io::{MonitorSink, SyntheticCapture};
use cast_core::{CastEvent, Role, SessionState};
use clap::Parser;
use commands::UserCommand;
use key_store::KeyStore;
use log::{debug, info, warn};
use notifier::NoticeBus;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use transport::LoopbackHub;

/// aircast - one-to-many live audio with a shared session key
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Broadcaster secret this instance authorizes against
    #[clap(long, default_value = "1234")]
    secret: String,

    /// Key file path (defaults to the per-user config directory)
    #[clap(long)]
    store: Option<PathBuf>,

    /// Run both roles in one process and walk through a full session
    #[clap(long)]
    demo: bool,
}

fn store_for(path: &Option<PathBuf>) -> KeyStore {
    match path {
        Some(path) => KeyStore::with_file(path),
        None => KeyStore::new(),
    }
}

/// One line of status for a session event
fn describe(event: &CastEvent) -> String {
    match event {
        CastEvent::StateChanged {
            role,
            state,
            session_key,
        } => match (*role, *state) {
            (Role::Broadcaster, SessionState::Idle) => match session_key {
                Some(key) => format!("Authorized. Session key {}. Use /start to go live.", key),
                None => "Idle.".to_string(),
            },
            (Role::Broadcaster, SessionState::Publishing) => "Starting broadcast...".to_string(),
            (Role::Broadcaster, SessionState::Active) => {
                "Broadcasting, waiting for listeners...".to_string()
            }
            (Role::Listener, SessionState::AwaitingAuthorization) => {
                "Authorized as listener, waiting for the session to start...".to_string()
            }
            (Role::Listener, SessionState::Dialing) => "Connecting to the broadcast...".to_string(),
            (Role::Listener, SessionState::Active) => "Connected, playing...".to_string(),
            (Role::Listener, SessionState::Idle) => "Disconnected.".to_string(),
            (_, SessionState::Stopped) => "Stopping...".to_string(),
            (_, SessionState::Failed(condition)) => format!("Failed: {}.", condition),
            (_, state) => format!("State: {}.", state),
        },
        CastEvent::ConditionReported(condition) => format!("Problem: {}.", condition),
        CastEvent::ListenerCountChanged { count } => {
            if *count == 1 {
                "1 listener connected.".to_string()
            } else {
                format!("{} listeners connected.", count)
            }
        }
    }
}

fn print_help() {
    println!("Available commands:");
    for (usage, what) in commands::help_lines() {
        println!("  {:<18} {}", usage, what);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
        debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("Starting aircast CLI");

    if args.demo {
        return demo::run(
            &args.secret,
            store_for(&args.store),
            store_for(&args.store),
        )
        .await;
    }

    // One instance: its own transport on a fresh hub, its own notice bus.
    // Instances meet when they share these, which the demo mode shows.
    let hub = LoopbackHub::new();
    let bus = NoticeBus::new();
    let mut adapter = CastAdapter::new(
        &args.secret,
        store_for(&args.store),
        hub,
        bus,
        Arc::new(SyntheticCapture::new()),
        Arc::new(MonitorSink::new()),
    );

    println!("aircast. /help lists commands, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Stdin closed, exiting");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match commands::parse(&line) {
                    Ok(UserCommand::Secret(secret)) => adapter.submit_secret(&secret).await?,
                    Ok(UserCommand::Key(key)) => adapter.submit_key(&key).await?,
                    Ok(UserCommand::Start) => adapter.start().await?,
                    Ok(UserCommand::Stop) => adapter.stop().await?,
                    Ok(UserCommand::Rotate) => adapter.rotate_key().await?,
                    Ok(UserCommand::Status) => adapter.request_state().await?,
                    Ok(UserCommand::Help) => print_help(),
                    Ok(UserCommand::Quit) => break,
                    Err(e) => println!("{}", e),
                }
            }

            event = adapter.recv_event() => {
                match event {
                    Some(event) => println!("{}", describe(&event)),
                    None => {
                        warn!("Session handler exited");
                        break;
                    }
                }
            }
        }
    }

    if adapter.shutdown().await.is_err() {
        debug!("Handler already gone at shutdown");
    }

    info!("Exiting aircast CLI");

    Ok(())
}
