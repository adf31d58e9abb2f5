//! Peercall CLI - loopback call demo
//!
//! Runs both ends of a call in one process over the in-memory relay and
//! transport, printing every lifecycle event. Useful for watching the
//! handshake, probe, and teardown flow with `RUST_LOG=peercall=debug`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local party name
    #[arg(short, long, env = "PEERCALL_IDENTITY", default_value = "alice")]
    identity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback call between two in-process managers
    Loopback {
        /// Remote party name
        #[arg(long, default_value = "bob")]
        peer: String,

        /// Place a video call instead of audio-only
        #[arg(long)]
        video: bool,

        /// How long to keep the call up, in seconds
        #[arg(long, default_value = "2")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Loopback {
            peer,
            video,
            duration,
        } => run_loopback(&cli.identity, &peer, video, duration).await,
    }
}

async fn run_loopback(local: &str, peer: &str, video: bool, duration: u64) -> Result<()> {
    let local_id = PartyId::from_string_repr(local)?;
    let peer_id = PartyId::from_string_repr(peer)?;
    let call_type = if video { CallType::Video } else { CallType::Audio };

    tracing::info!(local = %local_id, peer = %peer_id, "starting loopback call");
    let relay = MemoryRelay::new();
    let hub = MemoryHub::new();

    let caller = CallManager::new(
        Arc::new(relay.attach(local_id.clone())),
        Arc::new(hub.clone()),
        Arc::new(SyntheticSource::new()),
        CallConfig::default(),
    );
    let callee = CallManager::new(
        Arc::new(relay.attach(peer_id.clone())),
        Arc::new(hub.clone()),
        Arc::new(SyntheticSource::new()),
        CallConfig::default(),
    );

    let caller_watch = watch_events(local.to_string(), caller.events());
    let callee_watch = watch_events(peer.to_string(), callee.events());

    println!("{local} calling {peer} ({call_type:?})");
    let (caller_stream, callee_stream) = tokio::join!(
        caller.start_call(peer_id.clone(), call_type, Role::Initiator),
        callee.start_call(local_id.clone(), call_type, Role::Responder),
    );
    let caller_stream = caller_stream?;
    callee_stream?;
    println!(
        "{local} local stream ready: audio={} video={}",
        caller_stream.has_audio(),
        caller_stream.has_video()
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    if caller.send_connection_test().await {
        println!("{local} sent connectivity probe");
    }

    tokio::time::sleep(Duration::from_secs(duration)).await;

    println!("{local} hanging up");
    caller.end_call().await;
    callee.end_call().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    caller_watch.abort();
    callee_watch.abort();
    println!("done");
    Ok(())
}

fn watch_events(
    who: String,
    mut events: tokio::sync::broadcast::Receiver<CallEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::RemoteStream { stream } => {
                    println!(
                        "[{who}] remote stream arrived: audio={} video={}",
                        stream.has_audio(),
                        stream.has_video()
                    );
                }
                CallEvent::Error { kind, reason } => {
                    println!("[{who}] error ({kind:?}): {reason}");
                }
                CallEvent::ProbeRtt { rtt } => {
                    println!("[{who}] probe round trip: {rtt:?}");
                }
                CallEvent::Ended => {
                    println!("[{who}] call ended");
                }
            }
        }
    })
}
