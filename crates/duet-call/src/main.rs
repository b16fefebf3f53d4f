use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use duet_call::{
    spawn_call, CallConfig, CallNotice, CallSession, ConnectionState, FileSessionIdStore,
    HttpRelay, SyntheticMediaSource, WebRtcPeerFactory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duet", about = "Headless two-party call over the Duet relay")]
struct Cli {
    /// Relay base URL.
    #[arg(long, env = "DUET_RELAY_URL")]
    relay: Option<String>,

    /// Page address used when printing share links.
    #[arg(long, env = "DUET_BASE_URL")]
    base_url: Option<String>,

    /// Room to start or reuse. Defaults to the last room used.
    #[arg(long, short = 'r', conflicts_with = "join")]
    room: Option<String>,

    /// Join an existing room, by id or share link, instead of starting one.
    #[arg(long, short = 'j')]
    join: Option<String>,

    /// Capture audio only.
    #[arg(long)]
    audio_only: bool,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!("{:#}", err);
        eprintln!("duet: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = CallConfig::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let relay = HttpRelay::new(&config.relay_url).context("invalid relay url")?;
    let peers = WebRtcPeerFactory::new(config.ice_servers.clone());
    let media = SyntheticMediaSource::new().refuse_video(cli.audio_only);
    let mut session = CallSession::new(config, Arc::new(relay), Arc::new(peers), Arc::new(media));
    match FileSessionIdStore::default_location() {
        Ok(store) => session = session.with_identity(Arc::new(store)),
        Err(err) => warn!(error = %err, "not remembering room ids"),
    }

    let (handle, task) = spawn_call(session);
    tokio::spawn(print_notices(handle.subscribe()));
    tokio::spawn(print_states(handle.watch_state()));

    let started = match cli.join.as_deref() {
        Some(room) => handle.join(room).await,
        None => handle.start(cli.room.as_deref()).await,
    };
    if let Err(err) = started {
        anyhow::bail!("could not set up call: {}", err);
    }

    eprintln!("commands: m = mute, v = video, s = status, q = hang up");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match line.trim() {
            "m" => {
                let state = handle.toggle_mute().await?;
                println!("audio {}", if state.audio_muted { "muted" } else { "live" });
            }
            "v" => {
                let state = handle.toggle_video().await?;
                println!("video {}", if state.video_off { "off" } else { "on" });
            }
            "s" => println!("{:?}", handle.snapshot().await?),
            "q" => break,
            "" => {}
            other => eprintln!("unknown command: {}", other),
        }
    }

    handle.end().await?;
    drop(handle);
    task.join().await;
    Ok(())
}

async fn print_notices(mut notices: broadcast::Receiver<CallNotice>) {
    loop {
        match notices.recv().await {
            Ok(CallNotice::ShareLink { link, .. }) => println!("share: {}", link),
            Ok(CallNotice::Error(message)) => println!("error: {}", message),
            Ok(CallNotice::Warning(message)) => println!("warning: {}", message),
            Ok(CallNotice::RemoteMedia(state)) => println!(
                "peer: audio {}, video {}",
                if state.audio_muted { "muted" } else { "live" },
                if state.video_off { "off" } else { "on" }
            ),
            Ok(CallNotice::Ended { by_peer: true }) => println!("peer hung up"),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

async fn print_states(mut state: watch::Receiver<ConnectionState>) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        println!("state: {}", current);
    }
}
