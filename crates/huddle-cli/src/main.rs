//! Huddle CLI: in-process call and theater rehearsals, drift diagnostics.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{sleep, timeout, Instant};

use huddle_call::{CallCoordinator, CallEvent, CallListener, SessionPhase};
use huddle_common::{CallConfig, CallKind, TheaterConfig};
use huddle_media::{FacingMode, LoopbackCapture, LoopbackTransport};
use huddle_signal::{MemoryStore, SharedStore};
use huddle_theater::{
    follow, DriftAction, DriftPolicy, SimulatedClock, TheaterCoordinator, ViewerSync,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle call and theater tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a two-party call end to end over an in-memory store
    Call {
        /// Room to call in
        #[arg(short, long, default_value = "lounge")]
        room: String,

        /// Place a video call instead of audio-only
        #[arg(long)]
        video: bool,

        /// Switch the caller to the rear camera once connected
        #[arg(long)]
        switch_camera: bool,

        /// How long to stay connected before hanging up
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },

    /// Host a theater session with one following viewer
    Theater {
        /// Seconds of host playback to simulate
        #[arg(short, long, default_value_t = 2)]
        seconds: u64,

        /// Position the host seeks to before playing
        #[arg(long, default_value_t = 30.0)]
        start_at: f64,
    },

    /// Show which correction a viewer would apply
    Drift {
        /// Local player position in seconds
        #[arg(long)]
        local: f64,

        /// Host position in seconds
        #[arg(long)]
        broadcast: f64,

        /// The session is paused
        #[arg(long)]
        paused: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    huddle_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Call {
            room,
            video,
            switch_camera,
            hold_ms,
        } => {
            let kind = if video { CallKind::Video } else { CallKind::Audio };
            runtime()?.block_on(rehearse_call(
                &room,
                kind,
                switch_camera,
                Duration::from_millis(hold_ms),
            ))?;
        }
        Command::Theater { seconds, start_at } => {
            runtime()?.block_on(rehearse_theater(Duration::from_secs(seconds), start_at))?;
        }
        Command::Drift {
            local,
            broadcast,
            paused,
        } => {
            let policy = DriftPolicy::from_config(&TheaterConfig::from_env());
            let action = if paused {
                policy.decide_paused(local, broadcast)
            } else {
                policy.decide(local, broadcast)
            };
            match action {
                DriftAction::None => println!("in sync (drift {:+.2}s)", broadcast - local),
                DriftAction::Seek { to } => println!("seek to {:.2}s", to),
                DriftAction::Nudge { rate, duration } => {
                    println!("play at {:.2}x for {:?}", rate, duration)
                }
            }
        }
        Command::Version => {
            println!("huddle {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn participant(store: &Arc<MemoryStore>, config: &CallConfig) -> CallCoordinator {
    CallCoordinator::with_platform(
        store.clone() as Arc<dyn SharedStore>,
        Arc::new(LoopbackTransport::new()),
        Arc::new(LoopbackCapture::new()),
        config.clone(),
    )
}

async fn next_event(
    listener: &mut CallListener,
    who: &str,
    pred: impl Fn(&CallEvent) -> bool,
) -> Result<CallEvent> {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = timeout(remaining, listener.next())
            .await
            .map_err(|_| anyhow!("{} saw no matching call event", who))?
            .ok_or_else(|| anyhow!("{}'s listener stopped", who))?;
        if pred(&event) {
            return Ok(event);
        }
    }
}

async fn wait_connected(coordinator: &CallCoordinator, call_id: &str, who: &str) -> Result<()> {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match coordinator.sessions().phase(call_id) {
            Some(SessionPhase::Connected) => return Ok(()),
            Some(SessionPhase::Ended(reason)) => bail!("{}'s session ended: {:?}", who, reason),
            _ if Instant::now() >= deadline => bail!("{} never connected", who),
            _ => sleep(Duration::from_millis(10)).await,
        }
    }
}

async fn rehearse_call(
    room: &str,
    kind: CallKind,
    switch_camera: bool,
    hold: Duration,
) -> Result<()> {
    let config = CallConfig::from_env();
    let store = Arc::new(MemoryStore::new());
    let alice = participant(&store, &config);
    let bob = participant(&store, &config);
    let mut alice_events = alice.listen(room, "alice");
    let mut bob_events = bob.listen(room, "bob");

    let call_id = alice.start_call(room, "Alice", "alice", kind).await?;
    println!("alice is calling ({:?}), call {}", kind, call_id);

    next_event(&mut bob_events, "bob", |e| matches!(e, CallEvent::Incoming(_))).await?;
    println!("bob sees the incoming call");

    bob.answer_call(room, &call_id, "bob")
        .await?
        .context("call stopped ringing before bob answered")?;
    if let CallEvent::SetupFailed { error, .. } = next_event(&mut alice_events, "alice", |e| {
        matches!(e, CallEvent::MediaStarted { .. } | CallEvent::SetupFailed { .. })
    })
    .await?
    {
        bail!("alice could not start media: {}", error);
    }

    wait_connected(&alice, &call_id, "alice").await?;
    wait_connected(&bob, &call_id, "bob").await?;
    for (who, coordinator) in [("alice", &alice), ("bob", &bob)] {
        if let Some(snapshot) = coordinator.sessions().snapshot(&call_id) {
            println!(
                "{}: {:?}, link {}, {} remote tracks",
                who,
                snapshot.phase,
                snapshot.link_id,
                snapshot
                    .remote_stream
                    .as_ref()
                    .map_or(0, |s| s.tracks().len())
            );
        }
    }

    if switch_camera {
        if kind.has_video() {
            let stream = alice
                .sessions()
                .switch_camera(&call_id, FacingMode::Environment)
                .await?;
            let label = stream.video_track().map(|t| t.label().to_string());
            println!("alice switched camera: {}", label.unwrap_or_default());
        } else {
            println!("audio call, no camera to switch");
        }
    }

    sleep(hold).await;
    alice.end_call(room, &call_id).await?;
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while bob.sessions().has_session(&call_id) {
        if Instant::now() >= deadline {
            bail!("bob's session outlived the call");
        }
        sleep(Duration::from_millis(10)).await;
    }
    println!("call {} ended on both sides", call_id);

    alice.shutdown();
    bob.shutdown();
    Ok(())
}

async fn rehearse_theater(playback: Duration, start_at: f64) -> Result<()> {
    const ROOM: &str = "cinema";

    let config = TheaterConfig::from_env();
    let store = Arc::new(MemoryStore::new()) as Arc<dyn SharedStore>;
    let theater = TheaterCoordinator::new(store, config.clone());

    let session = theater
        .create_session(ROOM, "host", "Host", "https://example.invalid/feature.mp4", "Feature")
        .await?;
    theater.join(ROOM, &session.id, "viewer").await?;
    println!("theater session {} open", session.id);

    let sync = ViewerSync::new(SimulatedClock::default(), DriftPolicy::from_config(&config));
    let viewer = tokio::spawn(follow(
        theater.watch(ROOM, &session.id),
        sync,
        config.follow_interval,
    ));

    theater.seek(ROOM, &session.id, "host", start_at).await?;
    theater.play(ROOM, &session.id, "host", start_at).await?;
    let started = Instant::now();
    while started.elapsed() < playback {
        sleep(Duration::from_millis(250)).await;
        let position = start_at + started.elapsed().as_secs_f64();
        theater.heartbeat(ROOM, &session.id, "host", position).await?;
    }
    theater.end_session(ROOM, &session.id, "host").await?;

    let clock = timeout(EVENT_TIMEOUT, viewer)
        .await
        .context("viewer did not stop after the session ended")??
        .into_clock();
    println!(
        "viewer made {} seeks ({:?}) and {} rate changes",
        clock.seeks.len(),
        clock.seeks,
        clock.rate_changes.len()
    );
    Ok(())
}
