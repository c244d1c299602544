use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cadenza_engine::graph::compiler;
use cadenza_engine::session::{
    DelayProcessor, GainProcessor, PluginLayout, PluginSlot, PortId, Session, TrackType,
};
use cadenza_engine::{AudioEngine, BlockReport, RouterStats, TrackId};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(author, version, about = "Headless driver for the Cadenza processing graph")]
struct Cli {
    /// JSON file with engine and graph settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the demo session and run it for a number of blocks.
    Run(RunArgs),
    /// Check whether routing one track's fader into another track is allowed.
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = 64)]
    blocks: u32,
    /// Override the worker thread count.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    tracks: Option<usize>,
    /// Latency of the lookahead insert on the first track, in frames.
    #[arg(long)]
    latency: Option<u32>,
    /// Start the transport before the first block.
    #[arg(long)]
    roll: bool,
}

#[derive(Args)]
struct ValidateArgs {
    /// Index of the source track in the demo session.
    #[arg(long)]
    from: usize,
    /// Index of the destination track in the demo session.
    #[arg(long)]
    to: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => execute_run(config, args),
        Commands::Validate(args) => execute_validate(config, args),
    }
}

/// Buses, audio tracks with inserts and sends, and two event tracks.
fn demo_session(config: &CliConfig) -> Result<Session> {
    let mut session = Session::new(&config.engine);
    let drums = session.add_track("Drum bus", TrackType::AudioBus);
    let gain = PluginLayout::stereo_effect().with_control("gain", 0.8, 0.0, 2.0);

    for index in 0..config.tracks {
        let track = session.add_track(&format!("Audio {}", index + 1), TrackType::Audio);
        if index == 0 && config.latency > 0 {
            session.add_plugin(
                track,
                PluginSlot::Insert,
                "Lookahead",
                &PluginLayout::stereo_effect(),
                Box::new(DelayProcessor::new(config.latency)),
            )?;
        }
        session.add_plugin(track, PluginSlot::Insert, "Gain", &gain, Box::new(GainProcessor))?;
        session.add_send(track, drums, 0.5, index % 2 == 1)?;
    }
    session.add_track("Keys", TrackType::Instrument);
    session.add_track("Lead", TrackType::Midi);
    Ok(session)
}

#[derive(Serialize)]
struct RunSummary {
    blocks: u32,
    totals: BlockReport,
    playhead: u64,
    stats: RouterStats,
}

fn execute_run(mut config: CliConfig, args: RunArgs) -> Result<()> {
    if let Some(workers) = args.workers {
        config.graph.workers = Some(workers);
    }
    if let Some(tracks) = args.tracks {
        config.tracks = tracks;
    }
    if let Some(latency) = args.latency {
        config.latency = latency;
    }

    let session = demo_session(&config)?;
    let transport = Arc::clone(session.transport());
    let engine = AudioEngine::new(session, config.graph.clone());
    engine.start().context("failed to start the processing graph")?;
    tracing::info!(
        nodes = engine.router().stats().nodes,
        latency = engine.router().max_route_playback_latency(),
        "demo session compiled"
    );

    if args.roll {
        transport.request_roll();
    }
    let mut totals = BlockReport::default();
    for _ in 0..args.blocks {
        let report = engine.process(config.engine.block_size);
        totals.cycles += report.cycles;
        totals.skipped += report.skipped;
        totals.processed += report.processed;
        totals.preroll_frames += report.preroll_frames;
        totals.rolled_frames += report.rolled_frames;
    }

    let summary = RunSummary {
        blocks: args.blocks,
        totals,
        playhead: transport.playhead(),
        stats: engine.router().stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[derive(Serialize)]
struct Validation {
    src: PortId,
    dest: PortId,
    valid: bool,
    error: Option<String>,
}

fn execute_validate(config: CliConfig, args: ValidateArgs) -> Result<()> {
    let session = demo_session(&config)?;
    let track_at = |index: usize| -> Result<TrackId> {
        match session.tracks().get(index) {
            Some(track) => Ok(track.id()),
            None => bail!("no track at index {index}, the session has {}", session.tracks().len()),
        }
    };
    let from = track_at(args.from)?;
    let to = track_at(args.to)?;

    let src = session
        .track(from)
        .and_then(|track| track.channel())
        .and_then(|channel| channel.fader().io().outputs().first().map(|port| port.id()))
        .with_context(|| format!("track {} has no fader output", args.from))?;
    let dest = session
        .track(to)
        .and_then(|track| track.processor())
        .and_then(|processor| processor.stereo_in())
        .map(|ports| ports.l.id())
        .with_context(|| format!("track {} has no audio input", args.to))?;

    let result = compiler::validate_with_connection(&session, src, dest);
    let validation = Validation {
        src,
        dest,
        valid: result.is_ok(),
        error: result.err().map(|err| err.to_string()),
    };
    println!("{}", serde_json::to_string_pretty(&validation)?);
    Ok(())
}
