use std::sync::Arc;

use cadenza_engine::session::{
    DelayProcessor, PlayState, PluginLayout, PluginSlot, RecordingLog, RecordingManager, Session, TrackType,
};
use cadenza_engine::{AudioEngine, EngineConfig, GraphConfig};

fn session(block_size: u32) -> Session {
    Session::new(&EngineConfig {
        sample_rate: 48_000,
        block_size,
    })
}

fn config() -> GraphConfig {
    GraphConfig {
        workers: Some(2),
        ..GraphConfig::default()
    }
}

#[test]
fn roll_waits_out_the_latency_preroll() {
    let mut session = session(64);
    let track = session.add_track("Drums", TrackType::Audio);
    session
        .add_plugin(track, PluginSlot::Insert, "lookahead", &PluginLayout::stereo_effect(), Box::new(DelayProcessor::new(100)))
        .expect("insert");

    let engine = AudioEngine::new(session, config());
    engine.start().expect("starts");
    let transport = Arc::clone(engine.session().read().transport());
    transport.request_roll();

    let first = engine.process(64);
    assert_eq!(transport.play_state(), PlayState::Rolling);
    assert_eq!(first.preroll_frames, 64);
    assert_eq!(first.rolled_frames, 0);
    assert_eq!(transport.playhead(), 0);

    let second = engine.process(64);
    assert_eq!(second.preroll_frames, 36);
    assert_eq!(second.rolled_frames, 28);
    assert_eq!(second.cycles, 2);
    assert_eq!(transport.playhead(), 28);

    let third = engine.process(64);
    assert_eq!(third.preroll_frames, 0);
    assert_eq!(third.cycles, 1);
    assert_eq!(transport.playhead(), 92);
}

#[test]
fn stopped_transport_keeps_the_playhead() {
    let engine = AudioEngine::new(session(128), config());
    engine.start().expect("starts");
    for _ in 0..4 {
        let report = engine.process(128);
        assert_eq!(report.cycles, 1);
        assert_eq!(report.skipped, 0);
    }
    assert_eq!(engine.session().read().transport().playhead(), 0);
}

#[test]
fn armed_track_records_around_the_loop_point() {
    let log = Arc::new(RecordingLog::new());
    let mut session = session(512);
    session.set_recording_manager(Arc::clone(&log) as Arc<dyn RecordingManager>);
    let track = session.add_track("Vox", TrackType::Audio);
    session
        .track(track)
        .and_then(|track| track.processor())
        .expect("processor")
        .set_armed(true);

    let transport = Arc::clone(session.transport());
    transport.set_loop(0, 200);
    transport.set_loop_enabled(true);
    transport.set_recording(true);
    transport.request_roll();

    let engine = AudioEngine::new(session, config());
    engine.start().expect("starts");
    engine.process(512);

    let recorded: Vec<(u64, u32)> = log
        .segments(track)
        .iter()
        .map(|segment| (segment.g_start_frame, segment.nframes))
        .collect();
    assert_eq!(recorded, vec![(0, 200), (0, 312)]);
    assert_eq!(transport.playhead(), 112);
}

#[test]
fn panic_request_clears_after_one_block() {
    let engine = AudioEngine::new(session(64), config());
    engine.start().expect("starts");
    let state = Arc::clone(engine.session().read().engine());
    state.request_panic();
    engine.process(64);
    assert!(!state.panic_requested());
}
