use std::sync::Arc;

use cadenza_engine::router::{ControlPortChange, CycleOutcome, Router, SkipReason};
use cadenza_engine::session::{
    DelayProcessor, PluginIo, PluginLayout, PluginProcessor, PluginSlot, Session, TrackType,
};
use cadenza_engine::{EngineConfig, EngineProcessTimeInfo, GraphConfig, MidiEvent};
use parking_lot::{Mutex, RwLock};
use proptest::prelude::*;
use rand::Rng;

fn config(workers: usize) -> GraphConfig {
    GraphConfig {
        workers: Some(workers),
        ..GraphConfig::default()
    }
}

fn session() -> Session {
    Session::new(&EngineConfig {
        sample_rate: 48_000,
        block_size: 128,
    })
}

fn block() -> EngineProcessTimeInfo {
    EngineProcessTimeInfo::new(0, 0, 128)
}

struct Tagged {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl PluginProcessor for Tagged {
    fn process(&mut self, _time: &EngineProcessTimeInfo, _io: PluginIo<'_>) {
        self.log.lock().push(self.tag);
    }
}

#[test]
fn chained_inserts_run_once_each_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut session = session();
    let track = session.add_track("Guitar", TrackType::Audio);
    for tag in ["first", "second", "third"] {
        let processor = Tagged {
            tag,
            log: Arc::clone(&log),
        };
        session
            .add_plugin(track, PluginSlot::Insert, tag, &PluginLayout::stereo_effect(), Box::new(processor))
            .expect("insert");
    }

    let router = Router::new(Arc::new(RwLock::new(session)), config(3));
    router.recalc_graph(false).expect("compiles");
    for _ in 0..4 {
        log.lock().clear();
        assert!(router.start_cycle(block()).is_completed());
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }
}

#[test]
fn every_node_is_processed_once_per_cycle() {
    let mut session = session();
    let bus = session.add_track("Bus", TrackType::AudioBus);
    for name in ["Kick", "Snare", "Hats"] {
        let track = session.add_track(name, TrackType::Audio);
        session.add_send(track, bus, 0.5, false).expect("send");
    }
    session.add_track("Keys", TrackType::Instrument);
    session.add_track("Lead", TrackType::Midi);

    let router = Router::new(Arc::new(RwLock::new(session)), config(4));
    router.recalc_graph(false).expect("compiles");
    let nodes = router.scheduler().generation().len();
    assert!(nodes > 0);

    for _ in 0..16 {
        match router.start_cycle(block()) {
            CycleOutcome::Completed { processed, .. } => assert_eq!(processed, nodes),
            other => panic!("unexpected {other:?}"),
        }
    }
    let stats = router.stats();
    assert_eq!(stats.cycles, 16);
    assert!(!stats.invariant_broken);
}

#[test]
fn busy_router_drops_the_cycle_without_touching_state() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut session = session();
    let track = session.add_track("Guitar", TrackType::Audio);
    let processor = Tagged {
        tag: "insert",
        log: Arc::clone(&log),
    };
    session
        .add_plugin(track, PluginSlot::Insert, "insert", &PluginLayout::stereo_effect(), Box::new(processor))
        .expect("insert");
    let out = session
        .track(track)
        .and_then(|track| track.processor())
        .and_then(|processor| processor.stereo_out())
        .map(|ports| Arc::clone(&ports.l))
        .expect("stereo out");

    let router = Router::new(Arc::new(RwLock::new(session)), config(1));
    router.recalc_graph(false).expect("compiles");
    assert!(router.start_cycle(block()).is_completed());
    let processed = router.scheduler().last_processed();
    let services = router.scheduler().services();
    let bpm = services.tempo.bpm();
    log.lock().clear();
    out.audio()[0] = 0.5;

    let guard = router.lock_graph_access();
    router.queue_control_port_change(ControlPortChange::Bpm(90.0)).expect("room");
    assert_eq!(router.start_cycle(block()), CycleOutcome::Skipped(SkipReason::Busy));
    assert_eq!(router.stats().skipped_cycles, 1);
    assert!(!services.engine.cycle_running());
    assert_eq!(services.tempo.bpm(), bpm);
    assert_eq!(router.scheduler().last_processed(), processed);
    assert!(log.lock().is_empty());
    assert_eq!(out.audio()[0], 0.5);
    drop(guard);

    assert!(router.start_cycle(block()).is_completed());
    assert_eq!(services.tempo.bpm(), 90.0);
    assert_eq!(*log.lock(), vec!["insert"]);
    assert_eq!(out.audio()[0], 0.0);
}

#[test]
fn manual_press_reaches_the_clip_editor_track_once() {
    let mut session = session();
    let keys = session.add_track("Keys", TrackType::Midi);
    let other = session.add_track("Lead", TrackType::Midi);
    let midi_out = |session: &Session, track| {
        session
            .track(track)
            .and_then(|track| track.processor())
            .and_then(|processor| processor.midi_out())
            .map(Arc::clone)
            .expect("midi out")
    };
    let (keys_out, other_out) = (midi_out(&session, keys), midi_out(&session, other));

    let router = Router::new(Arc::new(RwLock::new(session)), config(2));
    router.recalc_graph(false).expect("compiles");
    router.scheduler().services().engine.set_clip_editor_track(Some(keys));

    let note = MidiEvent::note_on(0, 60, 100, 3);
    router.queue_manual_press(note);
    assert!(router.start_cycle(block()).is_completed());
    assert_eq!(*keys_out.events(), vec![note]);
    assert!(other_out.events().is_empty());

    assert!(router.start_cycle(block()).is_completed());
    assert!(keys_out.events().is_empty());
}

#[test]
fn soft_recalc_keeps_route_latencies() {
    let mut session = session();
    let track = session.add_track("Vocals", TrackType::Audio);
    session
        .add_plugin(track, PluginSlot::Insert, "delay", &PluginLayout::stereo_effect(), Box::new(DelayProcessor::new(256)))
        .expect("insert");

    let router = Router::new(Arc::new(RwLock::new(session)), config(2));
    router.recalc_graph(false).expect("compiles");
    assert_eq!(router.max_route_playback_latency(), 256);

    let routes = || -> Vec<u32> {
        router
            .scheduler()
            .generation()
            .nodes()
            .iter()
            .map(|node| node.route_playback_latency())
            .collect()
    };
    router.recalc_graph(true).expect("soft");
    let first = routes();
    router.recalc_graph(true).expect("soft");
    assert_eq!(first, routes());
    assert_eq!(router.max_route_playback_latency(), 256);
}

#[test]
fn hard_recalc_picks_up_new_tracks() {
    let router = Router::new(Arc::new(RwLock::new(session())), config(2));
    router.recalc_graph(false).expect("compiles");
    let before = router.scheduler().generation().len();

    router.session().write().add_track("Pad", TrackType::Instrument);
    router.recalc_graph(false).expect("recompiles");
    let after = router.scheduler().generation().len();
    assert!(after > before);
    assert!(router.start_cycle(block()).is_completed());
}

#[test]
fn random_tempo_changes_are_clamped() {
    let router = Router::new(Arc::new(RwLock::new(session())), config(1));
    router.recalc_graph(false).expect("compiles");
    let tempo = Arc::clone(router.session().read().tempo());

    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        let bpm = rng.gen_range(0.0f32..1_000.0);
        router.queue_control_port_change(ControlPortChange::Bpm(bpm)).expect("room");
        assert!(router.start_cycle(block()).is_completed());
        assert_eq!(tempo.bpm(), bpm.clamp(40.0, 420.0));
    }
}

#[test]
fn shutdown_joins_workers_and_main_thread() {
    let router = Router::new(Arc::new(RwLock::new(session())), config(3));
    router.recalc_graph(false).expect("compiles");
    assert_eq!(router.stats().threads, 4);

    router.shutdown();
    assert_eq!(router.stats().threads, 0);
    assert_eq!(router.scheduler().alive_threads(), 0);
    assert_eq!(router.start_cycle(block()), CycleOutcome::Skipped(SkipReason::NotRunning));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn bus_topologies_process_every_node(
        tracks in 1usize..6,
        sends in proptest::collection::vec((0usize..6, 0usize..6), 0..8),
    ) {
        let mut session = session();
        let ids: Vec<_> = (0..tracks)
            .map(|i| session.add_track(&format!("Bus {i}"), TrackType::AudioBus))
            .collect();
        for (a, b) in sends {
            if a < b && b < tracks {
                session.add_send(ids[a], ids[b], 1.0, a % 2 == 0).expect("forward send");
            }
        }

        let router = Router::new(Arc::new(RwLock::new(session)), config(2));
        router.recalc_graph(false).expect("compiles");
        let generation = router.scheduler().generation();
        prop_assert!(generation.is_valid());
        let nodes = generation.len();
        for _ in 0..3 {
            prop_assert_eq!(
                router.start_cycle(block()),
                CycleOutcome::Completed { processed: nodes, global_offset: 0 }
            );
        }
    }
}
