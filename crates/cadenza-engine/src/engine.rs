use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{EngineConfig, GraphConfig};
use crate::error::RouterError;
use crate::router::{CycleOutcome, Router};
use crate::session::{PlayState, Session, TrackId};
use crate::sync::Gate;
use crate::time::EngineProcessTimeInfo;

const NO_TRACK: u32 = u32::MAX;

/// Engine-wide flags shared with every payload.
#[derive(Debug)]
pub struct EngineState {
    sample_rate: AtomicU32,
    block_size: AtomicU32,
    run: AtomicBool,
    cycle_running: AtomicBool,
    panic: AtomicBool,
    remaining_latency_preroll: AtomicU32,
    clip_editor_track: AtomicU32,
    cycle_gate: Gate,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            sample_rate: AtomicU32::new(config.sample_rate),
            block_size: AtomicU32::new(config.block_size),
            run: AtomicBool::new(false),
            cycle_running: AtomicBool::new(false),
            panic: AtomicBool::new(false),
            remaining_latency_preroll: AtomicU32::new(0),
            clip_editor_track: AtomicU32::new(NO_TRACK),
            cycle_gate: Gate::default(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_block_size(&self, block_size: u32) {
        self.block_size.store(block_size, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, run: bool) {
        self.run.store(run, Ordering::SeqCst);
    }

    pub fn cycle_running(&self) -> bool {
        self.cycle_running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cycle_running(&self, running: bool) {
        self.cycle_running.store(running, Ordering::SeqCst);
        if !running {
            self.cycle_gate.notify_all();
        }
    }

    /// Parks until no cycle is in flight.
    pub fn wait_cycle_idle(&self) {
        self.cycle_gate.wait_until(|| !self.cycle_running());
    }

    pub fn panic_requested(&self) -> bool {
        self.panic.load(Ordering::Relaxed)
    }

    /// Sends all-notes-off on every event output during the next block.
    pub fn request_panic(&self) {
        self.panic.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_panic(&self) {
        self.panic.store(false, Ordering::Relaxed);
    }

    /// Track whose piano roll receives the clip editor's manual key presses.
    pub fn clip_editor_track(&self) -> Option<TrackId> {
        match self.clip_editor_track.load(Ordering::Relaxed) {
            NO_TRACK => None,
            id => Some(TrackId(id)),
        }
    }

    pub fn set_clip_editor_track(&self, track: Option<TrackId>) {
        let raw = track.map_or(NO_TRACK, |track| track.0);
        self.clip_editor_track.store(raw, Ordering::Relaxed);
    }

    pub fn remaining_latency_preroll(&self) -> u32 {
        self.remaining_latency_preroll.load(Ordering::Acquire)
    }

    pub(crate) fn set_remaining_latency_preroll(&self, frames: u32) {
        self.remaining_latency_preroll
            .store(frames, Ordering::Release);
    }
}

/// What happened while processing one audio block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub cycles: u32,
    pub skipped: u32,
    pub processed: usize,
    pub preroll_frames: u32,
    pub rolled_frames: u32,
}

impl BlockReport {
    fn record(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Completed { processed, .. } => {
                self.cycles += 1;
                self.processed += processed;
            }
            CycleOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Block driver sitting between an audio callback and the router.
pub struct AudioEngine {
    router: Router,
}

impl AudioEngine {
    pub fn new(session: Session, config: GraphConfig) -> Self {
        Self {
            router: Router::new(Arc::new(RwLock::new(session)), config),
        }
    }

    /// Compiles the session and starts the graph threads.
    pub fn start(&self) -> Result<(), RouterError> {
        self.router.recalc_graph(false)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn session(&self) -> &Arc<RwLock<Session>> {
        self.router.session()
    }

    /// Processes `nframes` frames.
    ///
    /// When the transport starts rolling, playback is held back by the
    /// graph's worst route latency. The block is split so that no initial
    /// node's route starts rolling in the middle of a cycle.
    pub fn process(&self, nframes: u32) -> BlockReport {
        let services = self.router.scheduler().services();
        let engine = &services.engine;
        let transport = &services.transport;
        let mut report = BlockReport::default();

        match transport.play_state() {
            PlayState::RollRequested if engine.remaining_latency_preroll() == 0 => {
                transport.set_play_state(PlayState::Rolling);
                engine.set_remaining_latency_preroll(self.router.max_route_playback_latency());
            }
            PlayState::PauseRequested => transport.set_play_state(PlayState::Stopped),
            _ => {}
        }

        let generation = self.router.scheduler().generation();
        let mut remaining = nframes;
        let mut offset = 0u32;
        while engine.remaining_latency_preroll() > 0 && remaining > 0 {
            let preroll = engine.remaining_latency_preroll();
            let mut frames = remaining.min(preroll);
            for &index in generation.initial() {
                let route = generation.node(index).route_playback_latency();
                if route < preroll {
                    frames = frames.min(preroll - route);
                }
            }

            let time = EngineProcessTimeInfo::new(transport.playhead(), offset, frames);
            report.record(self.router.start_cycle(time));
            engine.set_remaining_latency_preroll(preroll - frames);
            report.preroll_frames += frames;
            remaining -= frames;
            offset += frames;
        }

        if remaining > 0 {
            let time = EngineProcessTimeInfo::new(transport.playhead(), offset, remaining);
            report.record(self.router.start_cycle(time));
        }

        if transport.is_rolling() && engine.remaining_latency_preroll() == 0 {
            transport.advance(remaining);
            report.rolled_frames = remaining;
        }
        engine.clear_panic();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_editor_track_round_trips_through_the_sentinel() {
        let state = EngineState::new(&EngineConfig::default());
        assert_eq!(state.clip_editor_track(), None);
        state.set_clip_editor_track(Some(TrackId(4)));
        assert_eq!(state.clip_editor_track(), Some(TrackId(4)));
        state.set_clip_editor_track(None);
        assert_eq!(state.clip_editor_track(), None);
    }

    #[test]
    fn idle_wait_returns_once_the_cycle_ends() {
        let state = Arc::new(EngineState::new(&EngineConfig::default()));
        state.set_cycle_running(true);
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.wait_cycle_idle())
        };
        state.set_cycle_running(false);
        waiter.join().expect("waiter panicked");
    }
}
