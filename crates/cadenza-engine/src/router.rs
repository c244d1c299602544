//! Per-session cycle driver.
//!
//! The router admits one cycle at a time through `graph_access`, applies
//! queued tempo changes, runs the tempo nodes and hands the rest of the
//! cycle to the graph threads. Topology changes go through
//! [`Router::recalc_graph`], which never overlaps a running cycle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rtrb::{Consumer, Producer, RingBuffer};
use serde::Serialize;

use crate::config::GraphConfig;
use crate::error::{GraphError, RouterError};
use crate::graph::{compiler, GraphThreads, Scheduler};
use crate::midi::MidiEvent;
use crate::session::{Session, TempoPorts};
use crate::sync::Semaphore;
use crate::time::{BeatUnit, EngineProcessTimeInfo};

/// Tempo change queued from a non-audio thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlPortChange {
    Bpm(f32),
    BeatsPerBar(u32),
    BeatUnit(BeatUnit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Another cycle or a graph recalculation holds `graph_access`.
    Busy,
    NotRunning,
    EmptyGraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleOutcome {
    Completed { processed: usize, global_offset: u32 },
    Skipped(SkipReason),
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub nodes: usize,
    pub threads: usize,
    pub max_route_playback_latency: u32,
    pub invariant_broken: bool,
}

/// Holds `graph_access` until dropped.
pub struct GraphAccessGuard<'a> {
    access: &'a Semaphore,
}

impl Drop for GraphAccessGuard<'_> {
    fn drop(&mut self) {
        self.access.post();
    }
}

pub struct Router {
    session: Arc<RwLock<Session>>,
    config: GraphConfig,
    scheduler: Arc<Scheduler>,
    threads: Mutex<Option<GraphThreads>>,
    started: AtomicBool,
    graph_access: Semaphore,
    max_route_playback_latency: AtomicU32,
    tempo_ports: Option<TempoPorts>,
    changes_tx: Mutex<Producer<ControlPortChange>>,
    changes_rx: Mutex<Consumer<ControlPortChange>>,
    cycles: AtomicU64,
    skipped: AtomicU64,
}

impl Router {
    /// Creates an idle router. Nothing runs until the first
    /// `recalc_graph(false)` compiles the session and starts the threads.
    pub fn new(session: Arc<RwLock<Session>>, config: GraphConfig) -> Self {
        let (services, tempo_ports) = {
            let session = session.read();
            let tempo_ports = session
                .track(session.tempo_track())
                .and_then(|track| track.tempo_ports().cloned());
            (session.services(), tempo_ports)
        };
        let (changes_tx, changes_rx) = RingBuffer::new(config.control_ring_capacity.max(1));
        Self {
            session,
            config,
            scheduler: Arc::new(Scheduler::new(services)),
            threads: Mutex::new(None),
            started: AtomicBool::new(false),
            graph_access: Semaphore::new(1),
            max_route_playback_latency: AtomicU32::new(0),
            tempo_ports,
            changes_tx: Mutex::new(changes_tx),
            changes_rx: Mutex::new(changes_rx),
            cycles: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<RwLock<Session>> {
        &self.session
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn max_route_playback_latency(&self) -> u32 {
        self.max_route_playback_latency.load(Ordering::Acquire)
    }

    /// Blocks until `graph_access` is free and holds it. Cycles started
    /// meanwhile are skipped.
    pub fn lock_graph_access(&self) -> GraphAccessGuard<'_> {
        self.graph_access.wait();
        GraphAccessGuard {
            access: &self.graph_access,
        }
    }

    fn try_lock_graph_access(&self) -> Option<GraphAccessGuard<'_>> {
        self.graph_access.try_wait().then(|| GraphAccessGuard {
            access: &self.graph_access,
        })
    }

    /// Runs one cycle over `time`. Never blocks on admission: when the graph
    /// is busy or not running the cycle is dropped.
    pub fn start_cycle(&self, time: EngineProcessTimeInfo) -> CycleOutcome {
        let Some(_access) = self.try_lock_graph_access() else {
            return self.skip(SkipReason::Busy);
        };
        let engine = &self.scheduler.services().engine;
        if !self.started.load(Ordering::Acquire) || !engine.is_running() {
            return self.skip(SkipReason::NotRunning);
        }
        if self.scheduler.generation().is_empty() {
            return self.skip(SkipReason::EmptyGraph);
        }

        engine.set_cycle_running(true);
        let global_offset = self
            .max_route_playback_latency()
            .saturating_sub(engine.remaining_latency_preroll());

        self.apply_control_changes();
        self.scheduler.set_cycle(time);
        self.scheduler.process_tempo_nodes();
        self.scheduler.callback_start.post();
        self.scheduler.callback_done.wait();

        engine.set_cycle_running(false);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        CycleOutcome::Completed {
            processed: self.scheduler.last_processed(),
            global_offset,
        }
    }

    fn skip(&self, reason: SkipReason) -> CycleOutcome {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(?reason, "cycle skipped");
        CycleOutcome::Skipped(reason)
    }

    /// Queues a tempo change for the start of the next cycle.
    pub fn queue_control_port_change(&self, change: ControlPortChange) -> Result<(), RouterError> {
        self.changes_tx
            .lock()
            .push(change)
            .map_err(|_| RouterError::ControlRingFull)
    }

    /// Queues a clip editor key press. It reaches the track selected with
    /// `EngineState::set_clip_editor_track` on the next cycle, at
    /// `event.time` frames into that cycle.
    pub fn queue_manual_press(&self, event: MidiEvent) {
        self.scheduler.services().manual_press.queue_event(event);
    }

    fn apply_control_changes(&self) {
        let tempo = &self.scheduler.services().tempo;
        let mut changes = self.changes_rx.lock();
        while let Ok(change) = changes.pop() {
            match change {
                ControlPortChange::Bpm(bpm) => {
                    tempo.set_bpm(bpm);
                    if let Some(ports) = &self.tempo_ports {
                        ports.bpm.set_control(tempo.bpm());
                    }
                }
                ControlPortChange::BeatsPerBar(beats) => {
                    tempo.set_beats_per_bar(beats);
                    if let Some(ports) = &self.tempo_ports {
                        ports.beats_per_bar.set_control(tempo.beats_per_bar() as f32);
                    }
                }
                ControlPortChange::BeatUnit(unit) => {
                    tempo.set_beat_unit(unit);
                    if let Some(ports) = &self.tempo_ports {
                        ports.beat_unit.set_control(unit.value() as f32);
                    }
                }
            }
        }
    }

    /// Recomputes latencies (`soft`) or recompiles and swaps the whole graph.
    ///
    /// A hard recalculation pauses cycles, rebuilds from the session, and
    /// starts the graph threads the first time it succeeds. On error the
    /// live graph is left as it was.
    pub fn recalc_graph(&self, soft: bool) -> Result<(), RouterError> {
        if soft {
            if self.scheduler.invariant_broken() {
                return Err(GraphError::invariant("scheduler counters diverged, a hard rebuild is required").into());
            }
            let _access = self.lock_graph_access();
            let generation = self.scheduler.generation();
            generation.update_latencies()?;
            self.max_route_playback_latency
                .store(generation.max_route_playback_latency(), Ordering::Release);
            return Ok(());
        }

        let engine = Arc::clone(&self.scheduler.services().engine);
        let was_running = engine.is_running();
        engine.set_running(false);
        let _access = self.lock_graph_access();
        engine.wait_cycle_idle();

        let rebuilt = self.rebuild();
        match &rebuilt {
            Ok(()) => engine.set_running(true),
            Err(err) => {
                tracing::warn!(?err, "graph recalculation failed");
                engine.set_running(was_running);
            }
        }
        rebuilt
    }

    fn rebuild(&self) -> Result<(), RouterError> {
        let generation = {
            let session = self.session.read();
            compiler::setup(&session, self.config.drop_unnecessary_ports)?
        };
        if !generation.is_valid() {
            return Err(GraphError::Cycle.into());
        }
        generation.update_latencies()?;
        let max_latency = generation.max_route_playback_latency();
        let nodes = generation.len();

        self.scheduler.rechain(generation);
        self.max_route_playback_latency
            .store(max_latency, Ordering::Release);

        let mut threads = self.threads.lock();
        if threads.is_none() {
            let workers = self.config.resolved_workers();
            *threads = Some(GraphThreads::start(
                Arc::clone(&self.scheduler),
                workers,
                &self.config.thread_name_prefix,
            )?);
            self.started.store(true, Ordering::Release);
        }
        tracing::info!(nodes, max_latency, "graph rechained");
        Ok(())
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped_cycles: self.skipped.load(Ordering::Relaxed),
            nodes: self.scheduler.generation().len(),
            threads: self
                .threads
                .lock()
                .as_ref()
                .map_or(0, GraphThreads::thread_count),
            max_route_playback_latency: self.max_route_playback_latency(),
            invariant_broken: self.scheduler.invariant_broken(),
        }
    }

    /// Stops the graph threads. Later cycles are skipped until the next hard
    /// recalculation restarts them.
    pub fn shutdown(&self) {
        let _access = self.lock_graph_access();
        self.started.store(false, Ordering::Release);
        if let Some(mut threads) = self.threads.lock().take() {
            threads.terminate();
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}
