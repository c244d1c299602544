//! Cycle execution shared by the graph threads.
//!
//! Every node carries a countdown of unfinished parents. A thread that
//! finishes a node decrements its children and queues those that reach zero.
//! The thread that finishes the last terminal node reports the cycle done,
//! waits for the others to park, and seeds the next cycle once the router
//! starts it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::atomic::AtomicCell;

use super::generation::Generation;
use super::node::{NodeIndex, ProcessContext};
use crate::session::RuntimeServices;
use crate::sync::{Gate, Semaphore};
use crate::time::EngineProcessTimeInfo;

pub struct Scheduler {
    live: ArcSwap<Generation>,
    cycle: AtomicCell<EngineProcessTimeInfo>,
    services: RuntimeServices,
    pub(crate) trigger: Semaphore,
    pub(crate) callback_start: Semaphore,
    pub(crate) callback_done: Semaphore,
    pub(crate) idle_gate: Gate,
    terminal_refcnt: AtomicUsize,
    trigger_queue_size: AtomicUsize,
    pub(crate) idle_thread_cnt: AtomicUsize,
    processed: AtomicUsize,
    last_processed: AtomicUsize,
    /// Worker threads, not counting the main graph thread.
    pub(crate) num_threads: AtomicUsize,
    pub(crate) terminate: AtomicBool,
    invariant_broken: AtomicBool,
    pub(crate) alive: AtomicUsize,
}

impl Scheduler {
    pub fn new(services: RuntimeServices) -> Self {
        Self {
            live: ArcSwap::from_pointee(Generation::empty()),
            cycle: AtomicCell::new(EngineProcessTimeInfo::default()),
            services,
            trigger: Semaphore::new(0),
            callback_start: Semaphore::new(0),
            callback_done: Semaphore::new(0),
            idle_gate: Gate::default(),
            terminal_refcnt: AtomicUsize::new(0),
            trigger_queue_size: AtomicUsize::new(0),
            idle_thread_cnt: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            last_processed: AtomicUsize::new(0),
            num_threads: AtomicUsize::new(0),
            terminate: AtomicBool::new(false),
            invariant_broken: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
        }
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn generation(&self) -> Arc<Generation> {
        self.live.load_full()
    }

    /// Publishes a new generation. Callers guarantee no cycle is in flight.
    pub(crate) fn rechain(&self, generation: Generation) {
        self.terminal_refcnt
            .store(generation.terminal().len(), Ordering::SeqCst);
        self.trigger_queue_size.store(0, Ordering::SeqCst);
        self.live.store(Arc::new(generation));
        self.invariant_broken.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_cycle(&self, time: EngineProcessTimeInfo) {
        self.cycle.store(time);
    }

    pub fn cycle(&self) -> EngineProcessTimeInfo {
        self.cycle.load()
    }

    /// Nodes processed during the last completed cycle.
    pub fn last_processed(&self) -> usize {
        self.last_processed.load(Ordering::SeqCst)
    }

    pub fn invariant_broken(&self) -> bool {
        self.invariant_broken.load(Ordering::SeqCst)
    }

    pub fn idle_threads(&self) -> usize {
        self.idle_thread_cnt.load(Ordering::SeqCst)
    }

    pub fn alive_threads(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Runs the tempo nodes ahead of the bulk pass so every other node sees
    /// this cycle's tempo.
    pub(crate) fn process_tempo_nodes(&self) {
        let generation = self.live.load();
        let ctx = ProcessContext {
            time: self.cycle.load(),
            noroll: false,
            services: &self.services,
        };
        for &index in generation.tempo_nodes() {
            generation.node(index).payload.process(&ctx);
        }
    }

    fn all_parked(&self) -> bool {
        self.idle_thread_cnt.load(Ordering::SeqCst) >= self.num_threads.load(Ordering::SeqCst)
            || self.is_terminating()
    }

    fn seed(&self, generation: &Generation) {
        self.terminal_refcnt
            .store(generation.terminal().len(), Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        for &index in generation.initial() {
            self.trigger_queue_size.fetch_add(1, Ordering::SeqCst);
            if generation.trigger_queue.push(index).is_err() {
                self.trigger_queue_size.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(?index, "trigger queue full while seeding cycle");
            }
        }
    }

    /// Entry point of the main graph thread.
    pub(crate) fn run_main(&self) {
        self.idle_gate.wait_until(|| self.all_parked());
        self.callback_start.wait();
        if self.is_terminating() {
            return;
        }
        self.seed(&self.live.load_full());
        self.run_worker();
    }

    /// Pulls ready nodes until termination.
    pub(crate) fn run_worker(&self) {
        loop {
            let mut generation = self.live.load_full();
            let index = match generation.trigger_queue.pop() {
                Some(index) => {
                    // this thread has not decremented the queue size yet
                    let work = self.trigger_queue_size.load(Ordering::SeqCst);
                    let idle = self.idle_thread_cnt.load(Ordering::SeqCst);
                    for _ in 1..(idle + 1).min(work) {
                        self.trigger.post();
                    }
                    index
                }
                None => loop {
                    self.idle_thread_cnt.fetch_add(1, Ordering::SeqCst);
                    self.idle_gate.notify_all();
                    self.trigger.wait();
                    if self.is_terminating() {
                        return;
                    }
                    self.idle_thread_cnt.fetch_sub(1, Ordering::SeqCst);
                    generation = self.live.load_full();
                    if let Some(index) = generation.trigger_queue.pop() {
                        break index;
                    }
                },
            };
            self.trigger_queue_size.fetch_sub(1, Ordering::SeqCst);
            if !self.process_node(&generation, index) {
                return;
            }
        }
    }

    /// Runs one node and releases its children. Returns false when the
    /// thread should exit.
    fn process_node(&self, generation: &Generation, index: NodeIndex) -> bool {
        let node = generation.node(index);
        if !generation.is_tempo_node(index) {
            let services = &self.services;
            let cycle = self.cycle.load();
            let preroll = services.engine.remaining_latency_preroll();
            let route = node.route_playback_latency();
            if route < preroll {
                if node.terminal {
                    node.payload.process(&ProcessContext {
                        time: cycle,
                        noroll: true,
                        services,
                    });
                }
            } else {
                let mut time = cycle;
                if services.transport.is_rolling() {
                    let ahead = i64::from(route - preroll);
                    time.g_start_frame = services.transport.frames_add_frames(cycle.g_start_frame, ahead);
                    time.g_start_frame_w_offset = time.g_start_frame + u64::from(time.local_offset);
                }
                node.payload.process(&ProcessContext {
                    time,
                    noroll: false,
                    services,
                });
            }
        }
        self.processed.fetch_add(1, Ordering::SeqCst);

        if node.children.is_empty() {
            return self.reached_terminal();
        }
        for &child in &node.children {
            if generation.node(child).parent_finished() {
                self.trigger_queue_size.fetch_add(1, Ordering::SeqCst);
                if generation.trigger_queue.push(child).is_err() {
                    self.trigger_queue_size.fetch_sub(1, Ordering::SeqCst);
                    self.invariant_broken.store(true, Ordering::SeqCst);
                    tracing::error!(?child, "trigger queue overflow");
                }
            }
        }
        true
    }

    fn reached_terminal(&self) -> bool {
        if self.terminal_refcnt.fetch_sub(1, Ordering::SeqCst) != 1 {
            return true;
        }

        let pending = self.trigger_queue_size.load(Ordering::SeqCst);
        if pending != 0 {
            self.counters_diverged(pending);
        }

        self.last_processed
            .store(self.processed.load(Ordering::SeqCst), Ordering::SeqCst);
        self.callback_done.post();

        self.idle_gate.wait_until(|| self.all_parked());
        self.callback_start.wait();
        if self.is_terminating() {
            return false;
        }
        self.seed(&self.live.load_full());
        true
    }

    /// Debug builds abort, release builds flag the graph for a hard rebuild
    /// and let the cycle complete.
    fn counters_diverged(&self, pending: usize) {
        self.invariant_broken.store(true, Ordering::SeqCst);
        tracing::error!(pending, "trigger queue not drained at end of cycle");
        if cfg!(all(debug_assertions, not(test))) {
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, NodeKey, Processable};
    use crate::session::tests::services;
    use crate::session::PortId;
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Processable for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(&self, _ctx: &ProcessContext<'_>) {
            self.log.lock().push(self.name.clone());
        }
    }

    #[test]
    fn single_thread_runs_chain_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = GraphBuilder::new();
        let nodes: Vec<_> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                builder.add_node(
                    NodeKey::Port(PortId(i as u32)),
                    Arc::new(Recorder {
                        name: (*name).to_owned(),
                        log: Arc::clone(&log),
                    }),
                )
            })
            .collect();
        builder.connect(nodes[0], nodes[1]).expect("edge");
        builder.connect(nodes[1], nodes[2]).expect("edge");

        let scheduler = Arc::new(Scheduler::new(services()));
        scheduler.rechain(builder.finish());
        let main = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || scheduler.run_main())
        };

        scheduler.callback_start.post();
        scheduler.callback_done.wait();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.last_processed(), 3);

        scheduler.terminate.store(true, Ordering::SeqCst);
        scheduler.callback_start.post();
        main.join().expect("main graph thread panicked");
    }

    #[test]
    fn undrained_queue_still_reports_the_cycle_done() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = GraphBuilder::new();
        builder.add_node(
            NodeKey::Port(PortId(0)),
            Arc::new(Recorder {
                name: "only".to_owned(),
                log: Arc::clone(&log),
            }),
        );

        let scheduler = Arc::new(Scheduler::new(services()));
        scheduler.rechain(builder.finish());
        // a count with no queued node behind it
        scheduler.trigger_queue_size.store(1, Ordering::SeqCst);
        let main = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || scheduler.run_main())
        };

        scheduler.callback_start.post();
        scheduler.callback_done.wait();
        assert!(scheduler.invariant_broken());
        assert_eq!(*log.lock(), vec!["only"]);

        scheduler.terminate.store(true, Ordering::SeqCst);
        scheduler.callback_start.post();
        main.join().expect("main graph thread panicked");
    }
}
