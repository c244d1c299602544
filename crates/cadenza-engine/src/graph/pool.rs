use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::scheduler::Scheduler;
use crate::error::GraphError;

/// The OS threads executing a [`Scheduler`]: `workers` plain workers plus
/// one graph main thread.
///
/// Dropping the pool terminates and joins every thread.
pub struct GraphThreads {
    scheduler: Arc<Scheduler>,
    handles: Vec<JoinHandle<()>>,
}

impl GraphThreads {
    pub fn start(scheduler: Arc<Scheduler>, workers: usize, name_prefix: &str) -> Result<Self, GraphError> {
        // permits left over from a previous run
        while scheduler.trigger.try_wait() {}
        while scheduler.callback_start.try_wait() {}
        scheduler.terminate.store(false, Ordering::SeqCst);
        scheduler.num_threads.store(workers, Ordering::SeqCst);

        let mut pool = Self {
            scheduler,
            handles: Vec::with_capacity(workers + 1),
        };
        for index in 0..workers {
            pool.spawn(format!("{name_prefix}-{index}"), false)?;
        }
        pool.spawn(format!("{name_prefix}-main"), true)?;

        tracing::info!(workers, "graph threads started");
        Ok(pool)
    }

    fn spawn(&mut self, name: String, main: bool) -> Result<(), GraphError> {
        let scheduler = Arc::clone(&self.scheduler);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            flush_denormals();
            scheduler.alive.fetch_add(1, Ordering::SeqCst);
            if main {
                scheduler.run_main();
            } else {
                scheduler.run_worker();
            }
            scheduler.alive.fetch_sub(1, Ordering::SeqCst);
        });

        match spawned {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(err) => {
                tracing::error!(?err, spawned = self.handles.len(), "failed to spawn graph thread");
                // the caller drops `self`, which joins what was started
                self.scheduler
                    .num_threads
                    .store(self.handles.len(), Ordering::SeqCst);
                Err(GraphError::ThreadSpawn(err.to_string()))
            }
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Spawned threads, the main graph thread included.
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops and joins every thread. Must not be called while a cycle is in
    /// flight.
    pub fn terminate(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let scheduler = &self.scheduler;
        scheduler.terminate.store(true, Ordering::SeqCst);
        scheduler.idle_gate.notify_all();

        // every thread parks on either the trigger or the cycle start
        for _ in 0..self.handles.len() {
            scheduler.trigger.post();
        }
        scheduler.callback_start.post();

        for handle in self.handles.drain(..) {
            if let Err(err) = handle.join() {
                tracing::error!(?err, "failed to join graph thread");
            }
        }
        scheduler.idle_thread_cnt.store(0, Ordering::SeqCst);
        tracing::info!("graph threads terminated");
    }
}

impl Drop for GraphThreads {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Sets flush-to-zero on the calling thread. Graph threads call it once
/// before their first cycle.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn flush_denormals() {
    const FLUSH_TO_ZERO: u32 = 1 << 15;
    const DENORMALS_ARE_ZERO: u32 = 1 << 6;
    let mut mxcsr: u32 = 0;
    // SAFETY: only the FTZ/DAZ bits of this thread's MXCSR change.
    unsafe {
        std::arch::asm!("stmxcsr [{}]", in(reg) &mut mxcsr, options(nostack, preserves_flags));
        mxcsr |= FLUSH_TO_ZERO | DENORMALS_ARE_ZERO;
        std::arch::asm!("ldmxcsr [{}]", in(reg) &mxcsr, options(nostack, preserves_flags));
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_denormals() {
    const FLUSH_TO_ZERO: u64 = 1 << 24;
    let mut fpcr: u64;
    // SAFETY: only the FZ bit of this thread's FPCR changes.
    unsafe {
        std::arch::asm!("mrs {}, fpcr", out(reg) fpcr, options(nomem, nostack, preserves_flags));
        fpcr |= FLUSH_TO_ZERO;
        std::arch::asm!("msr fpcr, {}", in(reg) fpcr, options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn flush_denormals() {}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::session::tests::services;

    fn wait_for(mut ready: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn terminate_joins_parked_workers_and_main_thread() {
        let scheduler = Arc::new(Scheduler::new(services()));
        let mut pool = GraphThreads::start(Arc::clone(&scheduler), 3, "test-dsp").expect("spawn");
        assert_eq!(pool.thread_count(), 4);

        wait_for(|| scheduler.alive_threads() == 4 && scheduler.idle_threads() == 3);
        pool.terminate();
        assert_eq!(pool.thread_count(), 0);
        assert_eq!(scheduler.alive_threads(), 0);
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn graph_threads_flush_subnormal_results() {
        let flushed = thread::spawn(|| {
            flush_denormals();
            std::hint::black_box(f32::MIN_POSITIVE) * std::hint::black_box(0.5)
        })
        .join()
        .expect("thread panicked");
        assert_eq!(flushed, 0.0);
    }

    #[test]
    fn zero_workers_still_runs_a_main_thread() {
        let scheduler = Arc::new(Scheduler::new(services()));
        let pool = GraphThreads::start(Arc::clone(&scheduler), 0, "test-dsp").expect("spawn");
        assert_eq!(pool.thread_count(), 1);
        drop(pool);
        assert_eq!(scheduler.alive_threads(), 0);
    }
}
