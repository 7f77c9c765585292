use super::process::{Occupancy, Sample, UsageTotals};
use super::Shared;
use crate::clock::NANOS_PER_MILLI;
use log::{debug, info, warn};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wakes a sleeping worker and tells it not to reschedule.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    raised: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn raise(&self) {
        *self.lock() = true;
        self.cvar.notify_all();
    }

    pub(crate) fn is_raised(&self) -> bool {
        *self.lock()
    }

    /// Sleeps for `timeout` unless raised first. Returns whether it was raised.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cvar
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

pub(crate) struct Worker {
    signal: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn join(self) {
        self.signal.raise();
        if self.thread.join().is_err() {
            warn!("sampler thread panicked");
        }
    }
}

#[derive(Default)]
pub(crate) enum SamplerState {
    #[default]
    Stopped,
    Running(Worker),
}

impl SamplerState {
    /// A worker that stopped itself is not running even before it is joined.
    pub(crate) fn is_running(&self) -> bool {
        match self {
            SamplerState::Stopped => false,
            SamplerState::Running(worker) => !worker.signal.is_raised(),
        }
    }

    /// Spawns the recurring tick. No-op while a live worker exists; a worker
    /// that stopped itself is reaped first.
    pub(crate) fn start(&mut self, shared: &Arc<Shared>) -> io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.stop();

        let signal = Arc::new(StopSignal::default());
        let thread = {
            let shared = Arc::clone(shared);
            let signal = Arc::clone(&signal);
            thread::Builder::new()
                .name("profring-sampler".into())
                .spawn(move || run(shared, signal))?
        };
        *self = SamplerState::Running(Worker { signal, thread });
        Ok(())
    }

    /// Blocks until any in-flight tick finished. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let SamplerState::Running(worker) = std::mem::take(self) {
            worker.join();
        }
    }
}

/// Lifecycle of the single recurring sampling task.
///
/// Register and unregister hold this lock across their registry mutation, so
/// start and stop follow occupancy transitions in order. The worker thread
/// never takes it.
#[derive(Default)]
pub(crate) struct Sampler {
    state: Mutex<SamplerState>,
}

impl Sampler {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run(shared: Arc<Shared>, signal: Arc<StopSignal>) {
    info!("sampler started, interval {:?}", shared.interval);
    let mut last_tick_ns = shared.clock.now_ns();

    while !signal.wait(shared.interval) {
        tick(&shared, &signal, &mut last_tick_ns);
    }

    info!("sampler stopped");
}

/// One collection pass: aggregates every registered process into a sample
/// and appends it.
pub(crate) fn tick(shared: &Shared, signal: &StopSignal, last_tick_ns: &mut u64) -> Sample {
    let mut totals = UsageTotals::default();

    for pid in shared.registry.snapshot() {
        match shared.sensor.read(pid) {
            Ok(usage) => totals.add(&usage),
            Err(err) => {
                warn!("evicting pid {}: {}", pid, err);
                shared.sensor.forget(pid);
                let occupancy = shared.registry.lazy_evict(pid, || signal.raise());
                if occupancy == Occupancy::Vacated {
                    info!("last monitored process is gone, stopping after this tick");
                }
            }
        }
    }

    let now_ns = shared.clock.now_ns();
    let elapsed_ns = now_ns.saturating_sub(*last_tick_ns);
    let utilization = totals.cpu_utilization(elapsed_ns).unwrap_or_else(|| {
        warn!("wallclock did not advance since the last tick, reporting 0% cpu");
        0
    });

    let sample = totals.into_sample(now_ns / NANOS_PER_MILLI, utilization);
    shared.buffer.append(sample);
    *last_tick_ns = now_ns;

    debug!(
        "{}, {}, {}, {} ({} processes, num_samples {}/{})",
        sample.timestamp,
        sample.total_minor_faults,
        sample.total_major_faults,
        sample.cpu_utilization_percent,
        totals.processes,
        shared.buffer.len(),
        shared.buffer.capacity()
    );
    sample
}
