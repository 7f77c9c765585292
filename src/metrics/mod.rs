use crate::clock::{Clock, MonotonicClock};
use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use log::info;
pub mod process;
mod sampler;
use process::{Occupancy, ProcStatSensor, ProcessId, ProcessRegistry, SampleBuffer, UsageSensor};
use sampler::Sampler;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Everything the sampler thread shares with control callers.
pub(crate) struct Shared {
    pub(crate) registry: ProcessRegistry,
    pub(crate) buffer: SampleBuffer,
    pub(crate) sensor: Arc<dyn UsageSensor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) interval: Duration,
}

/// Owns the registry, the sample buffer and the recurring sampler.
///
/// Sampling runs exactly while at least one process is registered. Dropping
/// the profiler stops the sampler and unmaps the buffer.
pub struct Profiler {
    shared: Arc<Shared>,
    sampler: Sampler,
    config: ProfilerConfig,
}

impl Profiler {
    /// A profiler reading procfs on `CLOCK_MONOTONIC`.
    pub fn new(config: ProfilerConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(ProcStatSensor::new()), Arc::new(MonotonicClock))
    }

    pub fn with_parts(
        config: ProfilerConfig,
        sensor: Arc<dyn UsageSensor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let buffer = SampleBuffer::from_config(&config)?;
        info!(
            "profiler ready: {} samples ({} bytes mapped), interval {}ms",
            buffer.capacity(),
            buffer.mapping_len(),
            config.interval_ms
        );

        Ok(Self {
            shared: Arc::new(Shared {
                registry: ProcessRegistry::new(),
                buffer,
                sensor,
                clock,
                interval: config.interval(),
            }),
            sampler: Sampler::default(),
            config,
        })
    }

    /// Starts monitoring `pid`; the first registration starts the sampler.
    pub fn register(&self, pid: ProcessId) -> Result<()> {
        if self.shared.registry.contains(pid) {
            return Err(ProfilerError::AlreadyRegistered(pid));
        }
        if !self.shared.sensor.is_alive(pid) {
            info!("Unable to find process info [{}]", pid);
            return Err(ProfilerError::ProcessNotFound(pid));
        }

        let mut sampler = self.sampler.lock();
        let occupancy = self.shared.registry.insert(pid)?;
        self.shared.sensor.watch(pid);
        info!("registering task with pid={}", pid);

        if occupancy == Occupancy::Occupied {
            if let Err(err) = sampler.start(&self.shared) {
                let _ = self.shared.registry.remove(pid);
                self.shared.sensor.forget(pid);
                return Err(ProfilerError::Spawn(err));
            }
        }
        Ok(())
    }

    /// Stops monitoring `pid`. Removing the last process stops the sampler
    /// and waits for a tick in flight, so no sample lands after this returns.
    pub fn unregister(&self, pid: ProcessId) -> Result<()> {
        let mut sampler = self.sampler.lock();
        let occupancy = self.shared.registry.remove(pid)?;
        self.shared.sensor.forget(pid);
        info!("Deregister pid {}", pid);

        if occupancy == Occupancy::Vacated {
            sampler.stop();
        }
        Ok(())
    }

    pub fn registered(&self) -> Vec<ProcessId> {
        self.shared.registry.snapshot()
    }

    pub fn is_registered(&self, pid: ProcessId) -> bool {
        self.shared.registry.contains(pid)
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.lock().is_running()
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.shared.buffer
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Stops sampling and forgets every process. Idempotent.
    pub fn shutdown(&self) {
        let mut sampler = self.sampler.lock();
        sampler.stop();
        for pid in self.shared.registry.clear() {
            info!("removing process with pid {}", pid);
            self.shared.sensor.forget(pid);
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profiler")
            .field("registered", &self.registered())
            .field("sampling", &self.is_sampling())
            .field("buffer", &self.shared.buffer)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SensorError;
    use process::UsageSnapshot;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct AliveSet {
        alive: Mutex<HashSet<ProcessId>>,
        watched: Mutex<Vec<ProcessId>>,
    }

    impl UsageSensor for AliveSet {
        fn is_alive(&self, pid: ProcessId) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn watch(&self, pid: ProcessId) {
            self.watched.lock().unwrap().push(pid);
        }

        fn read(&self, pid: ProcessId) -> std::result::Result<UsageSnapshot, SensorError> {
            if self.is_alive(pid) {
                Ok(UsageSnapshot::default())
            } else {
                Err(SensorError::NotFound(pid))
            }
        }
    }

    fn profiler(alive: &[u32]) -> Profiler {
        profiler_with(alive).0
    }

    fn profiler_with(alive: &[u32]) -> (Profiler, Arc<AliveSet>) {
        let sensor = Arc::new(AliveSet::default());
        sensor
            .alive
            .lock()
            .unwrap()
            .extend(alive.iter().copied().map(ProcessId));
        let config = ProfilerConfig {
            interval_ms: 1_000,
            buffer_bytes: 4 * process::SAMPLE_SIZE,
            shm_name: "profiler-unit".into(),
        };
        let profiler = Profiler::with_parts(
            config,
            Arc::clone(&sensor) as Arc<dyn UsageSensor>,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        (profiler, sensor)
    }

    #[test]
    fn sampler_follows_occupancy() {
        let profiler = profiler(&[1, 2]);
        assert!(!profiler.is_sampling());

        profiler.register(ProcessId(1)).unwrap();
        assert!(profiler.is_sampling());
        profiler.register(ProcessId(2)).unwrap();
        assert!(profiler.is_sampling());

        profiler.unregister(ProcessId(1)).unwrap();
        assert!(profiler.is_sampling());
        profiler.unregister(ProcessId(2)).unwrap();
        assert!(!profiler.is_sampling());
    }

    #[test]
    fn only_successful_registration_primes_the_sensor() {
        let (profiler, sensor) = profiler_with(&[1, 2]);
        profiler.register(ProcessId(1)).unwrap();
        let _ = profiler.register(ProcessId(1));
        let _ = profiler.register(ProcessId(9));
        profiler.register(ProcessId(2)).unwrap();
        assert_eq!(*sensor.watched.lock().unwrap(), vec![ProcessId(1), ProcessId(2)]);
    }

    #[test]
    fn registration_errors_leave_state_alone() {
        let profiler = profiler(&[1]);
        assert!(matches!(
            profiler.register(ProcessId(99)),
            Err(ProfilerError::ProcessNotFound(ProcessId(99)))
        ));
        assert!(!profiler.is_sampling());

        profiler.register(ProcessId(1)).unwrap();
        assert!(matches!(
            profiler.register(ProcessId(1)),
            Err(ProfilerError::AlreadyRegistered(ProcessId(1)))
        ));
        assert_eq!(profiler.registered(), vec![ProcessId(1)]);

        assert!(matches!(
            profiler.unregister(ProcessId(5)),
            Err(ProfilerError::NotRegistered(ProcessId(5)))
        ));
        assert!(profiler.is_registered(ProcessId(1)));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ProfilerConfig {
            interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            Profiler::with_parts(config, Arc::new(AliveSet::default()), Arc::new(ManualClock::new(0))),
            Err(ProfilerError::Config(_))
        ));

        let config = ProfilerConfig {
            buffer_bytes: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(
            Profiler::with_parts(config, Arc::new(AliveSet::default()), Arc::new(ManualClock::new(0))),
            Err(ProfilerError::Config(_))
        ));
        assert!(matches!(
            Profiler::new(ProfilerConfig {
                buffer_bytes: usize::MAX,
                ..Default::default()
            }),
            Err(ProfilerError::Config(_))
        ));
    }

    #[test]
    fn shutdown_clears_everything() {
        let profiler = profiler(&[1, 2]);
        profiler.register(ProcessId(1)).unwrap();
        profiler.register(ProcessId(2)).unwrap();
        profiler.shutdown();
        assert!(profiler.registered().is_empty());
        assert!(!profiler.is_sampling());
        profiler.shutdown();
    }
}
