use super::{ProcessId, UsageSnapshot};
use crate::error::SensorError;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

/// Source of per-process counters.
///
/// `read` reports the change since the previous `watch` or `read` of the same
/// pid. A pid that is not watched reads as an all-zero delta and stays
/// unwatched.
pub trait UsageSensor: Send + Sync {
    /// Whether `pid` names a live process. Has no effect on counters.
    fn is_alive(&self, pid: ProcessId) -> bool;

    /// Starts counting `pid` from now.
    fn watch(&self, _pid: ProcessId) {}

    fn read(&self, pid: ProcessId) -> Result<UsageSnapshot, SensorError>;

    /// Drops whatever state is kept for `pid`.
    fn forget(&self, _pid: ProcessId) {}
}

/// Cumulative counters as found in `/proc/<pid>/stat`, CPU times in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatCounters {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
}

/// Linux sensor: liveness through `sysinfo`, counters from procfs.
pub struct ProcStatSensor {
    system: Mutex<System>,
    baselines: Mutex<HashMap<ProcessId, StatCounters>>,
    proc_root: PathBuf,
    nanos_per_tick: u64,
}

impl Default for ProcStatSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcStatSensor {
    pub fn new() -> Self {
        let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let ticks_per_sec = if ticks_per_sec > 0 { ticks_per_sec as u64 } else { 100 };
        Self {
            system: Mutex::new(System::new()),
            baselines: Mutex::new(HashMap::new()),
            proc_root: PathBuf::from("/proc"),
            nanos_per_tick: 1_000_000_000 / ticks_per_sec,
        }
    }

    fn baselines(&self) -> MutexGuard<'_, HashMap<ProcessId, StatCounters>> {
        self.baselines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read_counters(&self, pid: ProcessId) -> Result<StatCounters, SensorError> {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        let content = std::fs::read_to_string(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SensorError::NotFound(pid),
            _ => SensorError::Io { pid, source },
        })?;
        parse_stat(pid, &content)
    }

    fn to_snapshot(&self, delta: StatCounters) -> UsageSnapshot {
        UsageSnapshot {
            minor_faults: delta.minor_faults,
            major_faults: delta.major_faults,
            user_time: delta.utime_ticks.saturating_mul(self.nanos_per_tick),
            sys_time: delta.stime_ticks.saturating_mul(self.nanos_per_tick),
        }
    }
}

impl UsageSensor for ProcStatSensor {
    fn is_alive(&self, pid: ProcessId) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let sys_pid = pid.to_sysinfo();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system
            .process(sys_pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    fn watch(&self, pid: ProcessId) {
        match self.read_counters(pid) {
            Ok(counters) => {
                self.baselines().insert(pid, counters);
            }
            Err(err) => debug!("not priming pid {}: {}", pid, err),
        }
    }

    fn read(&self, pid: ProcessId) -> Result<UsageSnapshot, SensorError> {
        let current = self.read_counters(pid)?;
        let previous = match self.baselines().get_mut(&pid) {
            Some(baseline) => std::mem::replace(baseline, current),
            // forgotten or never watched: report nothing and keep no state
            None => current,
        };

        // Counters only shrink when the pid was recycled; count from zero then.
        let previous = if current.utime_ticks < previous.utime_ticks
            || current.stime_ticks < previous.stime_ticks
            || current.minor_faults < previous.minor_faults
            || current.major_faults < previous.major_faults
        {
            debug!("counters of pid {} went backwards, resetting baseline", pid);
            StatCounters::default()
        } else {
            previous
        };

        Ok(self.to_snapshot(StatCounters {
            minor_faults: current.minor_faults - previous.minor_faults,
            major_faults: current.major_faults - previous.major_faults,
            utime_ticks: current.utime_ticks - previous.utime_ticks,
            stime_ticks: current.stime_ticks - previous.stime_ticks,
        }))
    }

    fn forget(&self, pid: ProcessId) {
        self.baselines().remove(&pid);
    }
}

/// Parses the fields after `(comm)`:
/// state ppid pgrp session tty_nr tpgid flags minflt cminflt majflt cmajflt utime stime ...
pub fn parse_stat(pid: ProcessId, content: &str) -> Result<StatCounters, SensorError> {
    let rest = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or(SensorError::Malformed {
            pid,
            reason: "missing ')' after comm",
        })?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 13 {
        return Err(SensorError::Malformed {
            pid,
            reason: "too few fields",
        });
    }
    if matches!(fields[0], "Z" | "X" | "x") {
        return Err(SensorError::NotFound(pid));
    }

    let field = |idx: usize, reason: &'static str| {
        fields[idx]
            .parse::<u64>()
            .map_err(|_| SensorError::Malformed { pid, reason })
    };

    Ok(StatCounters {
        minor_faults: field(7, "failed to parse minflt")?,
        major_faults: field(9, "failed to parse majflt")?,
        utime_ticks: field(11, "failed to parse utime")?,
        stime_ticks: field(12, "failed to parse stime")?,
    })
}
