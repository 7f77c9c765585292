mod circular_buffer;
mod history;
mod monitor;
mod registry;
mod shm;

pub use circular_buffer::*;
pub use history::*;
pub use monitor::*;
pub use registry::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Hash, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub fn to_sysinfo(self) -> sysinfo::Pid {
        sysinfo::Pid::from_u32(self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl FromStr for ProcessId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Self)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: ProcessId,
}

/// Counters accumulated by one process since its previous read.
///
/// CPU times are in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub user_time: u64,
    pub sys_time: u64,
}

impl UsageSnapshot {
    pub fn cpu_time(&self) -> u64 {
        self.user_time.saturating_add(self.sys_time)
    }
}

/// One aggregated record per tick, laid out exactly as a reader maps it.
///
/// `timestamp` is `CLOCK_MONOTONIC` in milliseconds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: u64,
    pub total_minor_faults: u64,
    pub total_major_faults: u64,
    pub cpu_utilization_percent: u64,
}

pub const SAMPLE_SIZE: usize = std::mem::size_of::<Sample>();

const _: () = assert!(SAMPLE_SIZE == 32);
const _: () = assert!(std::mem::align_of::<Sample>() == 8);

/// Running totals for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub cpu_time: u64,
    pub processes: usize,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &UsageSnapshot) {
        self.minor_faults = self.minor_faults.saturating_add(usage.minor_faults);
        self.major_faults = self.major_faults.saturating_add(usage.major_faults);
        self.cpu_time = self.cpu_time.saturating_add(usage.cpu_time());
        self.processes += 1;
    }

    /// `cpu_time * 100 / elapsed`, both in nanoseconds.
    ///
    /// Returns `None` when no wallclock time has passed.
    pub fn cpu_utilization(&self, elapsed_ns: u64) -> Option<u64> {
        if elapsed_ns == 0 {
            return None;
        }
        let pct = u128::from(self.cpu_time) * 100 / u128::from(elapsed_ns);
        Some(u64::try_from(pct).unwrap_or(u64::MAX))
    }

    pub fn into_sample(self, timestamp: u64, cpu_utilization_percent: u64) -> Sample {
        Sample {
            timestamp,
            total_minor_faults: self.minor_faults,
            total_major_faults: self.major_faults,
            cpu_utilization_percent,
        }
    }
}
