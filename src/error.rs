use std::io;
use std::path::PathBuf;

use crate::metrics::process::ProcessId;

/// Errors reported to callers of the profiler's control operations.
#[derive(thiserror::Error, Debug)]
pub enum ProfilerError {
    #[error("process {0} does not exist")]
    ProcessNotFound(ProcessId),
    #[error("process {0} is already registered")]
    AlreadyRegistered(ProcessId),
    #[error("process {0} is not registered")]
    NotRegistered(ProcessId),
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("Buffer: {0}")]
    Buffer(#[from] BufferError),
    #[error("Config: {0}")]
    Config(#[from] ConfigError),
}

/// Per-pid failures from a [`UsageSensor`](crate::metrics::process::UsageSensor).
#[derive(thiserror::Error, Debug)]
pub enum SensorError {
    #[error("process {0} no longer exists")]
    NotFound(ProcessId),
    #[error("reading usage of process {pid}: {source}")]
    Io {
        pid: ProcessId,
        #[source]
        source: io::Error,
    },
    #[error("malformed stat for process {pid}: {reason}")]
    Malformed { pid: ProcessId, reason: &'static str },
}

#[derive(thiserror::Error, Debug)]
pub enum BufferError {
    #[error("mapping shared buffer: {0}")]
    Map(#[source] io::Error),
    #[error("buffer of {0} bytes cannot hold a single sample")]
    TooSmall(usize),
    #[error("buffer for {0} samples does not fit in the address space")]
    TooLarge(usize),
    #[error("mapping does not carry a sample buffer header")]
    BadHeader,
    #[error("writer kept the buffer busy, gave up after {0} attempts")]
    Contended(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("command {0:?} is missing a pid")]
    MissingPid(char),
    #[error("unable to parse pid [{0}]")]
    InvalidPid(String),
    #[error(transparent)]
    Profiler(#[from] ProfilerError),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;
