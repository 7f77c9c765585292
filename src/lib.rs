#![warn(clippy::all, rust_2018_idioms)]

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub use config::ProfilerConfig;
pub use control::{Command, ControlChannel, Outcome};
pub use error::{BufferError, ConfigError, ControlError, ProfilerError, SensorError};
pub use metrics::process::{ProcessId, Sample, SampleBuffer, SampleReader, UsageSensor, UsageSnapshot};
pub use metrics::Profiler;
