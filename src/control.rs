//! Line-oriented control protocol: `R,<pid>` registers, `U,<pid>` unregisters.

use crate::error::{ControlError, ProfilerError};
use crate::metrics::process::ProcessId;
use crate::metrics::Profiler;
use log::info;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register(ProcessId),
    Unregister(ProcessId),
}

impl FromStr for Command {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let command = chars.next().ok_or(ControlError::Empty)?;
        let make: fn(ProcessId) -> Command = match command {
            'R' => Command::Register,
            'U' => Command::Unregister,
            _ => return Err(ControlError::UnknownCommand(s.to_string())),
        };

        let pid_str = chars
            .as_str()
            .strip_prefix(',')
            .ok_or(ControlError::MissingPid(command))?;
        if pid_str.trim().is_empty() {
            return Err(ControlError::MissingPid(command));
        }
        let pid = pid_str
            .parse::<ProcessId>()
            .map_err(|_| ControlError::InvalidPid(pid_str.to_string()))?;
        Ok(make(pid))
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register(pid) => write!(f, "R,{pid}"),
            Command::Unregister(pid) => write!(f, "U,{pid}"),
        }
    }
}

/// What a well-formed command did.
#[derive(Debug)]
pub enum Outcome {
    Applied(Command),
    /// The command was valid but had no effect, e.g. a dead or unknown pid.
    Ignored(Command, ProfilerError),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }
}

/// Control surface over a [`Profiler`].
#[derive(Debug, Clone, Copy)]
pub struct ControlChannel<'a> {
    profiler: &'a Profiler,
}

impl<'a> ControlChannel<'a> {
    pub fn new(profiler: &'a Profiler) -> Self {
        Self { profiler }
    }

    /// Parses and applies one command. Malformed input changes nothing.
    pub fn write(&self, input: &str) -> Result<Outcome, ControlError> {
        let command: Command = input.parse().map_err(|err| {
            info!("rejected control input {:?}: {}", input, err);
            err
        })?;
        self.apply(command)
    }

    pub fn apply(&self, command: Command) -> Result<Outcome, ControlError> {
        let result = match command {
            Command::Register(pid) => self.profiler.register(pid),
            Command::Unregister(pid) => self.profiler.unregister(pid),
        };

        match result {
            Ok(()) => Ok(Outcome::Applied(command)),
            Err(
                err @ (ProfilerError::ProcessNotFound(_)
                | ProfilerError::AlreadyRegistered(_)
                | ProfilerError::NotRegistered(_)),
            ) => {
                info!("{} ignored: {}", command, err);
                Ok(Outcome::Ignored(command, err))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// One `"<pid>\n"` line per registered process, in registration order,
    /// cut at `limit` bytes without splitting a line.
    pub fn read_status(&self, limit: usize) -> String {
        let mut out = String::new();
        let mut line = String::new();
        for pid in self.profiler.registered() {
            line.clear();
            let _ = writeln!(line, "{pid}");
            if out.len() + line.len() > limit {
                break;
            }
            out.push_str(&line);
        }
        out
    }
}
