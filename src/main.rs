#![warn(clippy::all, rust_2018_idioms)]

use clap::Parser;
use log::{error, info};
use profring::{ControlChannel, Outcome, Profiler, ProfilerConfig};
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

/// Samples page faults and CPU use of registered processes into a shared ring.
///
/// Commands are read from stdin, one per line: `R,<pid>`, `U,<pid>`,
/// `status`, `dump` and `quit`.
#[derive(Parser, Debug)]
#[command(name = "profring", version)]
struct Args {
    /// TOML file with `interval_ms`, `buffer_bytes` and `shm_name`.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    interval_ms: Option<u64>,
    #[arg(long)]
    buffer_bytes: Option<usize>,
    /// Byte limit for the `status` listing.
    #[arg(long, default_value_t = 4096)]
    status_limit: usize,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ProfilerConfig::load(path)?,
        None => ProfilerConfig::default(),
    };
    if let Some(interval_ms) = args.interval_ms {
        config.interval_ms = interval_ms;
    }
    if let Some(buffer_bytes) = args.buffer_bytes {
        config.buffer_bytes = buffer_bytes;
    }

    let profiler = Profiler::new(config)?;
    let buffer = profiler.buffer();
    println!(
        "buffer: /proc/{}/fd/{} ({} bytes, {} samples)",
        std::process::id(),
        buffer.as_raw_fd(),
        buffer.mapping_len(),
        buffer.capacity()
    );

    let channel = ControlChannel::new(&profiler);
    let mut stdout = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "status" => write!(stdout, "{}", channel.read_status(args.status_limit))?,
            "dump" => {
                for sample in buffer.snapshot() {
                    writeln!(stdout, "{}", serde_json::to_string(&sample)?)?;
                }
            }
            input => match channel.write(input) {
                Ok(Outcome::Applied(command)) => writeln!(stdout, "ok {command}")?,
                Ok(Outcome::Ignored(command, reason)) => {
                    writeln!(stdout, "ignored {command}: {reason}")?
                }
                Err(err) => writeln!(stdout, "error: {err}")?,
            },
        }
        stdout.flush()?;
    }

    info!("shutting down with {} samples recorded", buffer.len());
    profiler.shutdown();
    Ok(())
}
