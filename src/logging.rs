//! Build log sink and persistent log file.
//!
//! Every line of build output flows through a single [`BuildLog`]: it is
//! appended, timestamped, to the persistent `build.log` file and forwarded
//! verbatim to a pluggable [`LogSink`] (stdout by default). Subprocess output
//! is logged line-by-line as it arrives, not buffered until completion.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::OffsetDateTime;

/// Destination for live build output.
///
/// The log file always receives a timestamped copy; the sink decides what the
/// user sees (terminal, UI panel, nothing).
pub trait LogSink {
    /// Forward one chunk of build output.
    fn send(&self, text: &str);
}

/// Sink that prints to stdout.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn send(&self, text: &str) {
        println!("{}", text);
    }
}

/// Sink that discards all output. Useful for silent builds and tests.
pub struct NullSink;

impl LogSink for NullSink {
    fn send(&self, _text: &str) {}
}

/// Append-only build log with a single writer.
///
/// Failures to write the log file are reported on stderr and never abort the
/// build; the sink still receives the output.
pub struct BuildLog {
    path: PathBuf,
    sink: Box<dyn LogSink>,
}

impl BuildLog {
    pub fn new(path: PathBuf, sink: Box<dyn LogSink>) -> Self {
        Self { path, sink }
    }

    /// Path of the persistent log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the log file, starting a fresh build record.
    pub fn reset(&self) -> Result<()> {
        std::fs::write(&self.path, b"")
            .with_context(|| format!("resetting build log '{}'", self.path.display()))
    }

    /// Record one or more lines of output.
    ///
    /// Each line is written to the log file as `[timestamp] line` and the
    /// whole chunk is forwarded to the sink.
    pub fn line(&self, text: &str) {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                let stamp = timestamp();
                for line in text.lines() {
                    if let Err(err) = writeln!(file, "[{}] {}", stamp, line) {
                        eprintln!("error writing build log '{}': {}", self.path.display(), err);
                        break;
                    }
                }
            }
            Err(err) => {
                eprintln!("error opening build log '{}': {}", self.path.display(), err);
            }
        }

        self.sink.send(text);
    }

    /// Record a phase banner.
    pub fn banner(&self, title: &str) {
        self.line(&format!("==== {} ====", title));
    }

    /// Record basic host information at the start of a build.
    pub fn host_info(&self) {
        self.line(&format!("Host architecture: {}", std::env::consts::ARCH));
        self.line(&format!("Operating system: {}", std::env::consts::OS));
        if let Ok(cores) = std::thread::available_parallelism() {
            self.line(&format!("Logical CPU cores: {}", cores));
        }
        self.line(&format!(
            "Active PATH: {}",
            std::env::var("PATH").unwrap_or_default()
        ));
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}
