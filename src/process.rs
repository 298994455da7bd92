//! External process execution with streamed logging and timeouts.
//!
//! All external tools (arduino-cli, the IEC transpiler) run through
//! [`ProcessRunner`]. Combined stdout/stderr is forwarded to the build log
//! line-by-line as it becomes available. A wall-clock timeout kills the
//! process and is reported as a status distinct from any real exit code.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::logging::BuildLog;

/// Outcome of one external command.
///
/// Timeouts and spawn failures are distinct variants rather than sentinel
/// exit codes, so they can never collide with a real process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Process exited on its own with this code (-1 when killed by a signal).
    Exited(i32),
    /// Process was killed after exceeding the configured timeout.
    TimedOut,
    /// Process could not be started (binary missing, permission denied).
    SpawnFailed,
}

impl RunStatus {
    /// True only for a clean zero exit.
    pub fn success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Exited(code) => write!(f, "{}", code),
            RunStatus::TimedOut => write!(f, "timeout"),
            RunStatus::SpawnFailed => write!(f, "spawn-failed"),
        }
    }
}

/// Runs external commands and streams their output to the build log.
pub struct ProcessRunner<'a> {
    log: &'a BuildLog,
}

impl<'a> ProcessRunner<'a> {
    pub fn new(log: &'a BuildLog) -> Self {
        Self { log }
    }

    /// Run a command, streaming combined stdout/stderr to the log.
    ///
    /// The invocation itself (`$ ...`) and the final status (`$? = ...`) are
    /// logged around the output. When `timeout` elapses before exit the
    /// process is killed and [`RunStatus::TimedOut`] is returned.
    pub fn run(&self, argv: &[String], cwd: &Path, timeout: Option<Duration>) -> RunStatus {
        self.log.line(&format!("$ {}", argv.join(" ")));
        let status = self.run_inner(argv, cwd, timeout);
        self.log.line(&format!("$? = {}", status));
        status
    }

    fn run_inner(&self, argv: &[String], cwd: &Path, timeout: Option<Duration>) -> RunStatus {
        let Some((program, args)) = argv.split_first() else {
            self.log.line("error: empty command");
            return RunStatus::SpawnFailed;
        };

        let mut child = match Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                self.log.line(&format!("failed to start '{}': {}", program, err));
                return RunStatus::SpawnFailed;
            }
        };

        // Both pipes feed one channel so output interleaves in arrival order.
        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let start = Instant::now();
        let status = loop {
            if deadline_exceeded(timeout, start) {
                let _ = child.kill();
                let _ = child.wait();
                break RunStatus::TimedOut;
            }

            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(line) => self.log.line(&line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // Pipes closed; the process is exiting or already gone.
                    break wait_with_deadline(&mut child, timeout, start);
                }
            }
        };

        // Flush anything the readers delivered after the loop decided.
        for line in rx.try_iter() {
            self.log.line(&line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        status
    }

    /// Run a command and return its captured stdout instead of streaming.
    ///
    /// Used for machine-readable queries (`--json`). Returns an empty string
    /// when the command cannot run; callers must not treat empty output as
    /// success. Stderr is diverted to the log so diagnostics are not lost.
    pub fn run_captured(&self, argv: &[String], cwd: &Path) -> String {
        let Some((program, args)) = argv.split_first() else {
            return String::new();
        };

        match Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) => {
                if !output.stderr.is_empty() {
                    self.log.line(&String::from_utf8_lossy(&output.stderr));
                }
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Err(err) => {
                self.log
                    .line(&format!("failed to start '{}': {}", program, err));
                String::new()
            }
        }
    }
}

fn deadline_exceeded(timeout: Option<Duration>, start: Instant) -> bool {
    timeout.is_some_and(|limit| start.elapsed() > limit)
}

/// Wait for exit after the output pipes closed, still honoring the deadline.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>, start: Instant) -> RunStatus {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return RunStatus::Exited(status.code().unwrap_or(-1)),
            Ok(None) => {}
            Err(_) => return RunStatus::Exited(-1),
        }
        if deadline_exceeded(timeout, start) {
            let _ = child.kill();
            let _ = child.wait();
            return RunStatus::TimedOut;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: Sender<String>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullSink;

    fn temp_log() -> (tempfile::TempDir, BuildLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = BuildLog::new(dir.path().join("build.log"), Box::new(NullSink));
        (dir, log)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_run_success_exit_code() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        let status = runner.run(&argv(&["true"]), dir.path(), None);
        assert_eq!(status, RunStatus::Exited(0));
        assert!(status.success());
    }

    #[test]
    fn test_run_nonzero_exit_code() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        let status = runner.run(&argv(&["false"]), dir.path(), None);
        assert_eq!(status, RunStatus::Exited(1));
        assert!(!status.success());
    }

    #[test]
    fn test_run_spawn_failure_is_distinct() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        let status = runner.run(
            &argv(&["definitely_not_a_real_command_12345"]),
            dir.path(),
            None,
        );
        assert_eq!(status, RunStatus::SpawnFailed);
        assert!(!status.success());
    }

    #[test]
    fn test_run_streams_output_to_log() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        runner.run(&argv(&["echo", "hello-build"]), dir.path(), None);

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("$ echo hello-build"));
        assert!(content.contains("hello-build"));
        assert!(content.contains("$? = 0"));
    }

    #[test]
    fn test_timeout_kills_hung_process() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        let start = Instant::now();
        let status = runner.run(
            &argv(&["sleep", "30"]),
            dir.path(),
            Some(Duration::from_millis(200)),
        );
        assert_eq!(status, RunStatus::TimedOut);
        // Killed within a bounded margin of the configured timeout.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_captured_returns_stdout() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        let text = runner.run_captured(&argv(&["echo", "captured"]), dir.path());
        assert_eq!(text.trim(), "captured");
    }

    #[test]
    fn test_run_captured_empty_on_spawn_failure() {
        let (dir, log) = temp_log();
        let runner = ProcessRunner::new(&log);
        let text = runner.run_captured(
            &argv(&["definitely_not_a_real_command_12345"]),
            dir.path(),
        );
        assert!(text.is_empty());
    }
}
