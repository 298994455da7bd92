//! Toolchain provisioning via the package-manager tool.
//!
//! [`ToolchainManager`] wraps every interaction with the external
//! package-manager executable: machine-readable `--json` queries for
//! installed cores and libraries, and the install/upgrade/clean actions the
//! cache policy demands.
//!
//! The JSON output is a contract, not something this crate controls, so every
//! parse failure is a soft error: it is logged and the caller falls back to
//! conservative behavior (treat as not installed), never a crash.

mod cores;
mod libraries;

use std::path::Path;

use serde_json::Value;

use crate::config::BuildConfig;
use crate::logging::BuildLog;
use crate::process::{ProcessRunner, RunStatus};

/// Freshness of a core or the library set.
///
/// For libraries, `NotInstalled` doubles as "no information available" when
/// the status query itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ToolchainStatus {
    UpToDate = 0,
    UpdateAvailable = 1,
    NotInstalled = 2,
}

/// Queries and mutates the installed toolchain state.
pub struct ToolchainManager<'a> {
    config: &'a BuildConfig,
    log: &'a BuildLog,
    runner: ProcessRunner<'a>,
}

impl<'a> ToolchainManager<'a> {
    pub fn new(config: &'a BuildConfig, log: &'a BuildLog) -> Self {
        Self {
            config,
            log,
            runner: ProcessRunner::new(log),
        }
    }

    fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    /// Run a package-manager subcommand with streamed output.
    fn run_cli(&self, tail: &[&str]) -> RunStatus {
        self.runner.run(
            &self.config.cli_argv(tail),
            self.work_dir(),
            self.config.command_timeout,
        )
    }

    /// Run a package-manager subcommand and parse its captured JSON output.
    ///
    /// Returns `None` on empty output or malformed JSON, after logging what
    /// went wrong.
    fn json_query(&self, tail: &[&str], what: &str) -> Option<Value> {
        let text = self
            .runner
            .run_captured(&self.config.cli_argv(tail), self.work_dir());
        if text.trim().is_empty() {
            self.log.line(&format!("no output while {}", what));
            return None;
        }
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                self.log
                    .line(&format!("error parsing JSON output while {}: {}", what, err));
                None
            }
        }
    }
}
