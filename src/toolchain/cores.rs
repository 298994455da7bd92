//! Core (board support package) status checks and provisioning.
//!
//! The freshness check and the provisioning decision policy live here. The
//! policy distinguishes three situations: board not registered with the tool
//! at all (full reset), installed but stale (in-place upgrade), and fresh
//! (nothing to do unless the cache policy forces action).

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{ToolchainManager, ToolchainStatus};
use crate::config::{BoardDescriptor, BuildCacheOption};

/// `core list` JSON payload.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct CoreList {
    #[serde(default)]
    pub platforms: Vec<PlatformEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlatformEntry {
    pub id: String,
    #[serde(default)]
    pub installed_version: Option<String>,
}

impl CoreList {
    fn contains(&self, core: &str) -> bool {
        self.platforms.iter().any(|p| p.id == core)
    }
}

/// Board manager URLs from a `config dump` payload.
pub(crate) fn additional_urls(config: &Value) -> Vec<String> {
    config
        .get("config")
        .and_then(|c| c.get("board_manager"))
        .and_then(|b| b.get("additional_urls"))
        .and_then(Value::as_array)
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ToolchainManager<'_> {
    /// List installed (or updatable) cores. Parse failures yield an empty
    /// list, which downstream checks treat as "not installed".
    fn cores(&self, updatable: bool) -> CoreList {
        let tail: &[&str] = if updatable {
            &["--json", "core", "list", "--updatable"]
        } else {
            &["--json", "core", "list"]
        };
        self.json_query(tail, "listing cores")
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Installed version of a core, if present.
    pub fn installed_core_version(&self, core: &str) -> Option<String> {
        self.cores(false)
            .platforms
            .into_iter()
            .find(|p| p.id == core)
            .and_then(|p| p.installed_version)
    }

    /// Check the freshness of a core.
    ///
    /// With `update_check`, the remote index is refreshed first; an error
    /// payload from the refresh is treated as not-installed so the caller
    /// falls back to a full installation.
    pub fn core_status(&self, core: &str, update_check: bool) -> ToolchainStatus {
        if update_check {
            match self.json_query(&["--json", "core", "update-index"], "updating core index") {
                Some(payload) if payload.get("error").is_none() => {}
                _ => return ToolchainStatus::NotInstalled,
            }
        }

        if !self.cores(false).contains(core) {
            return ToolchainStatus::NotInstalled;
        }

        if !update_check {
            return ToolchainStatus::UpToDate;
        }

        if self.cores(true).contains(core) {
            ToolchainStatus::UpdateAvailable
        } else {
            ToolchainStatus::UpToDate
        }
    }

    /// Force a complete reinstallation of a core.
    fn reinstall_core(&self, core: &str) -> Result<()> {
        self.run_cli(&["core", "update-index"]);

        if self.cores(false).contains(core) {
            self.run_cli(&["core", "uninstall", core]);
        }

        if !self.run_cli(&["core", "install", core]).success() {
            bail!("core reinstallation failed for '{}'", core);
        }
        self.log.line("Core reinstallation completed.");
        Ok(())
    }

    /// Perform the update action matching a previously determined status.
    fn upgrade_core(&self, core: &str, status: ToolchainStatus) -> Result<()> {
        self.run_cli(&["core", "update-index"]);

        match status {
            ToolchainStatus::UpToDate => {
                // Double-check against the freshly refreshed index.
                if self.cores(true).contains(core) {
                    if !self.run_cli(&["core", "upgrade", core]).success() {
                        bail!("core upgrade failed for '{}'", core);
                    }
                    self.log.line("Core upgrade successful.");
                } else {
                    self.log.line("No core action needed.");
                }
            }
            ToolchainStatus::UpdateAvailable => {
                self.run_cli(&["core", "uninstall", core]);
                if !self.run_cli(&["core", "install", core]).success() {
                    bail!("core reinstallation failed for '{}'", core);
                }
                self.log.line("Core reinstallation successful.");
            }
            ToolchainStatus::NotInstalled => {
                if !self.run_cli(&["core", "install", core]).success() {
                    bail!("initial core installation failed for '{}'", core);
                }
                self.log.line("Initial core installation successful.");
            }
        }
        Ok(())
    }

    /// Whether a board manager URL is present in the tool's persisted config.
    pub fn board_url_configured(&self, url: &str) -> bool {
        self.json_query(
            &["config", "dump", "--format", "json"],
            "dumping tool configuration",
        )
        .map(|config| additional_urls(&config).iter().any(|u| u == url))
        .unwrap_or(false)
    }

    /// Provision the board's core according to the cache policy.
    ///
    /// Unregistered boards and the maximum cache level get a full reset:
    /// download cache cleaned, configuration reinitialized, board manager URL
    /// re-registered, core reinstalled from scratch. Otherwise a stale core
    /// (or a policy of at least [`BuildCacheOption::UpgradeCore`]) gets an
    /// in-place upgrade. Bookkeeping fields on the descriptor are updated
    /// only after success.
    pub fn provision_core(
        &self,
        board: &mut BoardDescriptor,
        option: BuildCacheOption,
    ) -> Result<()> {
        self.log.line("Checking core and board installation...");
        let status = self.core_status(&board.core, option > BuildCacheOption::UseCache);
        self.log
            .line(&format!("Core {} status: {:?}", board.core, status));

        let registered = match &board.board_manager_url {
            Some(url) => self.board_url_configured(url),
            // Cores in the built-in namespace need no extra registry URL.
            None => board.core.starts_with("arduino:"),
        };

        if !registered || option >= BuildCacheOption::MrProper {
            self.log.line("Cleaning download cache...");
            if !self.run_cli(&["cache", "clean"]).success() {
                bail!("cleaning the download cache failed");
            }

            // An already-initialized config makes this fail; that is fine.
            self.run_cli(&["config", "init"]);

            if let Some(url) = &board.board_manager_url {
                // Remove-then-add keeps the registration idempotent.
                for action in ["remove", "add"] {
                    let tail = ["config", action, "board_manager.additional_urls", url];
                    if !self.run_cli(&tail).success() {
                        bail!("failed to {} board manager URL '{}'", action, url);
                    }
                }
            }

            self.reinstall_core(&board.core)?;
            board.record_provisioned(self.installed_core_version(&board.core));
        } else if status != ToolchainStatus::UpToDate || option >= BuildCacheOption::UpgradeCore {
            self.upgrade_core(&board.core, status)?;
            board.record_provisioned(self.installed_core_version(&board.core));
        }

        Ok(())
    }
}
