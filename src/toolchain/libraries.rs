//! Library installation, maintenance, and the cache-policy-gated clean pass.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use serde::Deserialize;

use super::{ToolchainManager, ToolchainStatus};
use crate::config::BuildCacheOption;
use crate::process::RunStatus;

/// `lib list` JSON payload.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct LibraryList {
    #[serde(default)]
    pub installed_libraries: Vec<InstalledLibrary>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstalledLibrary {
    pub library: LibraryInfo,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LibraryInfo {
    pub name: String,
}

impl LibraryList {
    fn names(&self) -> Vec<String> {
        self.installed_libraries
            .iter()
            .map(|entry| entry.library.name.clone())
            .collect()
    }
}

/// Set difference: required libraries not present in the installed set.
pub(crate) fn missing_from(required: &[String], installed: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|lib| !installed.iter().any(|have| have == *lib))
        .cloned()
        .collect()
}

impl ToolchainManager<'_> {
    /// Names of all installed libraries. `None` when the query fails, so the
    /// caller can fall back to the conservative "everything missing" view.
    fn installed_libraries(&self) -> Option<Vec<String>> {
        let value = self.json_query(&["--json", "lib", "list"], "checking libraries")?;
        let list: LibraryList = serde_json::from_value(value).ok()?;
        Some(list.names())
    }

    /// Required libraries that are not currently installed.
    ///
    /// When no information is available every required library is reported
    /// missing; a failed query must never make the check pass.
    pub fn missing_libraries(&self) -> Vec<String> {
        match self.installed_libraries() {
            Some(installed) => missing_from(&self.config.required_libs, &installed),
            None => self.config.required_libs.clone(),
        }
    }

    /// Freshness of the installed library set.
    fn library_update_status(&self) -> (ToolchainStatus, String) {
        let Some(value) =
            self.json_query(&["--json", "lib", "list", "--updatable"], "checking library updates")
        else {
            return (
                ToolchainStatus::NotInstalled,
                "Error checking library updates".to_string(),
            );
        };
        let list: LibraryList = match serde_json::from_value(value) {
            Ok(list) => list,
            Err(err) => {
                return (
                    ToolchainStatus::NotInstalled,
                    format!("Error parsing library update list: {}", err),
                )
            }
        };

        let count = list.installed_libraries.len();
        if count == 0 {
            (
                ToolchainStatus::UpToDate,
                "All libraries are up to date".to_string(),
            )
        } else {
            (
                ToolchainStatus::UpdateAvailable,
                format!("Updates available for {} library(ies)", count),
            )
        }
    }

    /// Make sure every required library is installed.
    ///
    /// Missing libraries get one install attempt each after a single index
    /// refresh; a failed single install does not abort the loop. The check
    /// only fails when the post-loop re-query still reports missing entries.
    pub fn ensure_required_libraries(&self) -> Result<()> {
        self.log.line("Checking required libraries...");

        let missing = self.missing_libraries();
        if missing.is_empty() {
            self.log
                .line("All required libraries are already installed.");
            return Ok(());
        }

        if self.run_cli(&["lib", "update-index"]) == RunStatus::SpawnFailed {
            bail!("failed to run the package-manager tool for the library index refresh");
        }

        self.log
            .line(&format!("Installing {} missing library(ies)", missing.len()));
        for lib in &missing {
            self.log.line(&format!("Installing library: {}", lib));
            let status = self.run_cli(&["lib", "install", lib]);
            if !status.success() {
                // Recorded here; the post-check decides whether it matters.
                self.log
                    .line(&format!("install of '{}' finished with {}", lib, status));
            }
        }

        let still_missing = self.missing_libraries();
        if !still_missing.is_empty() {
            bail!(
                "failed to install {} library(ies): {}",
                still_missing.len(),
                still_missing.join(", ")
            );
        }

        self.log
            .line("All required libraries have been successfully installed.");
        Ok(())
    }

    /// Uninstall and reinstall every installed library plus the required set.
    ///
    /// Membership of the installed set is preserved while the binaries are
    /// forced fresh. The first failed reinstall aborts the remaining
    /// processing immediately, leaving already-removed libraries uninstalled
    /// (known limitation, callers recover with a rebuild at MrProper).
    pub fn clean_libraries(&self) -> Result<()> {
        self.log.line("Cleaning libraries...");

        let mut all: BTreeSet<String> = self
            .installed_libraries()
            .unwrap_or_default()
            .into_iter()
            .collect();
        all.extend(self.config.required_libs.iter().cloned());

        self.log
            .line(&format!("Processing {} library(ies)", all.len()));
        for lib in &all {
            self.log.line(&format!("Processing library: {}", lib));
            self.run_cli(&["lib", "uninstall", lib]);
            if !self.run_cli(&["lib", "install", lib]).success() {
                bail!("library installation failed: {}", lib);
            }
        }
        Ok(())
    }

    /// Bulk-upgrade all upgradable libraries.
    pub fn upgrade_libraries(&self) -> Result<()> {
        self.run_cli(&["lib", "update-index"]);

        let (status, message) = self.library_update_status();
        self.log.line(&message);
        match status {
            ToolchainStatus::UpToDate => Ok(()),
            ToolchainStatus::NotInstalled => bail!("libraries upgrade failed: {}", message),
            ToolchainStatus::UpdateAvailable => {
                if !self.run_cli(&["lib", "upgrade"]).success() {
                    bail!("libraries upgrade failed");
                }
                self.log.line("Libraries upgrade completed.");
                Ok(())
            }
        }
    }

    /// Apply the cache-policy-driven library maintenance.
    ///
    /// `CleanLibs` and above force the uninstall/reinstall pass; `UpgradeLibs`
    /// bulk-upgrades; anything above `UseCache` at least reports freshness.
    pub fn maintain_libraries(&self, option: BuildCacheOption) -> Result<()> {
        if option <= BuildCacheOption::UseCache {
            return Ok(());
        }

        self.log.line("Checking libraries status...");
        let (_, message) = self.library_update_status();
        self.log.line(&message);

        if option >= BuildCacheOption::CleanLibs {
            self.clean_libraries()
        } else if option >= BuildCacheOption::UpgradeLibs {
            self.upgrade_libraries()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::logging::{BuildLog, NullSink};
    use crate::toolchain::ToolchainManager;
    use std::path::PathBuf;

    // Stand-ins for the package-manager tool. Both record every invocation;
    // one honors `lib install`, the other silently drops it so the post-check
    // still sees the library missing.
    const CLI_INSTALL_WORKS: &str = r#"#!/bin/sh
echo "$*" >> "@RECORD@"
case "$*" in
    *"--json lib list --updatable") echo '{"installed_libraries":[]}' ;;
    *"--json lib list")
        if [ -f "@MARKER@" ]; then
            echo '{"installed_libraries":[{"library":{"name":"Ethernet"}},{"library":{"name":"OneWire"}}]}'
        else
            echo '{"installed_libraries":[{"library":{"name":"Ethernet"}}]}'
        fi
        ;;
    "--no-color lib install OneWire") touch "@MARKER@" ;;
esac
exit 0
"#;

    const CLI_INSTALL_IGNORED: &str = r#"#!/bin/sh
echo "$*" >> "@RECORD@"
case "$*" in
    *"--json lib list --updatable") echo '{"installed_libraries":[]}' ;;
    *"--json lib list") echo '{"installed_libraries":[{"library":{"name":"Ethernet"}}]}' ;;
esac
exit 0
"#;

    fn scripted_manager(
        dir: &tempfile::TempDir,
        template: &str,
    ) -> (BuildConfig, BuildLog, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let record = dir.path().join("calls.txt");
        let marker = dir.path().join("onewire-installed");
        let body = template
            .replace("@RECORD@", &record.display().to_string())
            .replace("@MARKER@", &marker.display().to_string());
        let cli = dir.path().join("fake-cli");
        std::fs::write(&cli, body).unwrap();
        let mut perms = std::fs::metadata(&cli).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&cli, perms).unwrap();

        let mut config = BuildConfig::new(
            dir.path().join("src"),
            dir.path().join("sketch"),
            dir.path().to_path_buf(),
            &cli.display().to_string(),
            PathBuf::from("iec2c"),
        );
        config.required_libs = vec!["Ethernet".to_string(), "OneWire".to_string()];
        let log = BuildLog::new(dir.path().join("build.log"), Box::new(NullSink));
        (config, log, record)
    }

    fn offline_manager(dir: &tempfile::TempDir) -> (BuildConfig, BuildLog) {
        let config = BuildConfig::new(
            dir.path().join("src"),
            dir.path().join("sketch"),
            dir.path().to_path_buf(),
            "definitely_not_a_real_command_12345",
            PathBuf::from("iec2c"),
        );
        let log = BuildLog::new(dir.path().join("build.log"), Box::new(NullSink));
        (config, log)
    }

    #[test]
    fn test_maintain_libraries_noop_at_use_cache() {
        // UseCache never touches the tool, so a bogus cli path is safe
        let dir = tempfile::tempdir().unwrap();
        let (config, log) = offline_manager(&dir);
        let manager = ToolchainManager::new(&config, &log);
        assert!(manager
            .maintain_libraries(BuildCacheOption::UseCache)
            .is_ok());
    }

    #[test]
    fn test_missing_libraries_conservative_when_tool_unavailable() {
        // a failed query reports every required library missing
        let dir = tempfile::tempdir().unwrap();
        let (config, log) = offline_manager(&dir);
        let manager = ToolchainManager::new(&config, &log);
        assert_eq!(manager.missing_libraries(), config.required_libs);
    }

    #[test]
    fn test_ensure_required_libraries_fails_when_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (config, log) = offline_manager(&dir);
        let manager = ToolchainManager::new(&config, &log);
        assert!(manager.ensure_required_libraries().is_err());
    }

    #[test]
    fn test_ensure_libraries_all_installed_queries_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, log, record) = scripted_manager(&dir, CLI_INSTALL_IGNORED);
        config.required_libs = vec!["Ethernet".to_string()];
        let manager = ToolchainManager::new(&config, &log);

        manager.ensure_required_libraries().unwrap();
        manager
            .maintain_libraries(BuildCacheOption::UseCache)
            .unwrap();

        // one installed-set lookup, no index refresh, nothing mutating
        let calls = std::fs::read_to_string(&record).unwrap();
        assert_eq!(calls.trim(), "--no-color --json lib list");
    }

    #[test]
    fn test_ensure_libraries_installs_only_the_missing_one() {
        let dir = tempfile::tempdir().unwrap();
        let (config, log, record) = scripted_manager(&dir, CLI_INSTALL_WORKS);
        let manager = ToolchainManager::new(&config, &log);

        manager.ensure_required_libraries().unwrap();

        let calls = std::fs::read_to_string(&record).unwrap();
        let installs: Vec<&str> = calls
            .lines()
            .filter(|line| line.contains("lib install"))
            .collect();
        assert_eq!(installs, vec!["--no-color lib install OneWire"]);
        assert_eq!(
            calls
                .lines()
                .filter(|line| *line == "--no-color lib update-index")
                .count(),
            1
        );
    }

    #[test]
    fn test_ensure_libraries_fails_when_install_has_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let (config, log, record) = scripted_manager(&dir, CLI_INSTALL_IGNORED);
        let manager = ToolchainManager::new(&config, &log);

        let err = manager.ensure_required_libraries().unwrap_err().to_string();
        assert!(err.contains("OneWire"), "{}", err);

        // still exactly one attempt per missing library, no retry loop
        let calls = std::fs::read_to_string(&record).unwrap();
        let installs: Vec<&str> = calls
            .lines()
            .filter(|line| line.contains("lib install"))
            .collect();
        assert_eq!(installs, vec!["--no-color lib install OneWire"]);
    }

    #[test]
    fn test_library_list_parsing() {
        let payload = r#"{
            "installed_libraries": [
                {"library": {"name": "Ethernet", "version": "2.0.2"}},
                {"library": {"name": "OneWire"}}
            ]
        }"#;
        let list: LibraryList = serde_json::from_str(payload).unwrap();
        assert_eq!(list.names(), vec!["Ethernet", "OneWire"]);
    }

    #[test]
    fn test_library_list_tolerates_empty_payload() {
        let list: LibraryList = serde_json::from_str("{}").unwrap();
        assert!(list.names().is_empty());
    }

    #[test]
    fn test_missing_from_set_difference() {
        let required = vec!["A".to_string(), "B".to_string()];
        let installed = vec!["A".to_string()];
        assert_eq!(missing_from(&required, &installed), vec!["B"]);

        let all_there = vec!["B".to_string(), "A".to_string()];
        assert!(missing_from(&required, &all_there).is_empty());

        let none: Vec<String> = Vec::new();
        assert_eq!(missing_from(&required, &none), required);
    }
}
