//! Preflight checks for build prerequisites.
//!
//! Validates that the external tools exist before any of them is invoked.
//! This prevents cryptic mid-build failures.

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::BuildConfig;

/// Check whether an executable is available.
///
/// A bare name is looked up on PATH; anything with a path separator must
/// exist as a file at that location.
pub fn executable_available(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        path.is_file()
    } else {
        which::which(program).is_ok()
    }
}

/// Check that the transpiler and the package-manager tool are available.
///
/// # Returns
///
/// * `Ok(())` if both tools are found
/// * `Err` naming every missing tool
pub fn check_build_tools(config: &BuildConfig) -> Result<()> {
    let mut missing = Vec::new();

    let transpiler = config.transpiler.display().to_string();
    if !executable_available(&transpiler) {
        missing.push(format!("  IEC transpiler: {}", transpiler));
    }

    match config.cli_command.first() {
        Some(cli) if executable_available(cli) => {}
        Some(cli) => missing.push(format!("  package-manager tool: {}", cli)),
        None => missing.push("  package-manager tool: (not configured)".to_string()),
    }

    if !missing.is_empty() {
        bail!("Missing required build tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_executable_available_on_path() {
        // 'ls' should exist on any Unix system
        assert!(executable_available("ls"));
        assert!(!executable_available("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_executable_available_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("iec2c");
        assert!(!executable_available(&tool.display().to_string()));
        std::fs::write(&tool, b"#!/bin/sh\n").unwrap();
        assert!(executable_available(&tool.display().to_string()));
    }

    #[test]
    fn test_check_build_tools_reports_all_missing() {
        let config = BuildConfig::new(
            PathBuf::from("src"),
            PathBuf::from("sketch"),
            PathBuf::from("."),
            "no_such_cli_tool_12345",
            PathBuf::from("/no/such/dir/iec2c"),
        );
        let err = check_build_tools(&config).unwrap_err().to_string();
        assert!(err.contains("IEC transpiler"));
        assert!(err.contains("package-manager tool"));
    }

    #[test]
    fn test_check_build_tools_success() {
        let config = BuildConfig::new(
            PathBuf::from("src"),
            PathBuf::from("sketch"),
            PathBuf::from("."),
            "ls",
            PathBuf::from("cat"),
        );
        assert!(check_build_tools(&config).is_ok());
    }
}
