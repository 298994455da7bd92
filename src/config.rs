//! Per-build configuration.
//!
//! Everything a build needs to know about its environment lives in
//! [`BuildConfig`], constructed once and passed into every component.
//! [`BoardDescriptor`] is the immutable board selection loaded from a TOML
//! file, plus two bookkeeping fields the toolchain manager fills in after a
//! successful core install or upgrade.
//!
//! # Example
//!
//! ```rust
//! use firmware_builder::config::BuildCacheOption;
//!
//! // Cache options parse from their kebab-case names and are strictly
//! // ordered by aggressiveness.
//! let option: BuildCacheOption = "upgrade-libs".parse().unwrap();
//! assert!(option > BuildCacheOption::CleanBuild);
//! assert!(option < BuildCacheOption::MrProper);
//! assert_eq!(option.to_string(), "upgrade-libs");
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Deserialize;

/// How aggressively cached toolchain state is invalidated for one build run.
///
/// Levels are strictly ordered; every level performs at least the
/// invalidation of the levels below it. The ordering is derived from the
/// integer rank, never hand-written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BuildCacheOption {
    /// Trust everything previously provisioned.
    UseCache = 0,
    /// Force a clean compile of the sketch.
    CleanBuild = 1,
    /// Additionally upgrade the board core when an update is available.
    UpgradeCore = 2,
    /// Additionally bulk-upgrade all upgradable libraries.
    UpgradeLibs = 3,
    /// Additionally uninstall and reinstall every library.
    CleanLibs = 4,
    /// Full reset: clean caches, reinitialize tool config, reinstall core.
    MrProper = 5,
}

impl BuildCacheOption {
    pub const ALL: [BuildCacheOption; 6] = [
        BuildCacheOption::UseCache,
        BuildCacheOption::CleanBuild,
        BuildCacheOption::UpgradeCore,
        BuildCacheOption::UpgradeLibs,
        BuildCacheOption::CleanLibs,
        BuildCacheOption::MrProper,
    ];
}

impl std::fmt::Display for BuildCacheOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildCacheOption::UseCache => "use-cache",
            BuildCacheOption::CleanBuild => "clean-build",
            BuildCacheOption::UpgradeCore => "upgrade-core",
            BuildCacheOption::UpgradeLibs => "upgrade-libs",
            BuildCacheOption::CleanLibs => "clean-libs",
            BuildCacheOption::MrProper => "mr-proper",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for BuildCacheOption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "use-cache" => Ok(BuildCacheOption::UseCache),
            "clean-build" => Ok(BuildCacheOption::CleanBuild),
            "upgrade-core" => Ok(BuildCacheOption::UpgradeCore),
            "upgrade-libs" => Ok(BuildCacheOption::UpgradeLibs),
            "clean-libs" => Ok(BuildCacheOption::CleanLibs),
            "mr-proper" => Ok(BuildCacheOption::MrProper),
            other => anyhow::bail!(
                "unknown cache option '{}' (expected one of: use-cache, clean-build, \
                 upgrade-core, upgrade-libs, clean-libs, mr-proper)",
                other
            ),
        }
    }
}

/// Libraries every firmware build depends on.
///
/// Board-specific subsets may replace this list through
/// [`BuildConfig::required_libs`] once HAL descriptors carry their own
/// dependency lists.
pub const REQUIRED_LIBRARIES: &[&str] = &[
    "WiFiNINA",
    "Ethernet",
    "Arduino_MachineControl",
    "Arduino_EdgeControl",
    "OneWire",
    "DallasTemperature",
    "P1AM",
    "CONTROLLINO",
    "PubSubClient",
    "ArduinoJson",
    "ArduinoMqttClient",
    "RP2040_PWM",
    "AVR_PWM",
    "megaAVR_PWM",
    "SAMD_PWM",
    "SAMDUE_PWM",
    "Portenta_H7_PWM",
    "CAN",
    "STM32_CAN",
    "STM32_PWM",
];

/// Board selection for one build, loaded from a TOML descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardDescriptor {
    /// Fully qualified board name passed to compile/upload (e.g.
    /// `arduino:avr:uno`).
    pub platform: String,
    /// Board support package id (e.g. `arduino:avr`).
    pub core: String,
    /// HAL source file name under `hal/`, staged as `arduino.cpp`.
    pub source: String,
    /// Board manager registry URL for third-party cores.
    #[serde(default)]
    pub board_manager_url: Option<String>,
    /// Extra C compiler flags.
    #[serde(default)]
    pub c_flags: Option<Vec<String>>,
    /// Extra C++ compiler flags.
    #[serde(default)]
    pub cxx_flags: Option<Vec<String>>,
    /// Preprocessor defines emitted into `defines.h`.
    #[serde(default)]
    pub define: Option<Vec<String>>,

    /// Unix timestamp of the last successful core install/upgrade.
    #[serde(skip)]
    pub last_update: Option<u64>,
    /// Core version resolved after the last successful install/upgrade.
    #[serde(skip)]
    pub installed_version: Option<String>,
}

impl BoardDescriptor {
    /// Record a successful core install/upgrade.
    pub fn record_provisioned(&mut self, version: Option<String>) {
        self.last_update = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
        self.installed_version = version;
    }
}

/// Load a board descriptor from a TOML file.
pub fn load_board_descriptor(path: &Path) -> Result<BoardDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading board descriptor '{}'", path.display()))?;
    toml::from_str(&text)
        .with_context(|| format!("parsing board descriptor '{}'", path.display()))
}

/// Explicit per-build configuration.
///
/// No component reads global state; paths and tool invocations are resolved
/// here once and borrowed everywhere else.
pub struct BuildConfig {
    /// Directory holding the transpiler workspace: generated C sources,
    /// `hal/`, `lib/`, and the build log.
    pub src_dir: PathBuf,
    /// Directory holding the sketch (`Baremetal.ino`, `defines.h`, `ext/`).
    pub sketch_dir: PathBuf,
    /// Working directory for package-manager invocations.
    pub work_dir: PathBuf,
    /// Package-manager invocation prefix (binary followed by fixed flags).
    pub cli_command: Vec<String>,
    /// Path to the IEC 61131-3 ST-to-C transpiler.
    pub transpiler: PathBuf,
    /// Path of the append-only build log.
    pub log_path: PathBuf,
    /// Libraries that must be installed before compiling.
    pub required_libs: Vec<String>,
    /// Wall-clock limit applied to each streamed external command.
    pub command_timeout: Option<Duration>,
}

impl BuildConfig {
    pub fn new(src_dir: PathBuf, sketch_dir: PathBuf, work_dir: PathBuf, cli: &str, transpiler: PathBuf) -> Self {
        let log_path = src_dir.join("build.log");
        Self {
            src_dir,
            sketch_dir,
            work_dir,
            cli_command: vec![cli.to_string(), "--no-color".to_string()],
            transpiler,
            log_path,
            required_libs: REQUIRED_LIBRARIES.iter().map(|s| s.to_string()).collect(),
            command_timeout: None,
        }
    }

    /// Package-manager argv with `tail` appended to the invocation prefix.
    pub fn cli_argv(&self, tail: &[&str]) -> Vec<String> {
        let mut argv = self.cli_command.clone();
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_option_total_order() {
        let levels = BuildCacheOption::ALL;
        for pair in levels.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // monotonicity over all pairs: a < b implies rank(a) < rank(b)
        for (i, a) in levels.iter().enumerate() {
            for (j, b) in levels.iter().enumerate() {
                assert_eq!(a < b, i < j);
                assert_eq!(a <= b, i <= j);
            }
        }
    }

    #[test]
    fn test_cache_option_round_trip() {
        for level in BuildCacheOption::ALL {
            let parsed: BuildCacheOption = level.to_string().parse().unwrap();
            assert_eq!(parsed, level);
        }
        assert!("mr-propper".parse::<BuildCacheOption>().is_err());
    }

    #[test]
    fn test_load_board_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uno.toml");
        std::fs::write(
            &path,
            r#"
platform = "arduino:avr:uno"
core = "arduino:avr"
source = "uno.cpp"
define = ["BOARD_UNO"]
"#,
        )
        .unwrap();

        let board = load_board_descriptor(&path).unwrap();
        assert_eq!(board.platform, "arduino:avr:uno");
        assert_eq!(board.core, "arduino:avr");
        assert_eq!(board.source, "uno.cpp");
        assert!(board.board_manager_url.is_none());
        assert_eq!(board.define.as_deref(), Some(&["BOARD_UNO".to_string()][..]));
        assert!(board.last_update.is_none());
        assert!(board.installed_version.is_none());
    }

    #[test]
    fn test_load_board_descriptor_with_url_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esp32.toml");
        std::fs::write(
            &path,
            r#"
platform = "esp32:esp32:esp32"
core = "esp32:esp32"
source = "esp32.cpp"
board_manager_url = "https://espressif.github.io/arduino-esp32/package_esp32_index.json"
c_flags = ["-Os"]
cxx_flags = ["-Os", "-fno-exceptions"]
"#,
        )
        .unwrap();

        let board = load_board_descriptor(&path).unwrap();
        assert!(board.board_manager_url.is_some());
        assert_eq!(board.cxx_flags.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_load_board_descriptor_missing_field_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "platform = \"arduino:avr:uno\"\n").unwrap();
        assert!(load_board_descriptor(&path).is_err());
    }

    #[test]
    fn test_record_provisioned_sets_bookkeeping() {
        let mut board = BoardDescriptor {
            platform: "arduino:avr:uno".into(),
            core: "arduino:avr".into(),
            source: "uno.cpp".into(),
            board_manager_url: None,
            c_flags: None,
            cxx_flags: None,
            define: None,
            last_update: None,
            installed_version: None,
        };
        board.record_provisioned(Some("1.8.6".into()));
        assert!(board.last_update.is_some());
        assert_eq!(board.installed_version.as_deref(), Some("1.8.6"));
    }

    #[test]
    fn test_cli_argv_appends_tail() {
        let config = BuildConfig::new(
            PathBuf::from("src"),
            PathBuf::from("sketch"),
            PathBuf::from("."),
            "arduino-cli",
            PathBuf::from("iec2c"),
        );
        assert_eq!(
            config.cli_argv(&["core", "list"]),
            vec!["arduino-cli", "--no-color", "core", "list"]
        );
        assert_eq!(config.log_path, PathBuf::from("src/build.log"));
    }
}
