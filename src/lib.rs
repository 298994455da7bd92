//! Firmware build orchestrator for Arduino-class PLC targets.
//!
//! This crate turns a transpiled IEC 61131-3 program into flashed board
//! firmware by driving two external tools: `arduino-cli` (board/library
//! package manager) and `iec2c` (ST-to-C transpiler). It owns the decisions
//! around them:
//!
//! - **Build pipeline** - fixed phase order with fail-fast abort
//! - **Toolchain provisioning** - which cores/libraries to install, upgrade,
//!   or force-reinstall, gated by an ordered cache policy
//! - **Process execution** - streamed logging and timeout-based cancellation
//!   for every external command
//! - **Glue generation** - wiring located variables to fixed hardware I/O
//!   buffers with strict address validation
//!
//! # Architecture
//!
//! ```text
//! run_build (pipeline)
//!     │ ordered phases, abort on first failure
//!     ├── preflight ──── tool availability
//!     ├── ToolchainManager ── arduino-cli JSON contract
//!     │       └── ProcessRunner ── streamed output, timeouts
//!     ├── glue ───────── LOCATED_VARIABLES.h -> glueVars.c
//!     └── BuildLog ───── one timestamped sink for everything
//! ```
//!
//! Phases run strictly sequentially; the only concurrency is a running
//! external process and its output reader threads, and a build never advances
//! past a command until it returns or times out.

pub mod config;
pub mod glue;
pub mod logging;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod toolchain;

pub use config::{load_board_descriptor, BoardDescriptor, BuildCacheOption, BuildConfig};
pub use logging::{BuildLog, LogSink, NullSink, StdoutSink};
pub use pipeline::{run_build, BuildRequest};
pub use process::{ProcessRunner, RunStatus};
pub use toolchain::{ToolchainManager, ToolchainStatus};
