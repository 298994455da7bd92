use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use firmware_builder::{
    load_board_descriptor, run_build, BuildCacheOption, BuildConfig, BuildLog, BuildRequest,
    StdoutSink, ToolchainManager, ToolchainStatus,
};

fn usage() -> &'static str {
    "Usage:\n  \
     firmware-builder build <board.toml> <program.st>\n      \
     [--port <device>] [--cache <level>] [--sketch <file>] [--define <def>]...\n      \
     [--src-dir <dir>] [--sketch-dir <dir>] [--cli <path>] [--transpiler <path>]\n      \
     [--timeout <secs>]\n  \
     firmware-builder core-status <board.toml> [--cli <path>]\n\n\
     Cache levels: use-cache, clean-build, upgrade-core, upgrade-libs, clean-libs, mr-proper"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.split_first() {
        Some((cmd, rest)) if cmd == "build" => cmd_build(rest),
        Some((cmd, rest)) if cmd == "core-status" => cmd_core_status(rest),
        _ => bail!(usage()),
    }
}

struct Flags {
    positional: Vec<String>,
    port: Option<String>,
    cache: BuildCacheOption,
    sketch: Option<PathBuf>,
    defines: Vec<String>,
    src_dir: PathBuf,
    sketch_dir: PathBuf,
    cli: String,
    transpiler: PathBuf,
    timeout: Option<Duration>,
}

fn parse_flags(args: &[String]) -> Result<Flags> {
    let mut flags = Flags {
        positional: Vec::new(),
        port: None,
        cache: BuildCacheOption::UseCache,
        sketch: None,
        defines: Vec::new(),
        src_dir: PathBuf::from("arduino/src"),
        sketch_dir: PathBuf::from("arduino/sketch"),
        cli: "arduino-cli".to_string(),
        transpiler: PathBuf::from("iec2c"),
        timeout: None,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--port" => flags.port = Some(flag_value(&mut iter, "--port")?),
            "--cache" => flags.cache = flag_value(&mut iter, "--cache")?.parse()?,
            "--sketch" => flags.sketch = Some(PathBuf::from(flag_value(&mut iter, "--sketch")?)),
            "--define" => flags.defines.push(flag_value(&mut iter, "--define")?),
            "--src-dir" => flags.src_dir = PathBuf::from(flag_value(&mut iter, "--src-dir")?),
            "--sketch-dir" => {
                flags.sketch_dir = PathBuf::from(flag_value(&mut iter, "--sketch-dir")?)
            }
            "--cli" => flags.cli = flag_value(&mut iter, "--cli")?,
            "--transpiler" => {
                flags.transpiler = PathBuf::from(flag_value(&mut iter, "--transpiler")?)
            }
            "--timeout" => {
                let secs: u64 = flag_value(&mut iter, "--timeout")?
                    .parse()
                    .context("--timeout expects a number of seconds")?;
                flags.timeout = Some(Duration::from_secs(secs));
            }
            other if other.starts_with("--") => bail!("unknown flag '{}'\n\n{}", other, usage()),
            _ => flags.positional.push(arg.clone()),
        }
    }

    Ok(flags)
}

fn flag_value(iter: &mut std::slice::Iter<'_, String>, flag: &str) -> Result<String> {
    iter.next()
        .cloned()
        .with_context(|| format!("{} expects a value", flag))
}

fn build_config(flags: &Flags) -> Result<BuildConfig> {
    let work_dir = std::env::current_dir().context("resolving current directory")?;
    let mut config = BuildConfig::new(
        flags.src_dir.clone(),
        flags.sketch_dir.clone(),
        work_dir,
        &flags.cli,
        flags.transpiler.clone(),
    );
    config.command_timeout = flags.timeout;
    Ok(config)
}

fn cmd_build(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let [board_path, program_path] = flags.positional.as_slice() else {
        bail!(usage());
    };

    let mut board = load_board_descriptor(Path::new(board_path))?;
    let program = std::fs::read_to_string(program_path)
        .with_context(|| format!("reading program source '{}'", program_path))?;
    let sketch = match &flags.sketch {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading sketch file '{}'", path.display()))?;
            Some(vec![content])
        }
        None => None,
    };

    let config = build_config(&flags)?;
    let request = BuildRequest {
        program,
        definitions: flags.defines.clone(),
        sketch,
        port: flags.port.clone(),
        cache_option: flags.cache,
    };
    let log = BuildLog::new(config.log_path.clone(), Box::new(StdoutSink));

    run_build(&config, &mut board, &request, &log)?;

    if let Some(version) = &board.installed_version {
        println!("Board core {} at version {}", board.core, version);
    }
    Ok(())
}

fn cmd_core_status(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let [board_path] = flags.positional.as_slice() else {
        bail!(usage());
    };

    let board = load_board_descriptor(Path::new(board_path))?;
    let config = build_config(&flags)?;
    let log = BuildLog::new(config.log_path.clone(), Box::new(StdoutSink));
    let manager = ToolchainManager::new(&config, &log);

    match manager.core_status(&board.core, true) {
        ToolchainStatus::UpToDate => println!("Core {} is up to date", board.core),
        ToolchainStatus::UpdateAvailable => {
            println!("Updates available for core {}", board.core)
        }
        ToolchainStatus::NotInstalled => println!("Core {} is not installed", board.core),
    }
    Ok(())
}
