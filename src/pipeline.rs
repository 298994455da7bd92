//! The build pipeline: ordered phases with fail-fast abort.
//!
//! A build is a fixed sequence of named phases executed strictly one after
//! another. The first failing phase aborts the run; later phases never
//! execute and nothing is rolled back. Phases communicate only through the
//! filesystem and the board descriptor's bookkeeping fields; diagnostics go
//! to the shared build log.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::config::{BoardDescriptor, BuildCacheOption, BuildConfig};
use crate::glue;
use crate::logging::BuildLog;
use crate::preflight;
use crate::process::ProcessRunner;
use crate::toolchain::ToolchainManager;

/// Transpiler outputs cleared before a build so stale state never leaks in.
const STALE_OUTPUTS: &[&str] = &[
    "POUS.c",
    "POUS.h",
    "LOCATED_VARIABLES.h",
    "VARIABLES.csv",
    "Config0.c",
    "Config0.h",
    "Res0.c",
];

/// Intermediate files removed best-effort after a successful build.
const INTERMEDIATE_FILES: &[&str] = &[
    "POUS.c",
    "POUS.h",
    "LOCATED_VARIABLES.h",
    "VARIABLES.csv",
    "Config0.c",
    "Config0.h",
    "Config0.o",
    "Res0.c",
    "Res0.o",
    "glueVars.c",
];

/// Everything one build run was asked to do.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// IEC 61131-3 Structured Text program source.
    pub program: String,
    /// Extra preprocessor definitions for `defines.h`.
    pub definitions: Vec<String>,
    /// Optional user-supplied native source fragments.
    pub sketch: Option<Vec<String>>,
    /// Upload target; `None` builds without flashing.
    pub port: Option<String>,
    /// Cache invalidation level for this run.
    pub cache_option: BuildCacheOption,
}

/// Shared state passed to every phase.
struct PhaseCtx<'a> {
    config: &'a BuildConfig,
    board: &'a mut BoardDescriptor,
    request: &'a BuildRequest,
    log: &'a BuildLog,
}

type PhaseFn = for<'a, 'b> fn(&'a mut PhaseCtx<'b>) -> Result<()>;

/// The pipeline, in execution order.
const BUILD_PHASES: &[(&str, PhaseFn)] = &[
    ("reset environment", setup_environment),
    ("verify prerequisites", verify_prerequisites),
    ("provision board core", provision_core),
    ("check required libraries", check_required_libraries),
    ("maintain libraries", maintain_libraries),
    ("transpile program", transpile_program),
    ("stage HAL source", stage_hal),
    ("write sketch fragments", write_sketch),
    ("write definitions", write_defines),
    ("generate glue code", generate_glue),
    ("patch generated sources", patch_generated_sources),
    ("compile firmware", compile_firmware),
    ("upload or report", upload_or_report),
    ("cleanup", cleanup_build),
];

/// Run the full build pipeline.
///
/// Stops at the first failing phase; the error names the phase that failed.
pub fn run_build(
    config: &BuildConfig,
    board: &mut BoardDescriptor,
    request: &BuildRequest,
    log: &BuildLog,
) -> Result<()> {
    let mut ctx = PhaseCtx {
        config,
        board,
        request,
        log,
    };
    run_phase_list(&mut ctx, BUILD_PHASES)
}

fn run_phase_list(ctx: &mut PhaseCtx, phases: &[(&str, PhaseFn)]) -> Result<()> {
    for (name, phase) in phases {
        ctx.log.banner(name);
        if let Err(err) = phase(ctx) {
            ctx.log.line(&format!("ERROR: {:#}", err));
            return Err(err.context(format!("build phase '{}' failed", name)));
        }
    }
    Ok(())
}

fn setup_environment(ctx: &mut PhaseCtx) -> Result<()> {
    ctx.log.reset()?;
    ctx.log.host_info();

    for name in STALE_OUTPUTS {
        let path = ctx.config.src_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing stale file '{}'", path.display()))?;
        }
    }
    Ok(())
}

fn verify_prerequisites(ctx: &mut PhaseCtx) -> Result<()> {
    preflight::check_build_tools(ctx.config)?;

    // Version banners; the output matters, the exit codes do not.
    let runner = ProcessRunner::new(ctx.log);
    let transpiler = ctx.config.transpiler.display().to_string();
    runner.run(
        &[transpiler, "-v".to_string()],
        &ctx.config.work_dir,
        ctx.config.command_timeout,
    );
    runner.run(
        &ctx.config.cli_argv(&["version"]),
        &ctx.config.work_dir,
        ctx.config.command_timeout,
    );
    Ok(())
}

fn provision_core(ctx: &mut PhaseCtx) -> Result<()> {
    ToolchainManager::new(ctx.config, ctx.log).provision_core(ctx.board, ctx.request.cache_option)
}

fn check_required_libraries(ctx: &mut PhaseCtx) -> Result<()> {
    ToolchainManager::new(ctx.config, ctx.log).ensure_required_libraries()
}

fn maintain_libraries(ctx: &mut PhaseCtx) -> Result<()> {
    ToolchainManager::new(ctx.config, ctx.log).maintain_libraries(ctx.request.cache_option)
}

fn transpile_program(ctx: &mut PhaseCtx) -> Result<()> {
    ctx.log.line("Compiling .st file...");

    let st_path = ctx.config.src_dir.join("plc_prog.st");
    std::fs::write(&st_path, &ctx.request.program)
        .with_context(|| format!("writing program source '{}'", st_path.display()))?;

    let argv = vec![
        ctx.config.transpiler.display().to_string(),
        "-f".to_string(),
        "-l".to_string(),
        "-p".to_string(),
        "plc_prog.st".to_string(),
    ];
    let status = ProcessRunner::new(ctx.log).run(
        &argv,
        &ctx.config.src_dir,
        ctx.config.command_timeout,
    );
    if !status.success() {
        bail!("transpiler failed ({})", status);
    }
    Ok(())
}

fn stage_hal(ctx: &mut PhaseCtx) -> Result<()> {
    ctx.log.line("Copying HAL source file...");

    let source = ctx.config.src_dir.join("hal").join(&ctx.board.source);
    let target = ctx.config.src_dir.join("arduino.cpp");
    std::fs::copy(&source, &target).with_context(|| {
        format!(
            "staging HAL source '{}' as '{}'",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

fn write_sketch(ctx: &mut PhaseCtx) -> Result<()> {
    let sketch_path = ctx.config.sketch_dir.join("ext").join("arduino_sketch.h");

    // A stale sketch header must never survive into a sketch-less build.
    match std::fs::remove_file(&sketch_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("removing old sketch header '{}'", sketch_path.display())
            })
        }
    }

    let Some(fragments) = &ctx.request.sketch else {
        return Ok(());
    };

    ctx.log
        .line(&format!("Adding sketch file {}...", sketch_path.display()));
    if let Some(parent) = sketch_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating sketch directory '{}'", parent.display()))?;
    }
    let mut content = String::new();
    for fragment in fragments {
        content.push_str(fragment);
        content.push('\n');
    }
    std::fs::write(&sketch_path, content)
        .with_context(|| format!("writing sketch header '{}'", sketch_path.display()))
}

/// Render the `defines.h` content for a build.
fn defines_content(board: &BoardDescriptor, request: &BuildRequest) -> String {
    let mut content = String::new();

    if let Some(defines) = &board.define {
        content.push_str("// Board defines\n");
        for define in defines {
            content.push_str(&format!("#define {}\n", define));
        }
        content.push_str("\n\n");
    }

    if request.sketch.is_some() {
        content.push_str("// Project defines\n");
        content.push_str("#define USE_ARDUINO_SKETCH\n");
        content.push_str("#define ARDUINO_PLATFORM\n");
        content.push_str("\n\n");
    }

    content.push_str(&request.definitions.join("\n"));
    content
}

fn write_defines(ctx: &mut PhaseCtx) -> Result<()> {
    let defines_path = ctx.config.sketch_dir.join("defines.h");
    ctx.log.line(&format!(
        "Generating definitions file '{}'...",
        defines_path.display()
    ));

    std::fs::write(&defines_path, defines_content(ctx.board, ctx.request))
        .with_context(|| format!("writing definitions file '{}'", defines_path.display()))
}

fn generate_glue(ctx: &mut PhaseCtx) -> Result<()> {
    let located_path = ctx.config.src_dir.join("LOCATED_VARIABLES.h");
    if !located_path.is_file() {
        bail!("couldn't find '{}'", located_path.display());
    }
    let located_text = std::fs::read_to_string(&located_path)
        .with_context(|| format!("reading '{}'", located_path.display()))?;

    glue::generate_glue_file(
        &located_text,
        &ctx.config.src_dir.join("glueVars.c"),
        ctx.log,
    )
}

/// Prepend the header includes the transpiler forgets to order correctly.
fn patched_pous(content: &str) -> String {
    format!("#include \"POUS.h\"\n#include \"Config0.h\"\n\n{}", content)
}

/// Replace textual inclusion of the POUS implementation with its header.
fn patched_res0(content: &str) -> String {
    let mut out = String::new();
    for line in content.lines() {
        if line.contains("#include \"POUS.c\"") {
            out.push_str("#include \"POUS.h\"\n");
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn patch_generated_sources(ctx: &mut PhaseCtx) -> Result<()> {
    let pous_path = ctx.config.src_dir.join("POUS.c");
    let pous = std::fs::read_to_string(&pous_path)
        .with_context(|| format!("reading '{}'", pous_path.display()))?;
    std::fs::write(&pous_path, patched_pous(&pous))
        .with_context(|| format!("patching '{}'", pous_path.display()))?;

    let res0_path = ctx.config.src_dir.join("Res0.c");
    let res0 = std::fs::read_to_string(&res0_path)
        .with_context(|| format!("reading '{}'", res0_path.display()))?;
    std::fs::write(&res0_path, patched_res0(&res0))
        .with_context(|| format!("patching '{}'", res0_path.display()))?;

    Ok(())
}

/// Build the compile argv for the package-manager tool.
fn compile_args(
    config: &BuildConfig,
    board: &BoardDescriptor,
    option: BuildCacheOption,
) -> Vec<String> {
    let mut argv = config.cli_argv(&["compile", "-v"]);

    if option >= BuildCacheOption::CleanBuild {
        argv.push("--clean".to_string());
    }

    if let Some(flags) = &board.c_flags {
        argv.push("--build-property".to_string());
        argv.push(format!("compiler.c.extra_flags={}", flags.join(" ")));
    }
    if let Some(flags) = &board.cxx_flags {
        argv.push("--build-property".to_string());
        argv.push(format!("compiler.cpp.extra_flags={}", flags.join(" ")));
    }

    argv.push("--library".to_string());
    argv.push(config.src_dir.display().to_string());
    argv.push("--library".to_string());
    argv.push(config.src_dir.join("lib").display().to_string());
    argv.push("--export-binaries".to_string());
    argv.push("-b".to_string());
    argv.push(board.platform.clone());
    argv.push(config.sketch_dir.join("Baremetal.ino").display().to_string());

    argv
}

fn compile_firmware(ctx: &mut PhaseCtx) -> Result<()> {
    ctx.log.line("Generating binary file...");

    let argv = compile_args(ctx.config, ctx.board, ctx.request.cache_option);
    let status = ProcessRunner::new(ctx.log).run(
        &argv,
        &ctx.config.work_dir,
        ctx.config.command_timeout,
    );
    if !status.success() {
        bail!("firmware compilation failed ({})", status);
    }
    Ok(())
}

fn upload_or_report(ctx: &mut PhaseCtx) -> Result<()> {
    let Some(port) = &ctx.request.port else {
        let build_dir = output_dir(ctx.config);
        ctx.log
            .line(&format!("\nOUTPUT DIRECTORY:\n{}", build_dir.display()));
        for entry in WalkDir::new(&build_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                ctx.log.line(&format!("  {}", entry.path().display()));
            }
        }
        ctx.log.line("\nCOMPILATION DONE!");
        return Ok(());
    };

    ctx.log
        .line(&format!("\nUploading program to board at {}...", port));
    let mut argv = ctx
        .config
        .cli_argv(&["upload", "--port", port.as_str(), "--fqbn"]);
    argv.push(ctx.board.platform.clone());
    argv.push(ctx.config.sketch_dir.display().to_string());

    let status = ProcessRunner::new(ctx.log).run(
        &argv,
        &ctx.config.work_dir,
        ctx.config.command_timeout,
    );
    if !status.success() {
        bail!("upload failed ({})", status);
    }
    ctx.log.line("\nDone!");
    Ok(())
}

/// Where the compile phase exports binaries.
fn output_dir(config: &BuildConfig) -> PathBuf {
    config.sketch_dir.join("build")
}

fn cleanup_build(ctx: &mut PhaseCtx) -> Result<()> {
    // Best-effort; a leftover intermediate never fails the build.
    for name in INTERMEDIATE_FILES {
        let _ = std::fs::remove_file(ctx.config.src_dir.join(name));
    }
    Ok(())
}
