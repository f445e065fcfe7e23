use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use veil_core::{Compiler, PassKind, PeRuntime, ProtectConfig, RuntimeModule};

#[derive(Parser, Debug)]
#[command(name = "veil", version, about = "x86-64 PE code protector")]
struct Args {
    /// Input PE file path
    input: PathBuf,
    /// Output PE file path (default: Protected/<name> next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Companion runtime DLL with the VM and import resolver routines
    #[arg(short, long)]
    runtime: Option<PathBuf>,
    /// Comma-separated pass pipeline: virtualization, mutation, control-flow, imports
    #[arg(short, long)]
    passes: Option<String>,
    /// RNG seed, decimal or 0x-prefixed hex (random if not specified)
    #[arg(short, long, value_parser = parse_seed)]
    seed: Option<u64>,
    /// Injector section size in bytes
    #[arg(long, default_value_t = 0x2000)]
    injector_size: usize,
    /// Log every transformed instruction
    #[arg(short, long)]
    verbose: bool,
}

fn parse_seed(value: &str) -> Result<u64, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid seed {value:?}: {e}"))
}

/// `Protected/<file name>` beside the input.
fn default_output(input: &Path) -> Result<PathBuf> {
    let name = input.file_name().context("input path has no file name")?;
    let dir = input.parent().unwrap_or_else(|| Path::new(""));
    Ok(dir.join("Protected").join(name))
}

/// The pipeline to run.  Without a runtime module only the self-contained
/// passes are available.
fn pipeline(passes: Option<&str>, has_runtime: bool) -> Result<Vec<PassKind>> {
    let passes = match passes {
        Some(list) => ProtectConfig::parse_passes(list)?,
        None if has_runtime => PassKind::ALL.to_vec(),
        None => vec![PassKind::Mutation, PassKind::ControlFlow],
    };
    if !has_runtime {
        let needy: Vec<&str> = passes
            .iter()
            .filter(|pass| pass.needs_runtime())
            .map(|pass| pass.name())
            .collect();
        if !needy.is_empty() {
            bail!("{} requires a runtime module (--runtime)", needy.join(", "));
        }
    }
    Ok(passes)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let directive = if args.verbose { "veil=debug" } else { "veil=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let config = ProtectConfig {
        passes: pipeline(args.passes.as_deref(), args.runtime.is_some())?,
        seed: args.seed,
        injector_capacity: args.injector_size,
        ..ProtectConfig::default()
    };

    let runtime: Option<Box<dyn RuntimeModule>> = match &args.runtime {
        Some(path) => {
            let runtime = PeRuntime::from_path(path)
                .with_context(|| format!("failed to load runtime module {}", path.display()))?;
            debug!(functions = runtime.functions().count(), "runtime symbols indexed");
            Some(Box::new(runtime))
        }
        None => None,
    };

    let data = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    info!(input = %args.input.display(), size = data.len(), "protecting");

    let mut compiler = Compiler::from_bytes(data, config, runtime)
        .with_context(|| format!("cannot protect {}", args.input.display()))?;
    let report = compiler
        .protect()
        .with_context(|| format!("protection of {} failed", args.input.display()))?;

    let output = match args.output {
        Some(path) => path,
        None => default_output(&args.input)?,
    };
    if let Some(dir) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    compiler
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    let region = &report.region;
    println!("{} -> {}", args.input.display(), output.display());
    println!(
        "  section   {} 0x{:08X} -> 0x{:08X} ({} -> {} bytes)",
        report.section, region.old_base, region.new_base, region.old_size, region.new_size
    );
    println!("  passes    {}", report.passes.join(", "));
    println!("  seed      0x{:016X}", report.seed);
    println!("  injected  {} bytes", report.injected);
    println!(
        "  repaired  {} relocations, {} exception records, {} exports",
        report.relocations, report.exceptions, report.exports
    );
    Ok(())
}
