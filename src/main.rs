//! apktwin CLI
//!
//! Entry point for the `apktwin` command-line tool.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use apktwin::align::{align_file, verify_alignment, AlignOptions, DEFAULT_ALIGNMENT, DEFAULT_PAGE_SIZE};
use apktwin::config::{set_path, user_config_path, EffectiveConfig};
use apktwin::rewrite::rewrite_tree;
use apktwin::signal::SignalHandler;
use apktwin::toolchain::Toolchain;
use apktwin::{CancellationToken, ExitCode, Pipeline, ProcessRunner};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apktwin")]
#[command(about = "Repackage an APK under a side-by-side package identifier", version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on an archive
    Run {
        /// Archive to repackage
        apk: PathBuf,

        /// Config file layered over the user config
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Parent of per-archive workspaces
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Parent of per-archive output directories
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Segment inserted into the package identifier
        #[arg(long)]
        segment: Option<String>,

        /// Skip zip alignment before signing
        #[arg(long)]
        no_align: bool,

        /// Per-tool time limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite the package identifier of an extracted tree
    Rewrite {
        /// Decompiled tree containing AndroidManifest.xml
        tree: PathBuf,

        /// Segment inserted into the package identifier
        #[arg(long)]
        segment: Option<String>,

        /// Insert again if the identifier already carries the segment
        #[arg(long)]
        allow_reinsert: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Align stored entries of an archive
    Align {
        input: PathBuf,
        output: PathBuf,

        /// Byte boundary for stored entries
        #[arg(long, default_value_t = DEFAULT_ALIGNMENT)]
        alignment: u16,

        /// Page-align stored native libraries
        #[arg(long)]
        page_align_libs: bool,
    },

    /// Verify alignment of an archive (exit 0 if aligned)
    Check {
        apk: PathBuf,

        #[arg(long, default_value_t = DEFAULT_ALIGNMENT)]
        alignment: u16,

        #[arg(long)]
        page_align_libs: bool,
    },

    /// Print the effective configuration with provenance
    Config {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::Usage.as_i32()
        }
    };
    process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            apk,
            config,
            work_dir,
            output_dir,
            segment,
            no_align,
            timeout,
            json,
        } => {
            let mut overrides = Value::Object(Default::default());
            if let Some(dir) = work_dir {
                set_path(&mut overrides, "paths.work_dir", json!(dir));
            }
            if let Some(dir) = output_dir {
                set_path(&mut overrides, "paths.output_dir", json!(dir));
            }
            if let Some(segment) = segment {
                set_path(&mut overrides, "rewrite.segment", json!(segment));
            }
            if no_align {
                set_path(&mut overrides, "align.enabled", json!(false));
            }
            if let Some(secs) = timeout {
                set_path(&mut overrides, "tools.timeout_seconds", json!(secs));
            }
            run_pipeline(&apk, config.as_deref(), overrides, json)
        }
        Commands::Rewrite {
            tree,
            segment,
            allow_reinsert,
            json,
        } => {
            let mut overrides = Value::Object(Default::default());
            if let Some(segment) = segment {
                set_path(&mut overrides, "rewrite.segment", json!(segment));
            }
            if allow_reinsert {
                set_path(&mut overrides, "rewrite.allow_reinsert", json!(true));
            }
            run_rewrite(&tree, overrides, json)
        }
        Commands::Align {
            input,
            output,
            alignment,
            page_align_libs,
        } => run_align(&input, &output, align_options(alignment, page_align_libs)),
        Commands::Check {
            apk,
            alignment,
            page_align_libs,
        } => run_check(&apk, align_options(alignment, page_align_libs)),
        Commands::Config { config, json } => run_config(config.as_deref(), json),
    }
}

fn load_config(explicit: Option<&Path>, overrides: Value) -> Result<EffectiveConfig> {
    let cli = match &overrides {
        Value::Object(map) if map.is_empty() => None,
        _ => Some(overrides),
    };
    let user = user_config_path();
    EffectiveConfig::build(user.as_deref(), explicit, cli).context("loading configuration")
}

fn align_options(alignment: u16, page_align_libs: bool) -> AlignOptions {
    AlignOptions {
        alignment,
        page_align_libs,
        page_size: DEFAULT_PAGE_SIZE,
    }
}

fn run_pipeline(apk: &Path, explicit: Option<&Path>, overrides: Value, json: bool) -> Result<i32> {
    let settings = load_config(explicit, overrides)?.into_settings();

    let missing = Toolchain::from_settings(&settings).missing_jars();
    if !missing.is_empty() {
        let list: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        bail!("required tools not found: {}", list.join(", "));
    }

    let token = CancellationToken::new();
    SignalHandler::new(token.clone())
        .install()
        .context("installing signal handler")?;

    let pipeline =
        Pipeline::new(settings, Arc::new(ProcessRunner::new())).with_cancellation(token);
    let outcome = pipeline.run(apk);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if let Some(artifact) = outcome.artifact() {
        println!("{}", artifact.path.display());
    } else {
        eprintln!("{}", outcome.describe());
    }
    Ok(outcome.exit_code().as_i32())
}

fn run_rewrite(tree: &Path, overrides: Value, json: bool) -> Result<i32> {
    let settings = load_config(None, overrides)?.into_settings();
    let report = rewrite_tree(tree, &settings.rewrite_options())
        .with_context(|| format!("rewriting {}", tree.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} -> {}", report.old_identifier, report.new_identifier);
        println!("  files rewritten: {}", report.rewritten_files.len());
        for relocation in &report.relocations {
            println!(
                "  moved {} -> {}",
                relocation.from.display(),
                relocation.to.display()
            );
        }
    }
    Ok(ExitCode::Success.as_i32())
}

fn run_align(input: &Path, output: &Path, options: AlignOptions) -> Result<i32> {
    let report = align_file(input, output, &options)
        .with_context(|| format!("aligning {}", input.display()))?;
    info!(
        entries = report.entries.len(),
        stored = report.stored_count(),
        padded = report.padded_count(),
        "aligned"
    );
    println!(
        "{}: {} entries, {} stored, {} bytes of padding",
        output.display(),
        report.entries.len(),
        report.stored_count(),
        report.total_padding()
    );
    Ok(ExitCode::Success.as_i32())
}

fn run_check(apk: &Path, options: AlignOptions) -> Result<i32> {
    let misaligned = verify_alignment(apk, &options)
        .with_context(|| format!("checking {}", apk.display()))?;
    if misaligned.is_empty() {
        println!("{}: aligned", apk.display());
        return Ok(ExitCode::Success.as_i32());
    }
    for entry in &misaligned {
        println!(
            "{} at {} (not a multiple of {})",
            entry.name, entry.data_offset, entry.alignment
        );
    }
    println!("{}: {} misaligned entries", apk.display(), misaligned.len());
    Ok(ExitCode::Usage.as_i32())
}

fn run_config(explicit: Option<&Path>, json: bool) -> Result<i32> {
    let effective = load_config(explicit, Value::Object(Default::default()))?;
    if json {
        println!("{}", effective.to_json()?);
        return Ok(ExitCode::Success.as_i32());
    }

    for source in &effective.sources {
        match &source.path {
            Some(path) => println!("# {:?}: {}", source.origin, path),
            None => println!("# {:?}", source.origin),
        }
    }
    debug!(redactions = effective.redactions.len(), "config loaded");
    println!("{}", serde_json::to_string_pretty(&effective.config)?);
    Ok(ExitCode::Success.as_i32())
}
