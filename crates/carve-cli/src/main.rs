use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use carve_core::context::AnalysisInput;
use carve_core::ir::Function;
use carve_core::jumptable::JumpTableOutcome;
use carve_core::pipeline::AnalysisConfig;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "carve", about = "SSA middle-end for decompiled p-code")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the raw listing of a serialized function.
    Print {
        /// Path to an analysis input JSON file.
        file: PathBuf,
    },
    /// Check every store link and block edge of a serialized function.
    Verify {
        file: PathBuf,
    },
    /// Compute non-zero masks and print them in storage order.
    Nzmask {
        file: PathBuf,
    },
    /// Recover the targets of every indirect branch.
    Recover {
        file: PathBuf,
        /// Analysis settings (JSON); defaults apply to missing fields.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the rewritten function here as JSON.
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Print outcomes as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_function(file: &Path, config: AnalysisConfig) -> Result<Function> {
    let text = fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let input = AnalysisInput::from_json(&text).with_context(|| format!("failed to parse {}", file.display()))?;
    Ok(input.into_function(config))
}

fn cmd_print(file: &Path) -> Result<()> {
    let func = load_function(file, AnalysisConfig::default())?;
    print!("{func}");
    Ok(())
}

fn cmd_verify(file: &Path) -> Result<()> {
    let func = load_function(file, AnalysisConfig::default())?;
    func.verify()
        .with_context(|| format!("{} failed verification", func.name))?;
    println!(
        "{}: ok ({} blocks, {} ops, {} varnodes)",
        func.name,
        func.blocks().len(),
        func.ops().len(),
        func.values().len()
    );
    Ok(())
}

fn cmd_nzmask(file: &Path) -> Result<()> {
    let mut func = load_function(file, AnalysisConfig::default())?;
    let report = func.calc_nz_mask();
    tracing::info!(updates = report.updates, iterations = report.iterations, "masks computed");
    for vn in func.values().iter_by_loc() {
        let node = func.vn(vn);
        if node.is_constant() {
            continue;
        }
        println!("{:<16} {:#018x}", func.display_vn(vn).to_string(), node.nz_mask());
    }
    Ok(())
}

#[derive(Serialize)]
struct OutcomeLine<'a> {
    addr: u64,
    #[serde(flatten)]
    outcome: &'a JumpTableOutcome,
}

fn cmd_recover(file: &Path, config: Option<&Path>, output: Option<&Path>, json: bool) -> Result<()> {
    let config = match config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    let mut func = load_function(file, config)?;
    func.verify()
        .with_context(|| format!("{} failed verification before recovery", func.name))?;

    let outcomes = func.recover_jump_tables()?;
    if outcomes.is_empty() {
        bail!("{} has no indirect branches", func.name);
    }
    if json {
        let lines: Vec<OutcomeLine<'_>> = outcomes
            .iter()
            .map(|(op, outcome)| OutcomeLine {
                addr: func.op(*op).addr(),
                outcome,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        for (op, outcome) in &outcomes {
            println!("{:#x}: {outcome}", func.op(*op).addr());
        }
        for warning in func.warnings() {
            eprintln!("[warn] {:#x}: {}", warning.addr, warning.message);
        }
    }

    if let Some(path) = output {
        fs::write(path, func.to_json()?).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote rewritten function");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match &cli.command {
        Command::Print { file } => cmd_print(file),
        Command::Verify { file } => cmd_verify(file),
        Command::Nzmask { file } => cmd_nzmask(file),
        Command::Recover {
            file,
            config,
            output,
            json,
        } => cmd_recover(file, config.as_deref(), output.as_deref(), *json),
    }
}
