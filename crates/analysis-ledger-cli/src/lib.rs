//! Operator command surface for the analysis ledger.
//!
//! Every command that can write a cycle summary bootstraps the ledger first;
//! a failed startup verification is reported and the command exits non-zero.
//! Machine-readable output goes to stdout, logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use analysis_ledger_journal::{JsonlWriter, WriterOptions};
use analysis_ledger_scheduler::{
    spawn_timer, CycleOutcome, CycleScheduler, CycleTrace, HealthMonitor, NoEvents,
    PhaseRegistry, SchedulerConfig, TRACES_FILE,
};
use analysis_ledger_store::{Ledger, VerificationReport};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "al")]
#[command(about = "Analysis ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./analysis-ledger")]
    data_dir: PathBuf,

    /// JSON scheduler config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    Cycle {
        #[command(subcommand)]
        command: CycleCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Health,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Verify(VerifyArgs),
    Head,
    Append(AppendArgs),
    Snapshot,
    Repair,
    Status,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Also check prev-root links and cycle id continuity.
    #[arg(long)]
    deep: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AppendArgs {
    #[arg(long)]
    kind: String,
    #[arg(long, default_value = "{}")]
    data: String,
}

#[derive(Debug, Subcommand)]
pub enum CycleCommand {
    Run,
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Stop after this many cycles, counting the immediate first run.
    #[arg(long)]
    max_cycles: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Check,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };
    init_tracing(&config.log_level);

    match cli.command {
        Command::Ledger { command } => run_ledger(command, &cli.data_dir, &config),
        Command::Cycle { command } => run_cycle(command, &cli.data_dir, &config),
        Command::Config {
            command: ConfigCommand::Check,
        } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Health => run_health(&cli.data_dir, &config),
    }
}

/// Installs the stderr subscriber; `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_ledger(command: LedgerCommand, dir: &Path, config: &SchedulerConfig) -> Result<()> {
    let mut ledger = Ledger::open(dir, config.ledger_options())?;

    match command {
        LedgerCommand::Verify(args) => {
            let report = ledger.verify_chain(args.deep)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.valid {
                Ok(())
            } else {
                Err(anyhow!(
                    "ledger verification failed with {} issue(s)",
                    report.issues.len()
                ))
            }
        }
        LedgerCommand::Head => {
            let head = ledger.head()?;
            println!("{}", serde_json::to_string_pretty(&head)?);
            Ok(())
        }
        LedgerCommand::Append(args) => {
            let data: Value = serde_json::from_str(&args.data)
                .with_context(|| format!("invalid --data JSON: {}", args.data))?;
            let id = ledger.append(&args.kind, data)?;
            ledger.flush()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({"id": id.to_string()}))?
            );
            Ok(())
        }
        LedgerCommand::Snapshot => {
            let snapshot = ledger.snapshot()?;
            ledger.flush()?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        LedgerCommand::Repair => {
            let report = ledger.bootstrap()?;
            if report.valid {
                info!("cycle chain verified; repair has nothing to drop");
            }
            let repair = ledger.repair_chain()?;
            println!("{}", serde_json::to_string_pretty(&repair)?);
            Ok(())
        }
        LedgerCommand::Status => {
            let _ = ledger.bootstrap()?;
            println!("{}", serde_json::to_string_pretty(&ledger.status()?)?);
            Ok(())
        }
    }
}

fn run_cycle(command: CycleCommand, dir: &Path, config: &SchedulerConfig) -> Result<()> {
    let scheduler = open_scheduler(dir, config)?;

    match command {
        CycleCommand::Run => {
            let outcome = scheduler.run_cycle();
            scheduler.with_ledger(Ledger::flush)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            match outcome {
                CycleOutcome::Failed { reason } => Err(anyhow!("cycle failed: {reason}")),
                _ => Ok(()),
            }
        }
        CycleCommand::Watch(args) => {
            if args.max_cycles == Some(0) {
                return Ok(());
            }
            let scheduler = Arc::new(scheduler);
            let first = scheduler.run_cycle();
            println!("{}", serde_json::to_string(&first)?);

            let remaining = args.max_cycles.map(|max| max - 1);
            if remaining != Some(0) {
                let timer = spawn_timer(Arc::clone(&scheduler), config.interval(), remaining)?;
                let ticks = timer.join()?;
                info!(ticks, "cycle watch finished");
            }

            scheduler.with_ledger(Ledger::flush)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&scheduler.health().snapshot())?
            );
            Ok(())
        }
    }
}

fn run_health(dir: &Path, config: &SchedulerConfig) -> Result<()> {
    let mut ledger = Ledger::open(dir, config.ledger_options())?;
    let _ = ledger.bootstrap()?;

    let traces = JsonlWriter::new(dir.join(TRACES_FILE), WriterOptions::default());
    let history: Vec<CycleTrace> = traces.read_all()?;
    let monitor = HealthMonitor::from_traces(&history);
    monitor.set_safe_mode(ledger.is_safe_mode());

    let payload = serde_json::json!({
        "health": monitor.snapshot(),
        "ledger": ledger.status()?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn open_scheduler(dir: &Path, config: &SchedulerConfig) -> Result<CycleScheduler> {
    let (scheduler, report) = CycleScheduler::open(
        dir,
        config,
        PhaseRegistry::standard(),
        Box::new(NoEvents),
    )?;
    if !report.valid {
        print_report(&report);
        return Err(anyhow!(
            "ledger is in safe mode: {}; run `al ledger repair` and retry",
            report.summary()
        ));
    }
    Ok(scheduler)
}

fn print_report(report: &VerificationReport) {
    println!("valid: {}", report.valid);
    println!("deep: {}", report.deep);
    println!("records_checked: {}", report.records_checked);
    println!("snapshots_checked: {}", report.snapshots_checked);
    println!("cycles_checked: {}", report.cycles_checked);
    for issue in &report.issues {
        println!("- {}: {}", issue.code, issue.message);
    }
}
