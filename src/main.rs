use anyhow::Result;
use clap::{Parser, Subcommand};
use nebula::errors::EngineError;
use nebula::gate::{Gater, TerminalPrompter};
use nebula::group::{Callbacks, GroupConfig, WorkerGroup};
use nebula::reload::{DirWatcher, HotReloader};
use nebula::runner::ProcessRunner;
use nebula::state::StateStore;
use nebula::{autofix, loader, plan, validate};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EXIT_PLAN_REJECTED: u8 = 2;
const EXIT_UNMET_DEPENDENCY: u8 = 3;
const EXIT_VALIDATION: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "nebula")]
#[command(version, about = "Concurrent orchestrator for multi-phase AI coding workflows")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a nebula directory and report categorized errors
    Validate {
        dir: PathBuf,
        /// Apply deterministic auto-corrections before reporting
        #[arg(long)]
        fix: bool,
    },
    /// Print the execution plan: waves, tracks, impact, parallelism
    Plan {
        dir: PathBuf,
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Execute the nebula
    Run {
        dir: PathBuf,
        #[arg(long)]
        max_workers: Option<usize>,
        /// External runner command; receives the phase prompt on stdin and
        /// must print a JSON outcome as its last stdout line
        #[arg(long, default_value = "claude")]
        runner_cmd: String,
        /// Disable the directory watcher (no hot-add / refactor)
        #[arg(long)]
        no_watch: bool,
    },
    /// Show the persisted state of a nebula
    State { dir: PathBuf },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "nebula=debug" } else { "nebula=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Validate { dir, fix } => cmd_validate(&dir, fix).await,
        Commands::Plan { dir, max_workers } => cmd_plan(&dir, max_workers),
        Commands::Run {
            dir,
            max_workers,
            runner_cmd,
            no_watch,
        } => cmd_run(&dir, max_workers, &runner_cmd, no_watch).await,
        Commands::State { dir } => cmd_state(&dir),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn cmd_validate(dir: &PathBuf, fix: bool) -> Result<ExitCode> {
    let mut nebula = loader::load_nebula(dir)?;

    if fix {
        match autofix::fix_or_regenerate(&mut nebula, None).await {
            Ok(fixes) => {
                for f in &fixes {
                    println!(
                        "{} [{}] {}",
                        console::style("fixed").green(),
                        f.category,
                        f.description
                    );
                }
            }
            Err(errors) => {
                report_errors(&errors);
                return Ok(ExitCode::from(EXIT_VALIDATION));
            }
        }
    }

    let errors = validate::validate(&nebula);
    if errors.is_empty() {
        println!(
            "{} {} phase(s) valid",
            console::style("ok").green().bold(),
            nebula.phases.len()
        );
        return Ok(ExitCode::SUCCESS);
    }
    report_errors(&errors);
    Ok(ExitCode::from(EXIT_VALIDATION))
}

fn report_errors(errors: &[validate::ValidationError]) {
    for err in errors {
        println!("{} {err}", console::style("invalid").red().bold());
    }
    println!("{} error(s)", errors.len());
}

fn cmd_plan(dir: &PathBuf, max_workers: Option<usize>) -> Result<ExitCode> {
    let nebula = loader::load_nebula(dir)?;
    let errors = validate::validate(&nebula);
    if !errors.is_empty() {
        report_errors(&errors);
        return Ok(ExitCode::from(EXIT_VALIDATION));
    }

    let registry = nebula.registry();
    let dag = validate::build_dag(&nebula)?;
    let workers = max_workers.unwrap_or_else(|| nebula.manifest.execution.max_workers_or_default());
    let plan = plan::ExecutionPlan::build(&registry, &dag, workers);

    println!(
        "{} {} ({} phases, {} workers)",
        console::style("plan").bold().cyan(),
        nebula.name(),
        registry.len(),
        workers
    );
    for (i, wave) in plan.waves.iter().enumerate() {
        println!(
            "  wave {i} [parallelism {}]: {}",
            plan.parallelism[i],
            wave.join(", ")
        );
    }
    for (i, track) in plan.tracks.iter().enumerate() {
        println!("  track {i}: {}", track.join(", "));
    }
    println!("  impact:");
    let mut ranked: Vec<String> = plan.impact.keys().cloned().collect();
    plan::sort_by_impact(&mut ranked, &plan.impact);
    for id in &ranked {
        let s = &plan.impact[id];
        println!(
            "    {id}: {} (dependents {}, priority {}, depth {})",
            s.value(),
            s.dependents,
            s.priority,
            s.depth
        );
    }
    for risk in &plan.risks {
        println!("  {} {risk}", console::style("risk:").yellow());
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(
    dir: &PathBuf,
    max_workers: Option<usize>,
    runner_cmd: &str,
    no_watch: bool,
) -> Result<ExitCode> {
    let nebula = loader::load_nebula(dir)?;

    // Overlap findings serialize execution rather than blocking it; every
    // other category refuses the run.
    let (overlaps, errors): (Vec<_>, Vec<_>) = validate::validate(&nebula)
        .into_iter()
        .partition(|e| e.category == validate::Category::ScopeOverlap);
    for warn in &overlaps {
        tracing::warn!(error = %warn, "scope overlap will serialize execution");
    }
    if !errors.is_empty() {
        report_errors(&errors);
        return Ok(ExitCode::from(EXIT_VALIDATION));
    }
    if let Err(e) = nebula.check_external_deps(false) {
        eprintln!("{} {e}", console::style("error:").red().bold());
        return Ok(ExitCode::from(EXIT_UNMET_DEPENDENCY));
    }

    let state = StateStore::new(dir).load()?;
    let prompter = Arc::new(TerminalPrompter::stdin(
        nebula.manifest.execution.gate_timeout(),
    ));
    let gater = Gater::new(nebula.manifest.execution.gate.clone(), prompter);
    let runner = Arc::new(ProcessRunner::new(runner_cmd, dir));

    let cfg = GroupConfig {
        max_workers: max_workers
            .unwrap_or_else(|| nebula.manifest.execution.max_workers_or_default()),
        ..Default::default()
    };

    let callbacks = Callbacks {
        progress: Some(Arc::new(|u| {
            tracing::info!(
                completed = u.completed,
                total = u.total,
                cost_usd = u.total_cost_usd,
                "progress"
            );
        })),
        on_hot_add: Some(Arc::new(|id, title, deps| {
            tracing::info!(phase = id, title, ?deps, "hot-added");
        })),
        on_refactor: Some(Arc::new(|id, pending| {
            tracing::info!(phase = id, pending, "refactor");
        })),
    };

    let mut group = WorkerGroup::new(&nebula, state, runner, gater, cfg)?
        .with_callbacks(callbacks);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing in-flight phases");
            ctrl_c_cancel.cancel();
        }
    });

    // Wire the hot reloader unless watching is disabled.
    let reload_cancel = cancel.clone();
    if !no_watch {
        let handle = group.reload_handle();
        let (changes, _watcher) = DirWatcher::start(dir)?.into_channel();
        tokio::spawn(async move {
            // The watcher must outlive the reload loop.
            let _watcher = _watcher;
            HotReloader::new(handle).run(reload_cancel, changes).await;
        });
    }

    let summary = match group.run(cancel).await {
        Ok(summary) => summary,
        Err(EngineError::PlanRejected) => {
            eprintln!("{}", console::style("plan rejected; nothing executed").yellow());
            return Ok(ExitCode::from(EXIT_PLAN_REJECTED));
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{} {} done, {} failed, {} skipped — ${:.2}",
        console::style("summary").bold().cyan(),
        summary.completed,
        summary.failed,
        summary.skipped,
        summary.total_cost_usd
    );

    if summary.interrupted && (summary.failed > 0 || summary.skipped > 0) {
        eprintln!(
            "{} {}",
            console::style("error:").red().bold(),
            EngineError::Cancelled
        );
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_state(dir: &PathBuf) -> Result<ExitCode> {
    let state = StateStore::new(dir).load()?;
    println!(
        "{} {} — ${:.2}",
        console::style("state").bold().cyan(),
        state.nebula_name,
        state.total_cost_usd
    );
    for (id, ps) in &state.phases {
        let status = match ps.status {
            nebula::PhaseStatus::Done => console::style(ps.status.to_string()).green(),
            nebula::PhaseStatus::Failed => console::style(ps.status.to_string()).red(),
            _ => console::style(ps.status.to_string()).dim(),
        };
        let bead = if ps.bead_id.is_empty() {
            String::new()
        } else {
            format!(" [{}]", ps.bead_id)
        };
        println!("  {id}: {status}{bead}");
    }
    Ok(ExitCode::SUCCESS)
}
