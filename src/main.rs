use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use sealing_scheduler::config::{AssignerKind, SchedulerConfig};
use sealing_scheduler::dashboard::{run_dashboard, DashboardState};
use sealing_scheduler::resources::WorkerResources;
use sealing_scheduler::scheduler::{SchedContext, Scheduler};
use sealing_scheduler::sector::{RegisteredSealProof, SectorId, SectorRef, TaskType};
use sealing_scheduler::selector::{AffinitySelector, TaskSelector, WorkerSelector};
use sealing_scheduler::shutdown::install_shutdown_handler;
use sealing_scheduler::worker::{action, noop_action, LocalWorker};

const GIB: u64 = 1 << 30;

/// Sealing stages every simulated sector goes through, in order.
const PIPELINE: [TaskType; 5] = [
    TaskType::AddPiece,
    TaskType::PreCommit1,
    TaskType::PreCommit2,
    TaskType::Commit1,
    TaskType::Commit2,
];

#[derive(Parser, Debug)]
#[command(name = "sealing-scheduler")]
#[command(version)]
#[command(about = "Sealing task scheduler running a simulated in-process worker fleet")]
struct Args {
    /// Assignment policy: utilization or spread
    #[arg(long, default_value = "utilization")]
    assigner: String,

    /// Number of simulated workers; every second one has a GPU
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Number of sectors to seal
    #[arg(long, default_value = "8")]
    sectors: u64,

    /// Simulated duration of each task's work phase
    #[arg(long, default_value = "200")]
    task_ms: u64,

    /// Grace period before the first scheduling pass
    #[arg(long, default_value = "500")]
    init_wait_ms: u64,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Output format of the final report
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SectorOutcome {
    sector: String,
    completed: Vec<String>,
    error: Option<String>,
    elapsed_ms: u128,
}

fn worker_resources(gpu: bool) -> WorkerResources {
    WorkerResources {
        memory_physical: 64 * GIB,
        memory_swap: 16 * GIB,
        memory_reserved: GIB,
        cpus: 8,
        gpus: if gpu { vec!["gpu0".to_string()] } else { Vec::new() },
        scratch_space: 512 * GIB,
        ..Default::default()
    }
}

async fn seal_sector(
    sched: Scheduler,
    sector: SectorRef,
    task_ms: u64,
    ctx: SchedContext,
) -> SectorOutcome {
    let started = Instant::now();
    let mut completed = Vec::new();
    let sel: Arc<dyn WorkerSelector> = Arc::new(AffinitySelector::new(
        sched.affinity(),
        sector.id,
        Arc::new(TaskSelector::new()),
    ));

    for task in PIPELINE {
        let work = action(move |_worker| async move {
            tokio::time::sleep(Duration::from_millis(task_ms)).await;
            Ok(())
        });
        if let Err(e) = sched
            .schedule(&ctx, sector, task, Arc::clone(&sel), noop_action(), work)
            .await
        {
            return SectorOutcome {
                sector: sector.id.to_string(),
                completed,
                error: Some(e.to_string()),
                elapsed_ms: started.elapsed().as_millis(),
            };
        }
        completed.push(task.short().to_string());
    }

    sched.affinity().forget(sector.id);
    SectorOutcome {
        sector: sector.id.to_string(),
        completed,
        error: None,
        elapsed_ms: started.elapsed().as_millis(),
    }
}

fn print_report(outcomes: &[SectorOutcome], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcomes)?);
        }
        OutputFormat::Table => {
            println!("{:<16} {:<22} {:>10} ERROR", "SECTOR", "COMPLETED", "ELAPSED");
            println!("{}", "-".repeat(64));
            for o in outcomes {
                println!(
                    "{:<16} {:<22} {:>8}ms {}",
                    o.sector,
                    o.completed.join(","),
                    o.elapsed_ms,
                    o.error.as_deref().unwrap_or("-")
                );
            }
            let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
            println!();
            println!("{} sectors, {} failed", outcomes.len(), failed);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let assigner: AssignerKind = args.assigner.parse()?;
    let config = SchedulerConfig::default()
        .with_assigner(assigner)
        .with_init_wait_ms(args.init_wait_ms);

    tracing::info!(
        assigner = %assigner,
        workers = args.workers,
        sectors = args.sectors,
        "Starting sealing scheduler simulation"
    );

    let (sched, sched_task) = Scheduler::start(config);
    let shutdown = install_shutdown_handler();

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let state = DashboardState {
            scheduler: sched.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    for i in 0..args.workers {
        let worker = LocalWorker::new(format!("worker-{}", i), worker_resources(i % 2 == 1));
        sched.register_worker(Arc::new(worker)).await?;
    }

    let ctx = SchedContext::with_cancel(shutdown.child_token());
    let mut sectors = JoinSet::new();
    for number in 0..args.sectors {
        let sector = SectorRef::new(SectorId::new(1000, number), RegisteredSealProof::StackedDrg2KiBV1_1);
        sectors.spawn(seal_sector(sched.clone(), sector, args.task_ms, ctx.clone()));
    }

    let mut outcomes = Vec::new();
    while let Some(res) = sectors.join_next().await {
        match res {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!(error = %e, "Sector task panicked"),
        }
    }
    outcomes.sort_by(|a, b| a.sector.cmp(&b.sector));

    if shutdown.is_cancelled() {
        tracing::info!("Shutdown requested, closing scheduler");
    }
    sched.close().await;
    if let Err(e) = sched_task.await {
        tracing::error!(error = %e, "Scheduler loop panicked");
    }

    print_report(&outcomes, &args.output)
}
