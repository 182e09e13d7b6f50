use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use common::{Task, TaskStatus};
use scheduler::{
    CancelOutcome, InMemoryBus, InMemoryTaskRepository, InProcessLocker, Scheduler,
    SchedulerConfig, SharedRepository, TransactionLocker,
};
use tracing::{info, warn};

use crate::runner::{SimulatedTrainingRunner, Training, TrainingInput};

/// Cada cuánto se consulta el estado de las tareas mientras se espera.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "node")]
#[command(about = "Nodo del scheduler de tareas distribuido")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct TrainingArgs {
    /// Cantidad de entrenamientos a encolar
    #[arg(long, default_value_t = 4)]
    tasks: usize,

    #[arg(long, default_value_t = 10)]
    epochs: u32,

    /// Duración de cada época en ms
    #[arg(long, default_value_t = 200)]
    step_ms: u64,

    /// Época en la que falla la primera tarea
    #[arg(long)]
    fail_at: Option<u32>,

    /// Pisa TASKQ_MAX_TASKS
    #[arg(long)]
    max_tasks: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Levanta un nodo, encola entrenamientos y espera a que terminen
    Run {
        #[command(flatten)]
        training: TrainingArgs,

        /// Lock y bus de cluster sobre Postgres (requiere la feature `postgres`)
        #[arg(long, value_name = "URL")]
        database_url: Option<String>,
    },
    /// Simula un cluster de varios nodos dentro del proceso
    Sim {
        #[arg(long, default_value_t = 3)]
        nodes: usize,

        #[command(flatten)]
        training: TrainingArgs,

        /// Id de una tarea a cancelar desde el último nodo
        #[arg(long, value_name = "TASK_ID")]
        cancel: Option<String>,
    },
}

/// hostname + sufijo aleatorio, así dos procesos en la misma máquina no chocan.
fn cluster_id() -> String {
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

fn scheduler_config(args: &TrainingArgs) -> SchedulerConfig {
    let mut config = SchedulerConfig::from_env();
    if let Some(max) = args.max_tasks {
        config.max_tasks = max;
    }
    config
}

fn task_ids(args: &TrainingArgs) -> Vec<String> {
    (0..args.tasks).map(|i| format!("train-{}", i)).collect()
}

fn training_input(args: &TrainingArgs, index: usize) -> TrainingInput {
    TrainingInput {
        epochs: args.epochs,
        step_ms: args.step_ms,
        fail_at: if index == 0 { args.fail_at } else { None },
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            training,
            database_url,
        } => run_single(training, database_url).await,
        Commands::Sim {
            nodes,
            training,
            cancel,
        } => run_sim(nodes, training, cancel).await,
    }
}

async fn run_single(args: TrainingArgs, database_url: Option<String>) -> Result<()> {
    let config = scheduler_config(&args);
    let repo: SharedRepository<Training> = Arc::new(InMemoryTaskRepository::new());
    let runner = Arc::new(SimulatedTrainingRunner::new());

    match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            use scheduler::{ClusterTransport, PgAdvisoryLocker, PgNotifyTransport};

            let pool = sqlx::PgPool::connect(&url).await?;
            let locker = Arc::new(PgAdvisoryLocker::new(pool.clone(), "task_queue"));
            let (k1, k2) = locker.keys();
            info!("usando advisory lock ({}, {}) en {}", k1, k2, url);
            let transport: Arc<dyn ClusterTransport> = Arc::new(PgNotifyTransport::new(pool));

            let scheduler = Scheduler::builder(cluster_id(), repo, locker, runner)
                .config(config)
                .broadcast(transport)
                .build()?;
            drive_single(scheduler, &args).await
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("--database-url requiere compilar con la feature `postgres`"),
        None => {
            let scheduler =
                Scheduler::builder(cluster_id(), repo, Arc::new(InProcessLocker::new()), runner)
                    .config(config)
                    .build()?;
            drive_single(scheduler, &args).await
        }
    }
}

async fn drive_single<L: TransactionLocker>(
    scheduler: Scheduler<Training, L>,
    args: &TrainingArgs,
) -> Result<()> {
    scheduler.initialize().await?;
    info!(
        "nodo {} listo (max_tasks={})",
        scheduler.cluster_id(),
        scheduler.config().max_tasks
    );

    let ids = task_ids(args);
    for (i, id) in ids.iter().enumerate() {
        scheduler.queue_task(id.clone(), training_input(args, i)).await?;
    }

    let tasks = wait_all(&scheduler, &ids).await?;
    scheduler.teardown().await;
    print_summary(&tasks);
    Ok(())
}

async fn run_sim(nodes: usize, args: TrainingArgs, cancel: Option<String>) -> Result<()> {
    anyhow::ensure!(nodes > 0, "la simulación necesita al menos un nodo");

    let config = scheduler_config(&args);
    let repo = InMemoryTaskRepository::<Training>::new();
    let locker = Arc::new(InProcessLocker::new());
    let bus = InMemoryBus::default();
    let base = cluster_id();

    let mut cluster = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let scheduler = Scheduler::<Training, InProcessLocker>::builder(
            format!("{}-n{}", base, i),
            Arc::new(repo.clone()),
            locker.clone(),
            Arc::new(SimulatedTrainingRunner::new()),
        )
        .config(config.clone())
        .broadcast(Arc::new(bus.clone()))
        .build()?;
        scheduler.initialize().await?;
        cluster.push(scheduler);
    }
    info!("cluster simulado con {} nodos", cluster.len());

    // cada tarea se encola en un nodo distinto; la reclama quien tenga lugar
    let ids = task_ids(&args);
    for (i, id) in ids.iter().enumerate() {
        let node = &cluster[i % cluster.len()];
        node.queue_task(id.clone(), training_input(&args, i)).await?;
    }

    if let Some(id) = cancel {
        tokio::time::sleep(Duration::from_millis(args.step_ms * 2)).await;
        let node = &cluster[cluster.len() - 1];
        match node.cancel_task(id.clone()).await {
            Ok(CancelOutcome::Relayed { owner }) => {
                println!("cancelación de {} difundida (dueño: {:?})", id, owner)
            }
            Ok(outcome) => println!("cancelación de {}: {:?}", id, outcome),
            Err(e) => warn!("no se pudo cancelar {}: {}", id, e),
        }
    }

    let tasks = wait_all(&cluster[0], &ids).await?;
    for node in &cluster {
        node.teardown().await;
    }
    print_summary(&tasks);
    Ok(())
}

/// Espera a que todas las tareas terminen o a Ctrl-C.
async fn wait_all<L: TransactionLocker>(
    scheduler: &Scheduler<Training, L>,
    ids: &[String],
) -> Result<Vec<Task<Training>>> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrumpido, se abandonan las tareas en curso");
                break;
            }
            _ = ticker.tick() => {}
        }

        let tasks = collect(scheduler, ids).await?;
        let finished = tasks.iter().filter(|t| t.status.is_terminal()).count();
        let local = scheduler.local_task_count().await?;
        info!(
            "{}/{} tareas terminadas ({} corriendo en {})",
            finished,
            ids.len(),
            local,
            scheduler.cluster_id()
        );
        if finished == ids.len() {
            return Ok(tasks);
        }
    }
    collect(scheduler, ids).await
}

async fn collect<L: TransactionLocker>(
    scheduler: &Scheduler<Training, L>,
    ids: &[String],
) -> Result<Vec<Task<Training>>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = scheduler.get_task(id).await? {
            out.push(task);
        }
    }
    Ok(out)
}

fn print_summary(tasks: &[Task<Training>]) {
    println!("Resumen:");
    for t in tasks {
        let owner = t.cluster.as_deref().unwrap_or("-");
        let loss = t
            .data
            .last_loss
            .map(|l| format!("{:.4}", l))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}: {} (nodo: {}, progreso: {:.0}%, loss: {}, checkpoints: {:?})",
            t.id,
            t.status,
            owner,
            t.progress.fraction() * 100.0,
            loss,
            t.data.checkpoints
        );
        if let Some(err) = &t.error {
            println!("    error [{}]: {}", err.kind, err.message);
        }
    }

    let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
    println!(
        "  total={}, done={}, errored={}, canceled={}",
        tasks.len(),
        count(TaskStatus::Done),
        count(TaskStatus::Errored),
        count(TaskStatus::Canceled)
    );
}
