//! Máquina de estados de la cola de tareas.
//!
//! Cada nodo del cluster tiene un [`Scheduler`]. Todos comparten un repositorio
//! y un [`TransactionLocker`]; toda escritura pasa por una única sección
//! crítica global, así que ningún par de ticks puede reclamar la misma tarea.
//!
//! El tick es periódico (heartbeat) y además reactivo: `queue_task`, cada
//! reclamo y cada tarea terminada disparan otro enseguida.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock, Weak},
};

use chrono::{DateTime, Utc};
use common::{
    CancelTaskMessage, ClusterId, Result, SchedulerError, SchedulerInterruptMessage, Task,
    TaskError, TaskFilter, TaskKind, TaskStatus, CANCEL_TASK_RPC, SCHEDULER_INTERRUPT_RPC,
};
use futures::FutureExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    broadcast::{Broadcaster, RemoteCall},
    config::SchedulerConfig,
    heartbeat::{HeartbeatFn, HeartbeatTimer},
    locker::TransactionLocker,
    repository::{SafeTaskRepository, SharedRepository},
    runner::{ProgressReporter, ProgressUpdate, TaskRunner},
    throttle::{Throttle, WriteFn},
    transport::ClusterTransport,
};

pub const DEFAULT_NAMESPACE: &str = "taskq";

/// Resultado de `cancel_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No había proceso que parar (pending o zombie): quedó canceled.
    Canceled,
    /// La tarea corre en este nodo; se le pidió al runner que pare.
    CancelRequested,
    /// La tarea corre en otro nodo; el pedido se difundió al cluster.
    Relayed { owner: Option<ClusterId> },
    /// La tarea corre en otro nodo y no hay broadcaster: no se hizo nada.
    NotOwned { owner: Option<ClusterId> },
}

enum CancelDecision<K: TaskKind> {
    Canceled,
    Local(Task<K>),
    Remote(Option<ClusterId>),
}

struct TickOutcome<K: TaskKind> {
    claimed: Option<Task<K>>,
    own_zombies: Vec<Task<K>>,
}

impl<K: TaskKind> Default for TickOutcome<K> {
    fn default() -> Self {
        Self {
            claimed: None,
            own_zombies: Vec::new(),
        }
    }
}

/// Reclamo concreto de una tarea: el nodo dueño y la instancia del registro.
/// Re-encolar un id crea otro registro (otro `created_on`), así que un runner
/// viejo no puede escribir sobre el reclamo nuevo aunque sea del mismo nodo.
#[derive(Debug, Clone)]
struct Claim {
    cluster: ClusterId,
    created_on: DateTime<Utc>,
}

impl Claim {
    fn holds<K: TaskKind>(&self, current: &Task<K>) -> bool {
        current.status == TaskStatus::Running
            && current.is_owned_by(&self.cluster)
            // microsegundos: lo que conserva un timestamp de Postgres
            && current.created_on.timestamp_micros() == self.created_on.timestamp_micros()
    }
}

struct RemoteCalls<K: TaskKind> {
    cancel: RemoteCall<CancelTaskMessage<K::Id>>,
    interrupt: RemoteCall<SchedulerInterruptMessage>,
}

struct SchedulerInner<K: TaskKind, L: TransactionLocker> {
    cluster_id: ClusterId,
    config: SchedulerConfig,
    initial_data: K::Data,
    repo: SafeTaskRepository<K, L>,
    runner: Arc<dyn TaskRunner<K>>,
    broadcaster: Option<Broadcaster>,
    remote: OnceLock<RemoteCalls<K>>,
    timer: OnceLock<HeartbeatTimer>,
    // ticks y ejecuciones lanzadas en segundo plano
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

pub struct Scheduler<K: TaskKind, L: TransactionLocker> {
    inner: Arc<SchedulerInner<K, L>>,
}

impl<K: TaskKind, L: TransactionLocker> Clone for Scheduler<K, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub struct SchedulerBuilder<K: TaskKind, L: TransactionLocker> {
    cluster_id: ClusterId,
    repository: SharedRepository<K>,
    locker: Arc<L>,
    runner: Arc<dyn TaskRunner<K>>,
    config: SchedulerConfig,
    initial_data: Option<K::Data>,
    transport: Option<Arc<dyn ClusterTransport>>,
    namespace: String,
}

impl<K: TaskKind, L: TransactionLocker> SchedulerBuilder<K, L> {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Datos laterales con los que nace cada tarea (por defecto `K::Data::default()`).
    pub fn initial_data(mut self, data: K::Data) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Convierte `cancel_task` y la interrupción del scheduler en RPCs de cluster.
    pub fn broadcast(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn build(self) -> Result<Scheduler<K, L>> {
        self.config.validate()?;
        let broadcaster = self
            .transport
            .map(|t| Broadcaster::new(t, self.namespace.clone()));

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                cluster_id: self.cluster_id,
                config: self.config,
                initial_data: self.initial_data.unwrap_or_default(),
                repo: SafeTaskRepository::new(self.repository, self.locker),
                runner: self.runner,
                broadcaster,
                remote: OnceLock::new(),
                timer: OnceLock::new(),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl<K: TaskKind, L: TransactionLocker> Scheduler<K, L> {
    pub fn builder(
        cluster_id: impl Into<ClusterId>,
        repository: SharedRepository<K>,
        locker: Arc<L>,
        runner: Arc<dyn TaskRunner<K>>,
    ) -> SchedulerBuilder<K, L> {
        SchedulerBuilder {
            cluster_id: cluster_id.into(),
            repository,
            locker,
            runner,
            config: SchedulerConfig::default(),
            initial_data: None,
            transport: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn from_weak(weak: &Weak<SchedulerInner<K, L>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Registra las RPCs de cluster (si hay broadcaster), arranca el heartbeat
    /// y dispara el primer tick.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.timer.get().is_some() {
            return Ok(());
        }

        if let Some(broadcaster) = &self.inner.broadcaster {
            let weak = Arc::downgrade(&self.inner);
            let cancel = broadcaster
                .register(CANCEL_TASK_RPC, move |msg: CancelTaskMessage<K::Id>| {
                    let this = Self::from_weak(&weak);
                    async move {
                        match this {
                            Some(this) => this.handle_remote_cancel(msg).await,
                            None => Ok(()),
                        }
                    }
                })
                .await?;

            let weak = Arc::downgrade(&self.inner);
            let interrupt = broadcaster
                .register(SCHEDULER_INTERRUPT_RPC, move |msg: SchedulerInterruptMessage| {
                    if let Some(this) = Self::from_weak(&weak) {
                        this.handle_remote_interrupt(msg);
                    }
                    async { Ok(()) }
                })
                .await?;

            let _ = self.inner.remote.set(RemoteCalls { cancel, interrupt });
        }

        let weak = Arc::downgrade(&self.inner);
        let tick: HeartbeatFn = Arc::new(move || {
            let this = Self::from_weak(&weak);
            async move {
                if let Some(this) = this {
                    this.tick().await;
                }
            }
            .boxed()
        });
        let timer = HeartbeatTimer::new(self.inner.config.max_progress_delay, tick);
        timer.start();
        if self.inner.timer.set(timer).is_err() {
            // otro initialize ganó la carrera; el timer sobrante se para al soltarse
            return Ok(());
        }

        info!(
            "scheduler {} inicializado (max_tasks={}, max_progress_delay={:?}, broadcast={})",
            self.inner.cluster_id,
            self.inner.config.max_tasks,
            self.inner.config.max_progress_delay,
            self.inner.broadcaster.is_some()
        );

        self.run_scheduler_interrupt();
        Ok(())
    }

    /// Para el heartbeat y las suscripciones. Las tareas en ejecución no se
    /// esperan: si el proceso muere, el barrido de zombies de otro nodo las cierra.
    pub async fn teardown(&self) {
        self.inner.shutdown.cancel();
        if let Some(timer) = self.inner.timer.get() {
            timer.stop();
        }
        if let Some(broadcaster) = &self.inner.broadcaster {
            broadcaster.shutdown().await;
        }
        match self.local_task_count().await {
            Ok(n) if n > 0 => warn!(
                "scheduler {} detenido con {} tareas todavía running",
                self.inner.cluster_id, n
            ),
            _ => info!("scheduler {} detenido", self.inner.cluster_id),
        }
    }

    pub async fn get_task(&self, id: &K::Id) -> Result<Option<Task<K>>> {
        self.inner.repo.get(id).await
    }

    /// Crea la tarea en pending y dispara un tick sin esperarlo.
    pub async fn queue_task(&self, id: K::Id, input: K::Input) -> Result<Task<K>> {
        let fresh = Task::new(
            id,
            input,
            self.inner.config.initial_progress,
            self.inner.initial_data.clone(),
        );

        let task = self
            .inner
            .repo
            .in_transaction("queue_task", move |repo| async move {
                let existing = repo.get(&fresh.id).await.map_err(SchedulerError::Repository)?;
                if let Some(existing) = existing {
                    if existing.status.is_active() {
                        return Err(SchedulerError::TaskAlreadyStarted(existing.id.to_string()));
                    }
                }
                repo.set(fresh.clone())
                    .await
                    .map_err(SchedulerError::Repository)?;
                Ok(fresh)
            })
            .await?;

        info!("tarea {} encolada en {}", task.id, self.inner.cluster_id);
        self.run_scheduler_interrupt();
        self.broadcast_interrupt();
        Ok(task)
    }

    /// Cancela una tarea.
    ///
    /// pending o zombie: pasa a canceled directamente. running en este nodo:
    /// se le pide al runner, que es quien escribe el estado final. running en
    /// otro nodo: se difunde el pedido para que lo atienda el dueño.
    pub async fn cancel_task(&self, id: K::Id) -> Result<CancelOutcome> {
        let cluster = self.inner.cluster_id.clone();
        let max_delay = self.inner.config.max_progress_delay;
        let task_id = id.clone();

        let decision = self
            .inner
            .repo
            .in_transaction("cancel_task", move |repo| async move {
                let task = repo
                    .get(&task_id)
                    .await
                    .map_err(SchedulerError::Repository)?
                    .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;

                match task.status {
                    TaskStatus::Pending => {}
                    TaskStatus::Running if task.is_stale(Utc::now(), max_delay) => {}
                    TaskStatus::Running if task.is_owned_by(&cluster) => {
                        return Ok(CancelDecision::Local(task));
                    }
                    TaskStatus::Running => return Ok(CancelDecision::Remote(task.cluster)),
                    status => return Err(SchedulerError::TaskNotRunning(task_id.to_string(), status)),
                }

                let mut canceled = task.into_canceled();
                canceled.touch();
                repo.set(canceled).await.map_err(SchedulerError::Repository)?;
                Ok(CancelDecision::Canceled)
            })
            .await?;

        match decision {
            CancelDecision::Canceled => {
                info!("tarea {} cancelada sin proceso que detener", id);
                Ok(CancelOutcome::Canceled)
            }
            CancelDecision::Local(task) => {
                info!("pidiendo al runner que cancele la tarea {}", id);
                self.inner
                    .runner
                    .cancel(&task)
                    .await
                    .map_err(SchedulerError::Runner)?;
                Ok(CancelOutcome::CancelRequested)
            }
            CancelDecision::Remote(owner) => match self.inner.remote.get() {
                Some(remote) => {
                    info!(
                        "tarea {} corre en {:?}, difundiendo la cancelación",
                        id, owner
                    );
                    remote
                        .cancel
                        .call(&CancelTaskMessage {
                            origin: self.inner.cluster_id.clone(),
                            task_id: id,
                        })
                        .await?;
                    Ok(CancelOutcome::Relayed { owner })
                }
                None => {
                    warn!(
                        "tarea {} corre en {:?} y no hay broadcaster, no se cancela",
                        id, owner
                    );
                    Ok(CancelOutcome::NotOwned { owner })
                }
            },
        }
    }

    /// Tareas running cuyo dueño es este nodo.
    pub async fn local_task_count(&self) -> Result<usize> {
        let filter =
            TaskFilter::status(TaskStatus::Running).with_cluster(self.inner.cluster_id.clone());
        Ok(self.inner.repo.query(&filter).await?.len())
    }

    /// Dispara un tick en segundo plano a través del heartbeat, que además
    /// reinicia su plazo. Los errores se loguean, nunca llegan a quien llama.
    pub(crate) fn run_scheduler_interrupt(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            match this.inner.timer.get() {
                Some(timer) => timer.run().await,
                None => debug!(
                    "scheduler {} sin inicializar, se ignora la interrupción",
                    this.inner.cluster_id
                ),
            }
        });
    }

    fn broadcast_interrupt(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.remote.get().is_none() {
            return;
        }
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            let Some(remote) = this.inner.remote.get() else {
                return;
            };
            let msg = SchedulerInterruptMessage {
                origin: this.inner.cluster_id.clone(),
            };
            if let Err(e) = remote.interrupt.call(&msg).await {
                warn!("no se pudo difundir la interrupción: {}", e);
            }
        });
    }

    async fn handle_remote_cancel(&self, msg: CancelTaskMessage<K::Id>) -> Result<()> {
        if msg.origin == self.inner.cluster_id {
            return Ok(());
        }
        let task = match self.inner.repo.get(&msg.task_id).await? {
            Some(task) => task,
            None => return Ok(()),
        };
        if task.status != TaskStatus::Running || !task.is_owned_by(&self.inner.cluster_id) {
            trace!("cancelación de {} no es para {}", msg.task_id, self.inner.cluster_id);
            return Ok(());
        }

        info!(
            "cancelación de {} recibida desde {}, avisando al runner",
            task.id, msg.origin
        );
        self.inner
            .runner
            .cancel(&task)
            .await
            .map_err(SchedulerError::Runner)
    }

    fn handle_remote_interrupt(&self, msg: SchedulerInterruptMessage) {
        if msg.origin != self.inner.cluster_id {
            self.run_scheduler_interrupt();
        }
    }

    async fn tick(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let outcome = match self.try_tick().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("tick de {} abortado: {}", self.inner.cluster_id, e);
                return;
            }
        };

        for zombie in outcome.own_zombies {
            // el runner local quizá siga vivo pero colgado: que pare
            if let Err(e) = self.inner.runner.cancel(&zombie).await {
                warn!("no se pudo cancelar la tarea zombie {}: {:?}", zombie.id, e);
            }
        }

        if let Some(task) = outcome.claimed {
            self.spawn_run(task);
            self.run_scheduler_interrupt();
        }
    }

    async fn try_tick(&self) -> Result<TickOutcome<K>> {
        let cluster = self.inner.cluster_id.clone();
        let max_tasks = self.inner.config.max_tasks;
        let max_delay = self.inner.config.max_progress_delay;
        let window = chrono::Duration::from_std(max_delay)
            .map_err(|e| SchedulerError::Config(e.to_string()))?;

        self.inner
            .repo
            .in_transaction("scheduler_tick", move |repo| async move {
                let mut outcome = TickOutcome::default();

                // 1) capacidad local
                let running = repo
                    .query(&TaskFilter::status(TaskStatus::Running).with_cluster(cluster.clone()))
                    .await
                    .map_err(SchedulerError::Repository)?;
                if running.len() >= max_tasks {
                    trace!("{} sin capacidad ({}/{})", cluster, running.len(), max_tasks);
                    return Ok(outcome);
                }

                // 2) barrido de zombies: sin latido dentro de la ventana => errored
                let threshold = Utc::now() - window;
                let stale = repo
                    .query_older_than(&TaskFilter::status(TaskStatus::Running), threshold)
                    .await
                    .map_err(SchedulerError::Repository)?;
                for zombie in stale {
                    warn!(
                        "tarea {} de {:?} sin actualizar desde {}, marcándola como zombie",
                        zombie.id, zombie.cluster, zombie.updated_on
                    );
                    let error = TaskError::zombie(zombie.cluster.as_deref(), max_delay);
                    let mut reclaimed = zombie.into_errored(error);
                    reclaimed.touch();
                    repo.set(reclaimed.clone())
                        .await
                        .map_err(SchedulerError::Repository)?;
                    if reclaimed.is_owned_by(&cluster) {
                        outcome.own_zombies.push(reclaimed);
                    }
                }

                // 3) la pending más antigua
                let pending = repo
                    .query(&TaskFilter::status(TaskStatus::Pending))
                    .await
                    .map_err(SchedulerError::Repository)?;
                let Some(mut task) = pending.into_iter().next() else {
                    return Ok(outcome);
                };

                // 4) reclamar exactamente una
                task.status = TaskStatus::Running;
                task.cluster = Some(cluster.clone());
                task.touch();
                repo.set(task.clone())
                    .await
                    .map_err(SchedulerError::Repository)?;
                info!(
                    "{} reclamó la tarea {} ({}/{} en ejecución -> +1)",
                    cluster,
                    task.id,
                    running.len(),
                    max_tasks
                );
                outcome.claimed = Some(task);
                Ok(outcome)
            })
            .await
    }

    fn spawn_run(&self, task: Task<K>) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.run_task(task).await;
        });
    }

    /// Ejecuta la tarea fuera del lock y persiste su estado final.
    async fn run_task(&self, task: Task<K>) {
        let id = task.id.clone();
        let claim = Claim {
            cluster: self.inner.cluster_id.clone(),
            created_on: task.created_on,
        };
        let reporter = self.progress_reporter(id.clone(), claim.clone());

        let result = AssertUnwindSafe(self.inner.runner.run(task, reporter.clone()))
            .catch_unwind()
            .await;

        // flush final: nada del throttle se escribe después del estado terminal
        reporter.close().await;

        match result {
            Ok(Ok(finished)) => {
                if let Err(e) = self.persist_finished(finished, claim).await {
                    error!("no se pudo guardar el resultado de la tarea {}: {}", id, e);
                }
            }
            Ok(Err(e)) => {
                error!(
                    "el runner falló con la tarea {}, queda para el barrido de zombies: {:?}",
                    id, e
                );
            }
            Err(_) => {
                error!(
                    "el runner entró en pánico con la tarea {}, queda para el barrido de zombies",
                    id
                );
            }
        }

        self.run_scheduler_interrupt();
    }

    fn progress_reporter(&self, id: K::Id, claim: Claim) -> ProgressReporter<K> {
        let repo = self.inner.repo.clone();
        let write: WriteFn<ProgressUpdate<K>> = Arc::new(move |update: ProgressUpdate<K>| {
            let repo = repo.clone();
            let id = id.clone();
            let claim = claim.clone();
            async move {
                let task_id = id.clone();
                let written = repo
                    .in_transaction("task_progress", move |raw| async move {
                        let current = raw.get(&task_id).await.map_err(SchedulerError::Repository)?;
                        let Some(mut current) = current else {
                            return Ok(false);
                        };
                        if !claim.holds(&current) {
                            return Ok(false);
                        }
                        current.progress = update.progress;
                        if let Some(data) = update.data {
                            current.data = data;
                        }
                        current.touch();
                        raw.set(current).await.map_err(SchedulerError::Repository)?;
                        Ok(true)
                    })
                    .await;

                match written {
                    Ok(true) => trace!("progreso de {} guardado", id),
                    Ok(false) => debug!("progreso de {} ignorado: el reclamo ya no es nuestro", id),
                    Err(e) => warn!("no se pudo guardar el progreso de {}: {}", id, e),
                }
            }
            .boxed()
        });

        ProgressReporter::new(Throttle::new(
            self.inner.config.effective_progress_throttle(),
            write,
        ))
    }

    /// Guarda el resultado sólo si el registro sigue siendo el que reclamamos.
    async fn persist_finished(&self, finished: Task<K>, claim: Claim) -> Result<()> {
        if !finished.status.is_terminal() {
            error!(
                "el runner devolvió la tarea {} en estado {}, no se guarda",
                finished.id, finished.status
            );
            return Ok(());
        }

        self.inner
            .repo
            .in_transaction("task_finished", move |repo| async move {
                let current = repo.get(&finished.id).await.map_err(SchedulerError::Repository)?;
                match current {
                    Some(current) if claim.holds(&current) => {}
                    Some(current) => {
                        warn!(
                            "la tarea {} está {} en {:?}, se descarta el resultado {} de {}",
                            current.id,
                            current.status,
                            current.cluster,
                            finished.status,
                            claim.cluster
                        );
                        return Ok(());
                    }
                    None => {
                        warn!("la tarea {} ya no existe, se descarta el resultado", finished.id);
                        return Ok(());
                    }
                }

                info!("tarea {} terminó como {}", finished.id, finished.status);
                let mut finished = finished;
                finished.touch();
                repo.set(finished).await.map_err(SchedulerError::Repository)
            })
            .await
    }
}
