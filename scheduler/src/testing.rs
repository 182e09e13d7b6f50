//! Piezas compartidas por los tests del crate.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Task, TaskFilter, TaskKind, TaskProgress, TaskStatus};
use tokio_util::sync::CancellationToken;

use crate::{
    repository::{InMemoryTaskRepository, TaskRepository},
    runner::{ProgressReporter, TaskRunner},
};

#[derive(Debug, Clone)]
pub struct TestKind;

impl TaskKind for TestKind {
    type Id = String;
    type Input = String;
    type Data = Vec<String>;
}

pub fn task(id: &str, input: &str) -> Task<TestKind> {
    Task::new(id.to_string(), input.to_string(), TaskProgress::default(), Vec::new())
}

/// Reintenta `check` hasta que devuelva true o venza `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Logs de los tests con `RUST_LOG=scheduler=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scheduler=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/* ===== runner guionado ===== */

/// Input: el runner devuelve `Err`.
pub const FAIL: &str = "fail";
/// Input: el runner entra en pánico.
pub const PANIC: &str = "panic";
/// Input: el runner termina sin esperar.
pub const INSTANT: &str = "instant";
/// Input: 1000 reportes de progreso con 1 ms entre cada uno.
pub const SPAM: &str = "spam";

#[derive(Default)]
struct Gate {
    finish: CancellationToken,
    cancel: CancellationToken,
}

/// Runner cuyo comportamiento sale del input de la tarea. Por defecto espera
/// hasta `finish(id)` (termina done) o hasta `cancel` (termina canceled).
#[derive(Default)]
pub struct ScriptedRunner {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    started: Mutex<Vec<String>>,
    cancels: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn gate(&self, id: &str) -> Arc<Gate> {
        self.gates
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Deja terminar la tarea `id`, aunque todavía no haya arrancado.
    pub fn finish(&self, id: &str) {
        self.gate(id).finish.cancel();
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner<TestKind> for ScriptedRunner {
    async fn run(
        &self,
        mut task: Task<TestKind>,
        progress: ProgressReporter<TestKind>,
    ) -> anyhow::Result<Task<TestKind>> {
        self.started.lock().unwrap().push(task.id.clone());

        match task.input.as_str() {
            FAIL => anyhow::bail!("fallo guionado en {}", task.id),
            PANIC => panic!("pánico guionado en {}", task.id),
            INSTANT => Ok(task.into_done()),
            SPAM => {
                let mut seen = Vec::new();
                for i in 0..1000 {
                    seen.push(i.to_string());
                    let p = TaskProgress::new(0.0, 1000.0, (i + 1) as f64);
                    progress.report(p, Some(seen.clone()));
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                task.data = seen;
                Ok(task.into_done())
            }
            _ => {
                let gate = self.gate(&task.id);
                tokio::select! {
                    _ = gate.finish.cancelled() => Ok(task.into_done()),
                    _ = gate.cancel.cancelled() => Ok(task.into_canceled()),
                }
            }
        }
    }

    async fn cancel(&self, task: &Task<TestKind>) -> anyhow::Result<()> {
        self.cancels.lock().unwrap().push(task.id.clone());
        self.gate(&task.id).cancel.cancel();
        Ok(())
    }
}

/* ===== repositorio que cuenta escrituras ===== */

/// Una escritura vista por `CountingRepository`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Write {
    pub status: TaskStatus,
    pub current: f64,
}

/// Repositorio en memoria que además anota status y progreso de cada `set`.
#[derive(Clone, Default)]
pub struct CountingRepository {
    inner: InMemoryTaskRepository<TestKind>,
    writes: Arc<Mutex<HashMap<String, Vec<Write>>>>,
}

impl CountingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes_for(&self, id: &str) -> Vec<Write> {
        self.writes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.inner
            .get(&id.to_string())
            .await
            .unwrap()
            .map(|t| t.status)
    }
}

#[async_trait]
impl TaskRepository<TestKind> for CountingRepository {
    async fn get(&self, id: &String) -> anyhow::Result<Option<Task<TestKind>>> {
        self.inner.get(id).await
    }

    async fn has(&self, id: &String) -> anyhow::Result<bool> {
        self.inner.has(id).await
    }

    async fn query(&self, filter: &TaskFilter) -> anyhow::Result<Vec<Task<TestKind>>> {
        self.inner.query(filter).await
    }

    async fn query_older_than(
        &self,
        filter: &TaskFilter,
        threshold: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Task<TestKind>>> {
        self.inner.query_older_than(filter, threshold).await
    }

    async fn set(&self, task: Task<TestKind>) -> anyhow::Result<()> {
        self.writes
            .lock()
            .unwrap()
            .entry(task.id.clone())
            .or_default()
            .push(Write {
                status: task.status,
                current: task.progress.current,
            });
        self.inner.set(task).await
    }
}
