use async_trait::async_trait;
use common::{Task, TaskKind, TaskProgress};

use crate::throttle::Throttle;

/// Backend que ejecuta el trabajo real de una tarea.
#[async_trait]
pub trait TaskRunner<K: TaskKind>: Send + Sync {
    /// Ejecuta la tarea y devuelve el registro ya terminado
    /// (`into_done`, `into_errored` o `into_canceled`).
    ///
    /// Lo ideal es que el runner cierre la tarea él mismo incluso ante fallos
    /// internos; si devuelve `Err` la tarea queda running hasta que el barrido
    /// de zombies la marque como errored.
    async fn run(&self, task: Task<K>, progress: ProgressReporter<K>) -> anyhow::Result<Task<K>>;

    /// Pedido de cancelación cooperativa. La tarea sigue corriendo hasta que
    /// `run` devuelva el registro cancelado.
    async fn cancel(&self, task: &Task<K>) -> anyhow::Result<()>;
}

/// Lo que el runner escribe en cada reporte de progreso.
#[derive(Debug, Clone)]
pub struct ProgressUpdate<K: TaskKind> {
    pub progress: TaskProgress,
    pub data: Option<K::Data>,
}

/// Callback de progreso que recibe el runner. Se puede llamar muy seguido:
/// las escrituras al repositorio pasan por un throttle.
pub struct ProgressReporter<K: TaskKind> {
    throttle: Throttle<ProgressUpdate<K>>,
}

impl<K: TaskKind> Clone for ProgressReporter<K> {
    fn clone(&self) -> Self {
        Self {
            throttle: self.throttle.clone(),
        }
    }
}

impl<K: TaskKind> ProgressReporter<K> {
    pub fn new(throttle: Throttle<ProgressUpdate<K>>) -> Self {
        Self { throttle }
    }

    pub fn report(&self, progress: TaskProgress, data: Option<K::Data>) {
        self.throttle.call(ProgressUpdate { progress, data });
    }

    pub(crate) async fn close(&self) {
        self.throttle.close().await;
    }
}
