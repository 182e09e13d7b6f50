use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{Task, TaskError, TaskKind, TaskProgress, RUNNER_ERROR};
use scheduler::{ProgressReporter, TaskRunner};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cada cuántas épocas se guarda un checkpoint.
const CHECKPOINT_EVERY: u32 = 5;

/// Entrenamiento simulado: `epochs` pasos de `step_ms` cada uno.
#[derive(Debug, Clone)]
pub struct Training;

impl TaskKind for Training {
    type Id = String;
    type Input = TrainingInput;
    type Data = TrainingData;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingInput {
    pub epochs: u32,
    pub step_ms: u64,
    /// Época en la que el entrenamiento falla (para probar errored).
    pub fail_at: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingData {
    pub last_loss: Option<f64>,
    pub checkpoints: Vec<u32>,
}

/// Runner de juguete. La cancelación es cooperativa: se revisa entre épocas.
#[derive(Default)]
pub struct SimulatedTrainingRunner {
    // id -> (ejecución, token); sólo existe mientras la tarea corre acá
    tokens: Mutex<HashMap<String, (u64, CancellationToken)>>,
    runs: AtomicU64,
}

impl SimulatedTrainingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token nuevo para esta ejecución; una cancelación anterior no cuenta.
    fn register(&self, id: &str) -> (u64, CancellationToken) {
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), (run, token.clone()));
        (run, token)
    }

    /// Saca el token sólo si sigue siendo el de esta ejecución.
    fn forget(&self, id: &str, run: u64) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if tokens.get(id).is_some_and(|(current, _)| *current == run) {
            tokens.remove(id);
        }
    }

    async fn train(
        &self,
        mut task: Task<Training>,
        progress: &ProgressReporter<Training>,
        token: &CancellationToken,
    ) -> Task<Training> {
        let input = task.input.clone();
        let step = Duration::from_millis(input.step_ms);
        let mut data = task.data.clone();

        for epoch in 1..=input.epochs {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("entrenamiento {} cancelado en la época {}", task.id, epoch);
                    task.data = data;
                    return task.into_canceled();
                }
                _ = tokio::time::sleep(step) => {}
            }

            if input.fail_at == Some(epoch) {
                task.data = data;
                return task.into_errored(TaskError::new(
                    RUNNER_ERROR,
                    format!("fallo simulado en la época {}", epoch),
                ));
            }

            let loss = 1.0 / (epoch as f64 + 1.0);
            data.last_loss = Some(loss);
            if epoch % CHECKPOINT_EVERY == 0 {
                data.checkpoints.push(epoch);
            }
            debug!("{}: época {}/{} loss={:.4}", task.id, epoch, input.epochs, loss);
            progress.report(
                TaskProgress::new(0.0, input.epochs as f64, epoch as f64),
                Some(data.clone()),
            );
        }

        task.data = data;
        task.into_done()
    }
}

#[async_trait]
impl TaskRunner<Training> for SimulatedTrainingRunner {
    async fn run(
        &self,
        task: Task<Training>,
        progress: ProgressReporter<Training>,
    ) -> anyhow::Result<Task<Training>> {
        let id = task.id.clone();
        let (run, token) = self.register(&id);
        info!("arrancando entrenamiento {} ({} épocas)", id, task.input.epochs);

        let finished = self.train(task, &progress, &token).await;
        self.forget(&id, run);
        Ok(finished)
    }

    async fn cancel(&self, task: &Task<Training>) -> anyhow::Result<()> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(&task.id) {
            Some((_, token)) => token.cancel(),
            None => debug!("{} no corre en este runner, nada que cancelar", task.id),
        }
        Ok(())
    }
}
