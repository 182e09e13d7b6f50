use std::{env, str::FromStr, time::Duration};

use common::{SchedulerError, TaskProgress};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MAX_TASKS: usize = 2;
pub const DEFAULT_MAX_PROGRESS_DELAY_MS: u64 = 30_000;
pub const DEFAULT_PROGRESS_THROTTLE_MS: u64 = 15_000;

pub const ENV_MAX_TASKS: &str = "TASKQ_MAX_TASKS";
pub const ENV_MAX_PROGRESS_DELAY_MS: &str = "TASKQ_MAX_PROGRESS_DELAY_MS";
pub const ENV_PROGRESS_THROTTLE_MS: &str = "TASKQ_PROGRESS_THROTTLE_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Máximo de tareas running que este nodo ejecuta a la vez.
    pub max_tasks: usize,
    /// Sin actualizaciones durante este tiempo, una tarea running es zombie.
    /// También es el período del heartbeat del scheduler.
    pub max_progress_delay: Duration,
    /// Intervalo mínimo entre escrituras de progreso.
    pub progress_throttle: Duration,
    pub initial_progress: TaskProgress,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            max_progress_delay: Duration::from_millis(DEFAULT_MAX_PROGRESS_DELAY_MS),
            progress_throttle: Duration::from_millis(DEFAULT_PROGRESS_THROTTLE_MS),
            initial_progress: TaskProgress::default(),
        }
    }
}

/// Lee una env var; si falta o no parsea, usa el default.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl SchedulerConfig {
    /// Config por defecto sobreescrita con TASKQ_MAX_TASKS,
    /// TASKQ_MAX_PROGRESS_DELAY_MS y TASKQ_PROGRESS_THROTTLE_MS.
    pub fn from_env() -> Self {
        Self {
            max_tasks: env_or(ENV_MAX_TASKS, DEFAULT_MAX_TASKS),
            max_progress_delay: Duration::from_millis(env_or(
                ENV_MAX_PROGRESS_DELAY_MS,
                DEFAULT_MAX_PROGRESS_DELAY_MS,
            )),
            progress_throttle: Duration::from_millis(env_or(
                ENV_PROGRESS_THROTTLE_MS,
                DEFAULT_PROGRESS_THROTTLE_MS,
            )),
            initial_progress: TaskProgress::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_progress_delay.is_zero() {
            return Err(SchedulerError::Config(
                "max_progress_delay debe ser mayor que cero".to_string(),
            ));
        }
        if self.progress_throttle.is_zero() {
            return Err(SchedulerError::Config(
                "progress_throttle debe ser mayor que cero".to_string(),
            ));
        }
        if self.progress_throttle > self.max_progress_delay / 2 {
            warn!(
                "progress_throttle={:?} supera la mitad de max_progress_delay={:?}, se usará {:?}",
                self.progress_throttle,
                self.max_progress_delay,
                self.effective_progress_throttle()
            );
        }
        Ok(())
    }

    /// El throttle nunca pasa de la mitad de la ventana de zombies, así un
    /// runner que reporta progreso renueva su heartbeat a tiempo.
    pub fn effective_progress_throttle(&self) -> Duration {
        self.progress_throttle.min(self.max_progress_delay / 2)
    }
}
