use thiserror::Error;

use crate::task::TaskStatus;

/// Errores que el scheduler devuelve a quien lo llama.
///
/// Los colaboradores externos (repositorio, runner, transporte) trabajan con
/// `anyhow::Error`; aquí se envuelven en la variante que corresponde.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("la tarea {0} no existe")]
    TaskNotFound(String),

    #[error("la tarea {0} ya está pendiente o en ejecución")]
    TaskAlreadyStarted(String),

    #[error("la tarea {0} no se puede cancelar en estado {1}")]
    TaskNotRunning(String, TaskStatus),

    #[error("error de repositorio: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("error adquiriendo el lock: {0}")]
    Lock(#[source] anyhow::Error),

    #[error("error del runner: {0}")]
    Runner(#[source] anyhow::Error),

    #[error("error de transporte del cluster: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("configuración inválida: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
