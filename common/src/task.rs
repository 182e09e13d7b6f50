use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;

/// Identificador de la instancia (nodo) que reclama una tarea.
pub type ClusterId = String;

/// `error.type` que deja el barrido de zombies.
pub const ZOMBIE_TASK: &str = "zombie-task";

/// `error.type` para fallos reportados por el runner.
pub const RUNNER_ERROR: &str = "runner-error";

/// Agrupa los tipos de payload de una familia de tareas.
///
/// Un marcador (struct vacío) implementa este trait y fija el tipo del id,
/// del input inmutable y de los datos laterales que el runner va rellenando.
pub trait TaskKind: Debug + Clone + Send + Sync + 'static {
    type Id: Clone + Debug + Display + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static;
    type Input: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static;
    type Data: Clone + Debug + Default + Send + Sync + Serialize + DeserializeOwned + 'static;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Errored,
    Canceled,
}

impl TaskStatus {
    /// done / errored / canceled: no se sale de estos estados.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Errored | TaskStatus::Canceled)
    }

    /// pending / running: a lo sumo un nodo cree ser dueño.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Errored => "errored",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub start: f64,
    pub end: f64,
    pub current: f64,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 100.0,
            current: 0.0,
        }
    }
}

impl TaskProgress {
    pub fn new(start: f64, end: f64, current: f64) -> Self {
        Self { start, end, current }
    }

    /// Avance en [0, 1]. Con un rango vacío o invertido devuelve 0.
    pub fn fraction(&self) -> f64 {
        if self.end <= self.start {
            return 0.0;
        }
        ((self.current - self.start) / (self.end - self.start)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Error con el que el barrido marca una tarea cuyo dueño dejó de latir.
    pub fn zombie(owner: Option<&str>, max_delay: std::time::Duration) -> Self {
        Self::new(
            ZOMBIE_TASK,
            format!(
                "la tarea no se actualizó en {:?} (dueño: {})",
                max_delay,
                owner.unwrap_or("desconocido")
            ),
        )
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: RUNNER_ERROR.to_string(),
            message: err.to_string(),
            stack: Some(format!("{:?}", err)),
        }
    }
}

/// Registro persistido de una tarea.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Task<K: TaskKind> {
    pub id: K::Id,
    pub status: TaskStatus,
    /// Nodo que reclamó la tarea. Sólo tiene sentido con status=running.
    pub cluster: Option<ClusterId>,
    pub input: K::Input,
    pub data: K::Data,
    pub progress: TaskProgress,
    pub error: Option<TaskError>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl<K: TaskKind> Task<K> {
    /// Tarea nueva en estado pending.
    pub fn new(id: K::Id, input: K::Input, progress: TaskProgress, data: K::Data) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            cluster: None,
            input,
            data,
            progress,
            error: None,
            created_on: now,
            updated_on: now,
        }
    }

    /// Marca la escritura; los barridos de zombies comparan contra `updated_on`.
    pub fn touch(&mut self) {
        self.updated_on = Utc::now();
    }

    /// running sin actualizaciones durante más de `max_delay`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_delay: std::time::Duration) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        match Duration::from_std(max_delay) {
            Ok(delay) => self.updated_on < now - delay,
            Err(_) => false,
        }
    }

    pub fn is_owned_by(&self, cluster: &str) -> bool {
        self.cluster.as_deref() == Some(cluster)
    }

    pub fn into_done(mut self) -> Self {
        self.status = TaskStatus::Done;
        self.progress.current = self.progress.end;
        self.error = None;
        self
    }

    pub fn into_errored(mut self, error: TaskError) -> Self {
        self.status = TaskStatus::Errored;
        self.error = Some(error);
        self
    }

    pub fn into_canceled(mut self) -> Self {
        self.status = TaskStatus::Canceled;
        self
    }
}

/// Filtro parcial sobre el estado de una tarea (status y/o dueño).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub cluster: Option<ClusterId>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            cluster: None,
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<ClusterId>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn matches<K: TaskKind>(&self, task: &Task<K>) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(cluster) = &self.cluster {
            if task.cluster.as_ref() != Some(cluster) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct Demo;

    impl TaskKind for Demo {
        type Id = String;
        type Input = String;
        type Data = Vec<String>;
    }

    fn demo_task(id: &str) -> Task<Demo> {
        Task::new(
            id.to_string(),
            "entrada".to_string(),
            TaskProgress::default(),
            Vec::new(),
        )
    }

    #[test]
    fn status_terminal_y_activo_son_disjuntos() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Errored,
            TaskStatus::Canceled,
        ];
        for s in all {
            assert_ne!(s.is_terminal(), s.is_active(), "{s}");
        }
    }

    #[test]
    fn status_se_serializa_en_minusculas() {
        assert_eq!(serde_json::to_value(TaskStatus::Canceled).unwrap(), json!("canceled"));
        let s: TaskStatus = serde_json::from_value(json!("running")).unwrap();
        assert_eq!(s, TaskStatus::Running);
    }

    #[test]
    fn progress_fraction_se_acota() {
        assert_eq!(TaskProgress::new(0.0, 10.0, 5.0).fraction(), 0.5);
        assert_eq!(TaskProgress::new(0.0, 10.0, 50.0).fraction(), 1.0);
        assert_eq!(TaskProgress::new(10.0, 10.0, 5.0).fraction(), 0.0);
    }

    #[test]
    fn task_error_usa_campo_type() {
        let err = TaskError::zombie(Some("nodo-a"), std::time::Duration::from_secs(30));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["type"], json!(ZOMBIE_TASK));
        assert!(v["message"].as_str().unwrap().contains("nodo-a"));
    }

    #[test]
    fn task_error_desde_anyhow_guarda_stack() {
        let e = anyhow::anyhow!("se rompió").context("entrenando");
        let err = TaskError::from_error(&e);
        assert_eq!(err.kind, RUNNER_ERROR);
        assert_eq!(err.message, "entrenando");
        assert!(err.stack.unwrap().contains("se rompió"));
    }

    #[test]
    fn task_nueva_es_pending_sin_dueno() {
        let t = demo_task("t1");
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.cluster.is_none());
        assert!(t.error.is_none());
    }

    #[test]
    fn is_stale_solo_aplica_a_running() {
        let mut t = demo_task("t1");
        t.updated_on = Utc::now() - Duration::seconds(60);
        let max = std::time::Duration::from_secs(10);
        assert!(!t.is_stale(Utc::now(), max));

        t.status = TaskStatus::Running;
        assert!(t.is_stale(Utc::now(), max));

        t.touch();
        assert!(!t.is_stale(Utc::now(), max));
    }

    #[test]
    fn transiciones_del_runner_dejan_estado_terminal() {
        let done = demo_task("a").into_done();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.progress.current, done.progress.end);

        let errored = demo_task("b").into_errored(TaskError::new("x", "y"));
        assert_eq!(errored.status, TaskStatus::Errored);
        assert_eq!(errored.error.unwrap().kind, "x");

        assert_eq!(demo_task("c").into_canceled().status, TaskStatus::Canceled);
    }

    #[test]
    fn filtro_por_status_y_cluster() {
        let mut t = demo_task("t1");
        t.status = TaskStatus::Running;
        t.cluster = Some("nodo-a".to_string());

        assert!(TaskFilter::default().matches(&t));
        assert!(TaskFilter::status(TaskStatus::Running).matches(&t));
        assert!(TaskFilter::status(TaskStatus::Running)
            .with_cluster("nodo-a")
            .matches(&t));
        assert!(!TaskFilter::status(TaskStatus::Running)
            .with_cluster("nodo-b")
            .matches(&t));
        assert!(!TaskFilter::status(TaskStatus::Pending).matches(&t));
    }

    #[test]
    fn task_roundtrip_json_conserva_payload() {
        let mut t = demo_task("t1");
        t.data.push("checkpoint-1".to_string());
        let s = serde_json::to_string(&t).unwrap();
        let back: Task<Demo> = serde_json::from_str(&s).unwrap();
        assert_eq!(back.id, "t1");
        assert_eq!(back.input, "entrada");
        assert_eq!(back.data, vec!["checkpoint-1".to_string()]);
    }
}
