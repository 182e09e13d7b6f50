use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Result, Task, TaskFilter, TaskKind};
use tokio::sync::RwLock;

use crate::locker::TransactionLocker;

/// Almacenamiento durable de tareas. El id es la única clave.
#[async_trait]
pub trait TaskRepository<K: TaskKind>: Send + Sync {
    async fn get(&self, id: &K::Id) -> anyhow::Result<Option<Task<K>>>;

    async fn has(&self, id: &K::Id) -> anyhow::Result<bool>;

    /// Tareas que cumplen el filtro, de la menos a la más recientemente actualizada.
    async fn query(&self, filter: &TaskFilter) -> anyhow::Result<Vec<Task<K>>>;

    /// Como `query`, sólo las que no se actualizan desde antes de `threshold`.
    async fn query_older_than(
        &self,
        filter: &TaskFilter,
        threshold: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Task<K>>>;

    /// Inserta o reemplaza el registro con el mismo id.
    async fn set(&self, task: Task<K>) -> anyhow::Result<()>;
}

pub type SharedRepository<K> = Arc<dyn TaskRepository<K>>;

/// Repositorio en memoria. Clonarlo comparte el mismo almacenamiento, lo que
/// permite simular varios nodos sobre una misma base.
pub struct InMemoryTaskRepository<K: TaskKind> {
    tasks: Arc<RwLock<HashMap<K::Id, Task<K>>>>,
}

impl<K: TaskKind> Clone for InMemoryTaskRepository<K> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
        }
    }
}

impl<K: TaskKind> Default for InMemoryTaskRepository<K> {
    fn default() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: TaskKind> InMemoryTaskRepository<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    async fn collect<P>(&self, pred: P) -> Vec<Task<K>>
    where
        P: Fn(&Task<K>) -> bool,
    {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task<K>> = tasks.values().filter(|t| pred(*t)).cloned().collect();
        out.sort_by_key(|t| t.updated_on);
        out
    }
}

#[async_trait]
impl<K: TaskKind> TaskRepository<K> for InMemoryTaskRepository<K> {
    async fn get(&self, id: &K::Id) -> anyhow::Result<Option<Task<K>>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn has(&self, id: &K::Id) -> anyhow::Result<bool> {
        Ok(self.tasks.read().await.contains_key(id))
    }

    async fn query(&self, filter: &TaskFilter) -> anyhow::Result<Vec<Task<K>>> {
        Ok(self.collect(|t| filter.matches(t)).await)
    }

    async fn query_older_than(
        &self,
        filter: &TaskFilter,
        threshold: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Task<K>>> {
        Ok(self
            .collect(|t| filter.matches(t) && t.updated_on < threshold)
            .await)
    }

    async fn set(&self, task: Task<K>) -> anyhow::Result<()> {
        self.tasks.write().await.insert(task.id.clone(), task);
        Ok(())
    }
}

/// Envuelve un repositorio crudo: las lecturas pasan tal cual y toda
/// secuencia read-modify-write corre dentro del `TransactionLocker`.
pub struct SafeTaskRepository<K: TaskKind, L: TransactionLocker> {
    raw: SharedRepository<K>,
    locker: Arc<L>,
}

impl<K: TaskKind, L: TransactionLocker> Clone for SafeTaskRepository<K, L> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            locker: self.locker.clone(),
        }
    }
}

impl<K: TaskKind, L: TransactionLocker> SafeTaskRepository<K, L> {
    pub fn new(raw: SharedRepository<K>, locker: Arc<L>) -> Self {
        Self { raw, locker }
    }

    pub async fn get(&self, id: &K::Id) -> Result<Option<Task<K>>> {
        self.raw.get(id).await.map_err(common::SchedulerError::Repository)
    }

    pub async fn has(&self, id: &K::Id) -> Result<bool> {
        self.raw.has(id).await.map_err(common::SchedulerError::Repository)
    }

    pub async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task<K>>> {
        self.raw
            .query(filter)
            .await
            .map_err(common::SchedulerError::Repository)
    }

    pub async fn query_older_than(
        &self,
        filter: &TaskFilter,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<Task<K>>> {
        self.raw
            .query_older_than(filter, threshold)
            .await
            .map_err(common::SchedulerError::Repository)
    }

    /// Ejecuta `trx` con el repositorio crudo dentro de la sección crítica.
    pub async fn in_transaction<T, F, Fut>(&self, name: &str, trx: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(SharedRepository<K>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let raw = self.raw.clone();
        self.locker.run_in_lock(name, move || trx(raw)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locker::InProcessLocker;
    use crate::testing::{task, TestKind};
    use chrono::Duration;
    use common::{SchedulerError, TaskStatus};

    #[tokio::test]
    async fn set_reemplaza_por_id() {
        let repo = InMemoryTaskRepository::<TestKind>::new();
        repo.set(task("t1", "a")).await.unwrap();
        repo.set(task("t1", "b")).await.unwrap();

        assert_eq!(repo.len().await, 1);
        assert!(repo.has(&"t1".to_string()).await.unwrap());
        let t = repo.get(&"t1".to_string()).await.unwrap().unwrap();
        assert_eq!(t.input, "b");
        assert!(repo.get(&"otra".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filtra_y_ordena_por_antiguedad() {
        let repo = InMemoryTaskRepository::<TestKind>::new();
        let now = Utc::now();

        let mut viejo = task("viejo", "x");
        viejo.updated_on = now - Duration::seconds(30);
        let mut nuevo = task("nuevo", "x");
        nuevo.updated_on = now;
        let mut corriendo = task("corriendo", "x");
        corriendo.status = TaskStatus::Running;
        corriendo.cluster = Some("nodo-a".into());

        repo.set(nuevo).await.unwrap();
        repo.set(corriendo).await.unwrap();
        repo.set(viejo).await.unwrap();

        let pending = repo.query(&TaskFilter::status(TaskStatus::Pending)).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["viejo", "nuevo"]);

        let de_a = repo
            .query(&TaskFilter::status(TaskStatus::Running).with_cluster("nodo-a"))
            .await
            .unwrap();
        assert_eq!(de_a.len(), 1);
        let de_b = repo
            .query(&TaskFilter::status(TaskStatus::Running).with_cluster("nodo-b"))
            .await
            .unwrap();
        assert!(de_b.is_empty());
    }

    #[tokio::test]
    async fn query_older_than_usa_updated_on() {
        let repo = InMemoryTaskRepository::<TestKind>::new();
        let now = Utc::now();

        let mut stale = task("stale", "x");
        stale.status = TaskStatus::Running;
        stale.updated_on = now - Duration::seconds(120);
        let mut fresh = task("fresh", "x");
        fresh.status = TaskStatus::Running;
        fresh.updated_on = now;

        repo.set(stale).await.unwrap();
        repo.set(fresh).await.unwrap();

        let old = repo
            .query_older_than(
                &TaskFilter::status(TaskStatus::Running),
                now - Duration::seconds(60),
            )
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, "stale");
    }

    #[tokio::test]
    async fn in_transaction_propaga_errores_y_libera() {
        let raw = InMemoryTaskRepository::<TestKind>::new();
        let safe = SafeTaskRepository::new(Arc::new(raw.clone()), Arc::new(InProcessLocker::new()));

        let err = safe
            .in_transaction("falla", |_repo| async {
                Err::<(), _>(SchedulerError::TaskNotFound("t1".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound(_)));

        safe.in_transaction("escribe", |repo| async move {
            repo.set(task("t1", "x"))
                .await
                .map_err(SchedulerError::Repository)
        })
        .await
        .unwrap();

        assert!(safe.has(&"t1".to_string()).await.unwrap());
    }
}
