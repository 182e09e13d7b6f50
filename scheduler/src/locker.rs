//! Exclusión mutua para las secciones read-modify-write del scheduler.
//!
//! - [`InProcessLocker`]: una sola sección crítica a la vez dentro del proceso,
//!   en orden de llegada.
//! - `PgAdvisoryLocker` (feature `postgres`): advisory lock de Postgres para
//!   todo el cluster, anidado dentro de un `InProcessLocker` para que el proceso
//!   nunca tenga más de un pedido de lock pendiente.

use std::future::Future;

use common::Result;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::trace;

pub trait TransactionLocker: Send + Sync + 'static {
    /// Espera el lock, ejecuta `f` y lo libera tanto si `f` termina bien como
    /// si falla. Devuelve el resultado de `f`.
    fn run_in_lock<T, F, Fut>(&self, name: &str, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send;
}

/// Cola FIFO de secciones críticas dentro del proceso.
///
/// `tokio::sync::Mutex` despierta a los que esperan en orden de llegada.
#[derive(Debug, Default)]
pub struct InProcessLocker {
    queue: Mutex<()>,
}

impl InProcessLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionLocker for InProcessLocker {
    async fn run_in_lock<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let _guard = self.queue.lock().await;
        trace!("lock local tomado para {}", name);
        let result = f().await;
        trace!("lock local liberado para {}", name);
        result
    }
}

/// Deriva las dos claves `int4` del advisory lock a partir del nombre del
/// recurso: SHA-256, primeros 8 bytes, dos enteros little-endian.
pub fn advisory_lock_keys(resource: &str) -> (i32, i32) {
    let digest = Sha256::digest(resource.as_bytes());
    let k1 = i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let k2 = i32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]);
    (k1, k2)
}

#[cfg(feature = "postgres")]
pub use pg::PgAdvisoryLocker;

#[cfg(feature = "postgres")]
mod pg {
    use std::future::Future;

    use common::{Result, SchedulerError};
    use sqlx::PgPool;
    use tracing::{trace, warn};

    use super::{advisory_lock_keys, InProcessLocker, TransactionLocker};

    /// Lock de cluster sobre `pg_advisory_lock(k1, k2)`.
    ///
    /// El lock es de sesión: se toma y se suelta sobre la misma conexión del pool.
    pub struct PgAdvisoryLocker {
        pool: PgPool,
        resource: String,
        keys: (i32, i32),
        local: InProcessLocker,
    }

    impl PgAdvisoryLocker {
        pub fn new(pool: PgPool, resource: impl Into<String>) -> Self {
            let resource = resource.into();
            let keys = advisory_lock_keys(&resource);
            Self {
                pool,
                resource,
                keys,
                local: InProcessLocker::new(),
            }
        }

        pub fn keys(&self) -> (i32, i32) {
            self.keys
        }
    }

    impl TransactionLocker for PgAdvisoryLocker {
        async fn run_in_lock<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
        where
            T: Send,
            F: FnOnce() -> Fut + Send,
            Fut: Future<Output = Result<T>> + Send,
        {
            let (k1, k2) = self.keys;
            let pool = self.pool.clone();
            let resource = self.resource.clone();
            let name_owned = name.to_string();

            self.local
                .run_in_lock(name, move || async move {
                    let mut conn = pool
                        .acquire()
                        .await
                        .map_err(|e| SchedulerError::Lock(e.into()))?;

                    sqlx::query("SELECT pg_advisory_lock($1, $2)")
                        .bind(k1)
                        .bind(k2)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| SchedulerError::Lock(e.into()))?;
                    trace!("advisory lock {} tomado para {}", resource, name_owned);

                    let result = f().await;

                    let unlocked = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                        .bind(k1)
                        .bind(k2)
                        .execute(&mut *conn)
                        .await;
                    if let Err(e) = unlocked {
                        // la conexión puede seguir con el lock tomado: se descarta
                        warn!(
                            "no se pudo liberar el advisory lock {} ({}): {:?}",
                            resource, name_owned, e
                        );
                        conn.detach();
                    }

                    result
                })
                .await
        }
    }
}
