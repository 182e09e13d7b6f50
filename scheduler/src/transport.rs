//! Canal pub/sub del cluster. Sólo se usa para difundir RPCs (cancelación e
//! interrupción del scheduler), nunca para estado.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Mensajes recibidos en un canal. El payload es texto (JSON).
pub type Subscription = BoxStream<'static, String>;

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()>;

    /// La suscripción sigue activa mientras no se suelte el stream.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription>;
}

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Bus en memoria: un `broadcast` por canal. Clonarlo comparte los canales,
/// así varios schedulers del mismo proceso se ven entre sí.
#[derive(Clone)]
pub struct InMemoryBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = channels.get(name) {
                return tx.clone();
            }
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl ClusterTransport for InMemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()> {
        // sin suscriptores el mensaje se pierde, igual que en un pub/sub real
        let _ = self.channel(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        let rx = self.channel(channel).subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|msg| async move { msg.ok() })
            .boxed())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgNotifyTransport;

#[cfg(feature = "postgres")]
mod pg {
    use async_trait::async_trait;
    use futures::StreamExt;
    use sqlx::{postgres::PgListener, PgPool};
    use tracing::warn;

    use super::{ClusterTransport, Subscription};

    /// Transporte sobre LISTEN/NOTIFY.
    #[derive(Clone)]
    pub struct PgNotifyTransport {
        pool: PgPool,
    }

    impl PgNotifyTransport {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl ClusterTransport for PgNotifyTransport {
        async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()> {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel)
                .bind(payload)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
            let mut listener = PgListener::connect_with(&self.pool).await?;
            listener.listen(channel).await?;
            Ok(listener
                .into_stream()
                .filter_map(|msg| async move {
                    match msg {
                        Ok(n) => Some(n.payload().to_string()),
                        Err(e) => {
                            warn!("error leyendo notificación: {:?}", e);
                            None
                        }
                    }
                })
                .boxed())
        }
    }
}
