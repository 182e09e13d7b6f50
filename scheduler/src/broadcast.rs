use std::{future::Future, marker::PhantomData, sync::Arc};

use common::{Result, SchedulerError};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::transport::ClusterTransport;

/// Convierte funciones locales en RPCs de cluster sobre pub/sub.
///
/// Entrega al-menos-una-vez y sin confirmación: si un mensaje se pierde, la
/// operación no se observa hasta el próximo barrido o un reintento manual.
pub struct Broadcaster {
    transport: Arc<dyn ClusterTransport>,
    namespace: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Proxy que publica los argumentos en el canal de la RPC.
pub struct RemoteCall<A> {
    transport: Arc<dyn ClusterTransport>,
    channel: String,
    _args: PhantomData<fn(A)>,
}

impl<A> Clone for RemoteCall<A> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            channel: self.channel.clone(),
            _args: PhantomData,
        }
    }
}

impl<A: Serialize> RemoteCall<A> {
    pub async fn call(&self, args: &A) -> Result<()> {
        let payload =
            serde_json::to_string(args).map_err(|e| SchedulerError::Transport(e.into()))?;
        self.transport
            .publish(&self.channel, payload)
            .await
            .map_err(SchedulerError::Transport)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Broadcaster {
    /// `namespace` separa los canales de distintas colas sobre el mismo transporte.
    pub fn new(transport: Arc<dyn ClusterTransport>, namespace: impl Into<String>) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn channel_for(&self, rpc: &str) -> String {
        format!("{}_{}", self.namespace, rpc.replace('-', "_"))
    }

    /// Se suscribe al canal de `rpc` y ejecuta `handler` con cada mensaje.
    /// Los errores del handler se loguean y no cortan la suscripción.
    pub async fn register<A, F, Fut>(&self, rpc: &str, handler: F) -> Result<RemoteCall<A>>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let channel = self.channel_for(rpc);
        let mut messages = self
            .transport
            .subscribe(&channel)
            .await
            .map_err(SchedulerError::Transport)?;

        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();
        let ch = channel.clone();
        self.tracker.spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(p) => p,
                        None => break,
                    },
                };

                let args: A = match serde_json::from_str(&payload) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("mensaje inválido en {}: {:?}", ch, e);
                        continue;
                    }
                };

                debug!("RPC recibida en {}", ch);
                let fut = handler(args);
                let ch = ch.clone();
                tracker.spawn(async move {
                    if let Err(e) = fut.await {
                        warn!("handler de {} falló: {}", ch, e);
                    }
                });
            }
            debug!("suscripción a {} cerrada", ch);
        });

        Ok(RemoteCall {
            transport: self.transport.clone(),
            channel,
            _args: PhantomData,
        })
    }

    /// Corta las suscripciones y espera a los handlers en curso.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryBus;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn call_llega_al_handler_de_cada_nodo() {
        let bus = Arc::new(InMemoryBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let nodo_a = Broadcaster::new(bus.clone(), "test");
        let nodo_b = Broadcaster::new(bus.clone(), "test");

        let s = seen.clone();
        let proxy = nodo_a
            .register("ping", move |p: Ping| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(("a", p.n));
                    Ok(())
                }
            })
            .await
            .unwrap();
        let s = seen.clone();
        nodo_b
            .register("ping", move |p: Ping| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(("b", p.n));
                    Ok(())
                }
            })
            .await
            .unwrap();

        proxy.call(&Ping { n: 7 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![("a", 7), ("b", 7)]);

        nodo_a.shutdown().await;
        nodo_b.shutdown().await;
    }

    #[tokio::test]
    async fn mensajes_invalidos_y_errores_no_cortan_la_suscripcion() {
        let bus = Arc::new(InMemoryBus::default());
        let b = Broadcaster::new(bus.clone(), "test");
        let count = Arc::new(Mutex::new(0));

        let c = count.clone();
        let proxy = b
            .register("ping", move |p: Ping| {
                let c = c.clone();
                async move {
                    *c.lock().unwrap() += 1;
                    if p.n == 0 {
                        return Err(SchedulerError::TaskNotFound("0".into()));
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        bus.publish(proxy.channel(), "no es json".to_string())
            .await
            .unwrap();
        proxy.call(&Ping { n: 0 }).await.unwrap();
        proxy.call(&Ping { n: 1 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*count.lock().unwrap(), 2);
        b.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_deja_de_recibir() {
        let bus = Arc::new(InMemoryBus::default());
        let b = Broadcaster::new(bus.clone(), "test");
        let count = Arc::new(Mutex::new(0));

        let c = count.clone();
        let proxy = b
            .register("ping", move |_p: Ping| {
                let c = c.clone();
                async move {
                    *c.lock().unwrap() += 1;
                    Ok(())
                }
            })
            .await
            .unwrap();

        b.shutdown().await;
        proxy.call(&Ping { n: 1 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
