use std::{sync::Arc, sync::Mutex, time::Duration};

use futures::future::BoxFuture;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type HeartbeatFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// "Anti-throttle": garantiza que `func` se ejecute al menos cada `period`.
///
/// `run()` ejecuta la función en el momento y reinicia el plazo; si nadie
/// llama a `run()` antes de que venza, el loop de fondo la dispara solo.
pub struct HeartbeatTimer {
    period: Duration,
    func: HeartbeatFn,
    reset: Arc<Notify>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatTimer {
    pub fn new(period: Duration, func: HeartbeatFn) -> Self {
        Self {
            period,
            func,
            reset: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Arranca el loop de fondo. Llamarlo de nuevo no hace nada.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let period = self.period;
        let func = self.func.clone();
        let reset = self.reset.clone();
        let shutdown = self.shutdown.clone();

        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    // run() manual: vuelve a empezar el plazo
                    _ = reset.notified() => continue,
                    _ = tokio::time::sleep(period) => {
                        debug!("heartbeat vencido tras {:?}, disparando", period);
                        func().await;
                    }
                }
            }
        }));
    }

    /// Reinicia el plazo y ejecuta la función ahora.
    pub async fn run(&self) {
        self.reset.notify_one();
        (self.func)().await;
    }

    /// Cancela los disparos pendientes. Una ejecución en curso termina sola.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
