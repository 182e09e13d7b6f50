use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::time::Instant;

pub type WriteFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Throttle con flush para escrituras de progreso.
///
/// - La primera llamada escribe enseguida.
/// - Después escribe el último valor recibido como mucho una vez por `interval`.
/// - Las escrituras nunca se solapan.
/// - `flush()` escribe lo pendiente ya; `close()` además apaga el throttle.
pub struct Throttle<T> {
    inner: Arc<ThrottleInner<T>>,
}

impl<T> Clone for Throttle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ThrottleInner<T> {
    interval: Duration,
    write: WriteFn<T>,
    state: Mutex<ThrottleState<T>>,
    // serializa escrituras; quien escribe toma el valor pendiente con este lock tomado
    writer: tokio::sync::Mutex<()>,
}

struct ThrottleState<T> {
    pending: Option<T>,
    last_write: Option<Instant>,
    armed: bool,
    closed: bool,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new(interval: Duration, write: WriteFn<T>) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                interval,
                write,
                state: Mutex::new(ThrottleState {
                    pending: None,
                    last_write: None,
                    armed: false,
                    closed: false,
                }),
                writer: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Registra un valor. Barato y seguro de llamar muy seguido.
    pub fn call(&self, value: T) {
        let delay = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.pending = Some(value);
            if state.armed {
                return;
            }
            state.armed = true;
            match state.last_write {
                Some(at) => self.inner.interval.saturating_sub(at.elapsed()),
                None => Duration::ZERO,
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _writing = inner.writer.lock().await;
            let value = {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.armed = false;
                if state.closed {
                    None
                } else {
                    state.last_write = Some(Instant::now());
                    state.pending.take()
                }
            };
            if let Some(value) = value {
                (inner.write)(value).await;
            }
        });
    }

    /// Escribe el valor pendiente (si lo hay) sin esperar al intervalo.
    pub async fn flush(&self) {
        self.flush_inner(false).await;
    }

    /// Flush final: después de esto ninguna llamada ni timer vuelve a escribir.
    pub async fn close(&self) {
        self.flush_inner(true).await;
    }

    async fn flush_inner(&self, close: bool) {
        let _writing = self.inner.writer.lock().await;
        let value = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.closed = close;
            let value = state.pending.take();
            if value.is_some() {
                state.last_write = Some(Instant::now());
            }
            value
        };
        if let Some(value) = value {
            (self.inner.write)(value).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_throttle(interval: Duration) -> (Throttle<u32>, Arc<Mutex<Vec<u32>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let w = written.clone();
        let write: WriteFn<u32> = Arc::new(move |v| {
            let w = w.clone();
            async move {
                w.lock().unwrap().push(v);
            }
            .boxed()
        });
        (Throttle::new(interval, write), written)
    }

    #[tokio::test(start_paused = true)]
    async fn mil_llamadas_en_un_segundo_escriben_a_lo_sumo_once_mas_flush() {
        let (throttle, written) = recording_throttle(Duration::from_millis(100));

        for i in 0..1000u32 {
            throttle.call(i);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let before_close = written.lock().unwrap().len();
        throttle.close().await;

        let written = written.lock().unwrap().clone();
        assert!(before_close <= 11, "escrituras por throttle: {}", before_close);
        assert!(written.len() <= before_close + 1);
        assert!(written.len() >= 10);
        // la última escritura es el último valor reportado
        assert_eq!(*written.last().unwrap(), 999);
        assert_eq!(written[0], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_desactiva_timers_armados() {
        let (throttle, written) = recording_throttle(Duration::from_millis(100));

        throttle.call(1);
        tokio::task::yield_now().await;
        throttle.call(2); // arma un timer para t=100
        throttle.close().await; // escribe 2 ya

        throttle.call(3); // ignorada
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*written.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_sin_pendiente_no_escribe() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let write: WriteFn<u32> = Arc::new(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        let throttle = Throttle::new(Duration::from_millis(50), write);

        throttle.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        throttle.call(7);
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttle.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
