//! Scheduler de tareas consciente del cluster.
//!
//! Varios procesos comparten un repositorio de tareas. Cada uno corre un
//! [`Scheduler`] que reclama tareas pending hasta su límite de concurrencia,
//! las ejecuta con un [`TaskRunner`], escribe su progreso con throttle y marca
//! como zombie las tareas running cuyo dueño dejó de latir.

pub mod broadcast;
pub mod config;
pub mod heartbeat;
pub mod locker;
pub mod queue;
pub mod repository;
pub mod runner;
pub mod throttle;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broadcast::{Broadcaster, RemoteCall};
pub use config::SchedulerConfig;
pub use heartbeat::{HeartbeatFn, HeartbeatTimer};
pub use locker::{advisory_lock_keys, InProcessLocker, TransactionLocker};
pub use queue::{CancelOutcome, Scheduler, SchedulerBuilder};
pub use repository::{InMemoryTaskRepository, SafeTaskRepository, SharedRepository, TaskRepository};
pub use runner::{ProgressReporter, ProgressUpdate, TaskRunner};
pub use throttle::Throttle;
pub use transport::{ClusterTransport, InMemoryBus, Subscription};

#[cfg(feature = "postgres")]
pub use locker::PgAdvisoryLocker;
#[cfg(feature = "postgres")]
pub use transport::PgNotifyTransport;
