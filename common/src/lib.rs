pub mod error;
pub mod rpc;
pub mod task;

pub use error::{Result, SchedulerError};
pub use rpc::{CancelTaskMessage, SchedulerInterruptMessage, CANCEL_TASK_RPC, SCHEDULER_INTERRUPT_RPC};
pub use task::{
    ClusterId, Task, TaskError, TaskFilter, TaskKind, TaskProgress, TaskStatus, RUNNER_ERROR,
    ZOMBIE_TASK,
};
