use serde::{Deserialize, Serialize};

use crate::task::ClusterId;

/// Canal para relayar `cancel_task` al nodo dueño.
pub const CANCEL_TASK_RPC: &str = "cancel-task";

/// Canal para disparar un tick de scheduling en todos los nodos.
pub const SCHEDULER_INTERRUPT_RPC: &str = "scheduler-interrupt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelTaskMessage<I> {
    /// Nodo que recibió la llamada original.
    pub origin: ClusterId,
    pub task_id: I,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInterruptMessage {
    pub origin: ClusterId,
}
