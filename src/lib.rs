use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod app;
mod coordinator;
pub mod store;
mod worker;

pub use coordinator::Coordinator;
pub use worker::Worker;

/// User-supplied Map function: (input unit, its contents) -> intermediate records.
pub type MapFn = fn(&Path, &str) -> Vec<KeyValue>;

/// User-supplied Reduce function: (key, every value for that key) -> one output value.
pub type ReduceFn = fn(&str, &[String]) -> String;

#[tarpc::service]
pub trait Service {
    /// Ask the coordinator for work. A task of kind [`TaskKind::Wait`] means
    /// "poll again later"; `None` means the job is complete and the caller
    /// should stop polling.
    async fn request() -> Option<Task>;

    /// Report a task as completed. Duplicate and late reports are absorbed;
    /// a reference to a task the coordinator never created is rejected.
    async fn finish(task: Task) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Unassigned,
    Assigned,
    Finished,
}

/// One unit of work. `map_input` is set only for Map tasks, `reduce_inputs`
/// only for Reduce tasks: one intermediate location per map index, all at
/// this task's reduce index. The fan-out counts are broadcast on every task
/// so a worker can partition without further coordination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub index: usize,
    pub map_input: Option<PathBuf>,
    pub reduce_inputs: Vec<PathBuf>,
    pub nmap: usize,
    pub nreduce: usize,
}

impl Task {
    /// Pseudo-task telling a worker to back off and poll again.
    pub(crate) fn wait(nmap: usize, nreduce: usize) -> Self {
        Task {
            kind: TaskKind::Wait,
            status: TaskStatus::Unassigned,
            index: 0,
            map_input: None,
            reduce_inputs: Vec::new(),
            nmap,
            nreduce,
        }
    }
}

/// Intermediate record emitted by Map and consumed by Reduce. Ordered by
/// key first so a sorted run groups equal keys together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SchedulerError {
    #[error("no {kind:?} task with index {index}")]
    InvalidTask { kind: TaskKind, index: usize },
}
