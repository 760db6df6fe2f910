use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{future, prelude::*};
use log::{debug, info};
use tarpc::{
    context,
    server::{self, incoming::Incoming, Channel},
    tokio_serde::formats::Json,
};

use crate::store;
use crate::{SchedulerError, Service, Task, TaskKind, TaskStatus};

/// Authoritative task state. Both task sets are created once at construction
/// and never resized; `status` is the only field mutated afterwards, always
/// under the coordinator's lock.
#[derive(Debug)]
struct Scheduler {
    map_tasks: Vec<Task>,
    reduce_tasks: Vec<Task>,
    nmap: usize,
    nreduce: usize,
    map_finished: usize,
    reduce_finished: usize,
    map_done: bool,
    reduce_done: bool,
}

impl Scheduler {
    fn new(inputs: Vec<PathBuf>, nreduce: usize, dir: &Path) -> Self {
        let nmap = inputs.len();
        let map_tasks = inputs
            .into_iter()
            .enumerate()
            .map(|(index, file)| Task {
                kind: TaskKind::Map,
                status: TaskStatus::Unassigned,
                index,
                map_input: Some(file),
                reduce_inputs: Vec::new(),
                nmap,
                nreduce,
            })
            .collect();
        let reduce_tasks = (0..nreduce)
            .map(|index| Task {
                kind: TaskKind::Reduce,
                status: TaskStatus::Unassigned,
                index,
                map_input: None,
                reduce_inputs: (0..nmap)
                    .map(|m| store::intermediate_path(dir, m, index))
                    .collect(),
                nmap,
                nreduce,
            })
            .collect();
        Scheduler {
            map_tasks,
            reduce_tasks,
            nmap,
            nreduce,
            map_finished: 0,
            reduce_finished: 0,
            map_done: nmap == 0,
            reduce_done: nreduce == 0,
        }
    }

    /// Hand out work for the current phase. `None` means both phases are
    /// complete; a `Wait` task means every task of the phase is already
    /// assigned or finished and the caller should poll again.
    fn next_task(&mut self) -> Option<Task> {
        if !self.map_done {
            Some(assign(&mut self.map_tasks, self.nmap, self.nreduce))
        } else if !self.reduce_done {
            Some(assign(&mut self.reduce_tasks, self.nmap, self.nreduce))
        } else {
            None
        }
    }

    /// Mark a task finished. Returns `Ok(true)` the first time a task
    /// reaches Finished, `Ok(false)` for a duplicate report. Only the first
    /// report advances the phase counter, so a straggler racing its
    /// replacement cannot flip a phase twice.
    fn finish(&mut self, kind: TaskKind, index: usize) -> Result<bool, SchedulerError> {
        let tasks = match kind {
            TaskKind::Map => &mut self.map_tasks,
            TaskKind::Reduce => &mut self.reduce_tasks,
            TaskKind::Wait => return Err(SchedulerError::InvalidTask { kind, index }),
        };
        let task = tasks
            .get_mut(index)
            .ok_or(SchedulerError::InvalidTask { kind, index })?;
        if task.status == TaskStatus::Finished {
            return Ok(false);
        }
        // Unassigned is accepted too: a reverted task may still be completed
        // by the worker it was taken away from.
        task.status = TaskStatus::Finished;
        match kind {
            TaskKind::Map => {
                self.map_finished += 1;
                if self.map_finished == self.nmap {
                    self.map_done = true;
                }
            }
            TaskKind::Reduce => {
                self.reduce_finished += 1;
                if self.reduce_finished == self.nreduce {
                    self.reduce_done = true;
                }
            }
            TaskKind::Wait => unreachable!(),
        }
        Ok(true)
    }

    /// Timeout revert. Returns true if the task was still Assigned and is
    /// now eligible for reassignment; a task that finished in the meantime
    /// is left alone.
    fn revert(&mut self, kind: TaskKind, index: usize) -> bool {
        let tasks = match kind {
            TaskKind::Map => &mut self.map_tasks,
            TaskKind::Reduce => &mut self.reduce_tasks,
            TaskKind::Wait => return false,
        };
        match tasks.get_mut(index) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.status = TaskStatus::Unassigned;
                true
            }
            _ => false,
        }
    }

    fn done(&self) -> bool {
        self.reduce_done
    }
}

fn assign(tasks: &mut [Task], nmap: usize, nreduce: usize) -> Task {
    for task in tasks.iter_mut() {
        if task.status == TaskStatus::Unassigned {
            task.status = TaskStatus::Assigned;
            return task.clone();
        }
    }
    Task::wait(nmap, nreduce)
}

#[derive(Clone)]
struct SchedulerServer {
    state: Arc<Mutex<Scheduler>>,
    grace: Duration,
}

impl Service for SchedulerServer {
    async fn request(self, _: context::Context) -> Option<Task> {
        let task = self.state.lock().unwrap().next_task();
        match &task {
            Some(t) if t.kind == TaskKind::Wait => {
                debug!("no unassigned task, telling caller to wait")
            }
            Some(t) => {
                info!("assigned {:?} task {}", t.kind, t.index);
                self.watch(t.kind, t.index);
            }
            None => debug!("both phases complete, telling caller to stop"),
        }
        task
    }

    async fn finish(self, _: context::Context, task: Task) -> Result<(), SchedulerError> {
        let first = self
            .state
            .lock()
            .unwrap()
            .finish(task.kind, task.index)?;
        if first {
            info!("{:?} task {} finished", task.kind, task.index);
        } else {
            debug!(
                "duplicate finish for {:?} task {} ignored",
                task.kind, task.index
            );
        }
        Ok(())
    }
}

impl SchedulerServer {
    /// One watcher per assignment. Sleeps out the grace period without the
    /// lock, then reverts the task if it is still Assigned; a no-op when the
    /// task finished first.
    fn watch(&self, kind: TaskKind, index: usize) {
        let state = Arc::clone(&self.state);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if state.lock().unwrap().revert(kind, index) {
                info!("{:?} task {} timed out, reverting for reassignment", kind, index);
            }
        });
    }
}

/// The coordinator: owns the scheduler state and serves the task RPC.
/// Cloning yields another handle onto the same state.
#[derive(Clone)]
pub struct Coordinator {
    port: u16,
    grace: Duration,
    state: Arc<Mutex<Scheduler>>,
}

impl Coordinator {
    /// Build the fixed task sets: one Map task per input file, `nreduce`
    /// Reduce tasks whose inputs are the intermediate locations under `dir`.
    pub fn new(
        inputs: Vec<PathBuf>,
        nreduce: usize,
        dir: &Path,
        port: u16,
        grace: Duration,
    ) -> Self {
        Coordinator {
            port,
            grace,
            state: Arc::new(Mutex::new(Scheduler::new(inputs, nreduce, dir))),
        }
    }

    /// True exactly when every Reduce task has finished.
    pub fn done(&self) -> bool {
        self.state.lock().unwrap().done()
    }

    /// Resolves once the whole job is done. Drive this against [`serve`] in
    /// a select so the process exits when the last Reduce task reports in.
    ///
    /// [`serve`]: Coordinator::serve
    pub async fn wait_done(&self) {
        while !self.done() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Serve task RPCs until the enclosing future is dropped.
    pub async fn serve(&self) -> io::Result<()> {
        let server_addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), self.port);
        let server = SchedulerServer {
            state: Arc::clone(&self.state),
            grace: self.grace,
        };
        let mut listener = tarpc::serde_transport::tcp::listen(&server_addr, Json::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        info!("coordinator listening on {}", server_addr);
        listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            // Limit channels to 10 per IP.
            .max_channels_per_key(10, |t| t.transport().peer_addr().unwrap().ip())
            .map(|channel| channel.execute(server.clone().serve()).for_each(spawn))
            // Max 10 channels.
            .buffer_unordered(10)
            .for_each(|_| async {})
            .await;
        Ok(())
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(nmap: usize, nreduce: usize) -> Scheduler {
        let inputs = (0..nmap).map(|i| PathBuf::from(format!("in-{}", i))).collect();
        Scheduler::new(inputs, nreduce, Path::new("target"))
    }

    #[test]
    fn task_sets_are_fixed_at_construction() {
        let s = scheduler(3, 2);
        assert_eq!(s.map_tasks.len(), 3);
        assert_eq!(s.reduce_tasks.len(), 2);
        assert_eq!(s.map_tasks[1].map_input, Some(PathBuf::from("in-1")));
        assert_eq!(
            s.reduce_tasks[1].reduce_inputs,
            vec![
                PathBuf::from("target/mr-0-1"),
                PathBuf::from("target/mr-1-1"),
                PathBuf::from("target/mr-2-1"),
            ]
        );
        assert!(s
            .map_tasks
            .iter()
            .chain(s.reduce_tasks.iter())
            .all(|t| t.status == TaskStatus::Unassigned));
    }

    #[test]
    fn assigns_each_map_task_once_then_waits() {
        let mut s = scheduler(2, 1);
        let a = s.next_task().unwrap();
        let b = s.next_task().unwrap();
        assert_eq!((a.kind, a.index), (TaskKind::Map, 0));
        assert_eq!((b.kind, b.index), (TaskKind::Map, 1));
        // Phase is exhausted but not finished: callers must wait.
        assert_eq!(s.next_task().unwrap().kind, TaskKind::Wait);
        assert_eq!(s.next_task().unwrap().kind, TaskKind::Wait);
    }

    #[test]
    fn no_reduce_until_every_map_finished() {
        let mut s = scheduler(3, 2);
        for _ in 0..3 {
            assert_eq!(s.next_task().unwrap().kind, TaskKind::Map);
        }
        s.finish(TaskKind::Map, 0).unwrap();
        s.finish(TaskKind::Map, 2).unwrap();
        // One map task still outstanding: no reduce work yet.
        assert_eq!(s.next_task().unwrap().kind, TaskKind::Wait);
        s.finish(TaskKind::Map, 1).unwrap();
        let t = s.next_task().unwrap();
        assert_eq!(t.kind, TaskKind::Reduce);
        assert_eq!(t.status, TaskStatus::Assigned);
    }

    #[test]
    fn duplicate_finish_counts_once() {
        let mut s = scheduler(2, 1);
        s.next_task().unwrap();
        s.next_task().unwrap();
        assert_eq!(s.finish(TaskKind::Map, 0), Ok(true));
        assert_eq!(s.finish(TaskKind::Map, 0), Ok(false));
        assert_eq!(s.map_finished, 1);
        assert!(!s.map_done);
        assert_eq!(s.finish(TaskKind::Map, 1), Ok(true));
        assert!(s.map_done);
        // A straggler reporting after the phase flipped changes nothing.
        assert_eq!(s.finish(TaskKind::Map, 0), Ok(false));
        assert_eq!(s.map_finished, 2);
    }

    #[test]
    fn timeout_reverts_only_assigned_tasks() {
        let mut s = scheduler(2, 1);
        assert!(!s.revert(TaskKind::Map, 0), "unassigned task must not revert");
        let t = s.next_task().unwrap();
        assert!(s.revert(t.kind, t.index));
        assert_eq!(s.map_tasks[0].status, TaskStatus::Unassigned);
        // Reverted task is handed out again.
        let t = s.next_task().unwrap();
        assert_eq!((t.kind, t.index), (TaskKind::Map, 0));
        s.finish(TaskKind::Map, 0).unwrap();
        assert!(!s.revert(TaskKind::Map, 0), "finished task must not revert");
        assert_eq!(s.map_tasks[0].status, TaskStatus::Finished);
    }

    #[test]
    fn late_finish_of_reverted_task_is_accepted() {
        let mut s = scheduler(1, 1);
        let t = s.next_task().unwrap();
        assert!(s.revert(t.kind, t.index));
        // The original worker completes after the revert; its report still
        // counts, exactly once.
        assert_eq!(s.finish(TaskKind::Map, 0), Ok(true));
        assert!(s.map_done);
        assert_eq!(s.finish(TaskKind::Map, 0), Ok(false));
        assert_eq!(s.map_finished, 1);
    }

    #[test]
    fn invalid_task_reference_is_rejected() {
        let mut s = scheduler(2, 1);
        assert_eq!(
            s.finish(TaskKind::Map, 7),
            Err(SchedulerError::InvalidTask {
                kind: TaskKind::Map,
                index: 7
            })
        );
        assert_eq!(
            s.finish(TaskKind::Wait, 0),
            Err(SchedulerError::InvalidTask {
                kind: TaskKind::Wait,
                index: 0
            })
        );
        // Counters are untouched by a rejected reference.
        assert_eq!(s.map_finished, 0);
        assert_eq!(s.reduce_finished, 0);
    }

    #[test]
    fn job_runs_to_terminal_none() {
        let mut s = scheduler(2, 2);
        for i in 0..2 {
            assert_eq!(s.next_task().unwrap().kind, TaskKind::Map);
            s.finish(TaskKind::Map, i).unwrap();
        }
        for i in 0..2 {
            assert_eq!(s.next_task().unwrap().kind, TaskKind::Reduce);
            assert!(!s.done());
            s.finish(TaskKind::Reduce, i).unwrap();
        }
        assert!(s.done());
        assert_eq!(s.next_task(), None);
    }
}
