//! Folding server task records into the observable state.
//!
//! The reducer is pure apart from a few counters it keeps about the task
//! (last applied sequence, whether the task was ever listed). It never
//! touches I/O and never produces a partially updated state.

use crate::error::ReplicationError;
use crate::state::{ReplicationMode, ReplicationState};
use couchrep_protocol::ActiveTask;

/// Result of one look at the server's task list.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskObservation {
    /// The task list contained this replication's record.
    Found(ActiveTask),
    /// The task list was fetched and this replication is not in it.
    Missing,
    /// The list or record could not be interpreted. Treated as a transient
    /// glitch: nothing changes this cycle.
    Malformed,
    /// The request fetching the list failed.
    FetchFailed(ReplicationError),
}

impl TaskObservation {
    /// Picks this replication's entry out of a task list.
    pub fn from_tasks(tasks: &[ActiveTask], task_id: &str) -> Self {
        tasks
            .iter()
            .find(|t| t.is_replication() && t.matches(task_id))
            .map_or(TaskObservation::Missing, |t| TaskObservation::Found(t.clone()))
    }
}

/// Progress extracted from a well-formed task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    completed: u64,
    total: u64,
}

impl Progress {
    /// Reads and normalizes the counters. `None` when the record has no
    /// counters and the status does not explain why.
    fn from_task(task: &ActiveTask, previous: &ReplicationState) -> Option<Self> {
        match (task.completed, task.total) {
            (Some(completed), Some(total)) => {
                let completed = completed.max(0) as u64;
                let total = total.max(0) as u64;
                Some(Self {
                    completed,
                    total: total.max(completed),
                })
            }
            _ if task.reports_idle() || task.is_offline() => Some(Self {
                completed: previous.completed,
                total: previous.total,
            }),
            _ => None,
        }
    }
}

/// Reduces task observations into [`ReplicationState`] for one run of a
/// replication. A new reconciler is created on every start.
#[derive(Debug, Clone)]
pub struct Reconciler {
    continuous: bool,
    grace_polls: u32,
    last_sequence: u64,
    seen: bool,
    missed: u32,
}

impl Reconciler {
    /// Creates a reconciler for a continuous or one-shot replication.
    pub fn new(continuous: bool, grace_polls: u32) -> Self {
        Self {
            continuous,
            grace_polls,
            last_sequence: 0,
            seen: false,
            missed: 0,
        }
    }

    /// Highest observation sequence applied so far.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Returns true once the task has appeared in a task list.
    pub fn has_seen_task(&self) -> bool {
        self.seen
    }

    /// Folds `observation` (numbered `sequence`) into `previous`.
    ///
    /// Observations whose sequence is not newer than the last applied one
    /// are stale and leave the state untouched. `manual_stop` tells whether
    /// a disappearance was requested by the caller.
    pub fn reduce(
        &mut self,
        previous: &ReplicationState,
        sequence: u64,
        observation: TaskObservation,
        manual_stop: bool,
    ) -> ReplicationState {
        if sequence <= self.last_sequence {
            return previous.clone();
        }
        self.last_sequence = sequence;

        if !previous.running {
            return previous.clone();
        }

        match observation {
            TaskObservation::Malformed => previous.clone(),
            TaskObservation::FetchFailed(error) => ReplicationState {
                last_error: Some(error),
                ..previous.clone()
            },
            TaskObservation::Missing => self.on_missing(previous, manual_stop),
            TaskObservation::Found(task) => match Progress::from_task(&task, previous) {
                Some(progress) => self.on_found(previous, &task, progress),
                None => previous.clone(),
            },
        }
    }

    fn on_missing(&mut self, previous: &ReplicationState, manual_stop: bool) -> ReplicationState {
        if manual_stop {
            return previous.clone().into_stopped(true);
        }

        if !self.seen && self.missed < self.grace_polls {
            self.missed += 1;
            return previous.clone();
        }

        // A one-shot replication that had caught up finished normally.
        let finished = !self.continuous && previous.completed >= previous.total;
        let mut next = previous.clone().into_stopped(false);
        if !finished {
            next.last_error = Some(ReplicationError::TaskVanished {
                task_id: previous.remote_task_id.clone().unwrap_or_default(),
            });
        }
        next
    }

    fn on_found(
        &mut self,
        previous: &ReplicationState,
        task: &ActiveTask,
        progress: Progress,
    ) -> ReplicationState {
        self.seen = true;
        self.missed = 0;

        // Counters never go backwards within a run.
        let completed = progress.completed.max(previous.completed);
        let total = progress.total.max(previous.total).max(completed);

        let mode = if task.is_offline() {
            ReplicationMode::Offline
        } else if completed < total {
            ReplicationMode::Active
        } else if self.continuous && (task.reports_idle() || !task.has_pending_work()) {
            ReplicationMode::Idle
        } else {
            ReplicationMode::Active
        };

        ReplicationState {
            mode,
            running: true,
            manually_stopped: false,
            status_text: task.status.clone().unwrap_or_default(),
            completed,
            total,
            ..previous.clone()
        }
    }
}
