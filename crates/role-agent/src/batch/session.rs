use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use super::scheduler::{Scheduler, TaskId};
use super::validate::{BatchError, check_batch_inputs};
use crate::executor::{RunEvent, RunSink, TaskOutcome, spawn_task};
use crate::prompt::PromptVariable;
use crate::service::{CompletionRequest, CompletionService};

/// Owns the scheduler and the worker threads of one batch at a time.
///
/// Outcomes arrive over a channel and are reconciled in arrival order by
/// whichever loop drives the session (the CLI or the TUI tick).
pub struct BatchSession {
    scheduler: Scheduler,
    service: Arc<dyn CompletionService>,
    sink: Arc<dyn RunSink>,
    tx: mpsc::Sender<TaskOutcome>,
    rx: mpsc::Receiver<TaskOutcome>,
    in_flight: BTreeMap<TaskId, JoinHandle<()>>,
    // Failed tasks re-issued by retry; they stay failed until the retry succeeds.
    retrying: BTreeSet<TaskId>,
    errors: BTreeMap<TaskId, String>,
    generation: u64,
}

impl BatchSession {
    pub fn new(
        service: Arc<dyn CompletionService>,
        sink: Arc<dyn RunSink>,
        group_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            scheduler: Scheduler::new(group_size),
            service,
            sink,
            tx,
            rx,
            in_flight: BTreeMap::new(),
            retrying: BTreeSet::new(),
            errors: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn error(&self, id: TaskId) -> Option<&str> {
        self.errors.get(&id).map(String::as_str)
    }

    pub fn is_retrying(&self, id: TaskId) -> bool {
        self.retrying.contains(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// True when no task is pending, running or being retried.
    pub fn is_finished(&self) -> bool {
        self.scheduler.all_ran() && self.retrying.is_empty() && self.in_flight.is_empty()
    }

    /// Validates a parsed batch file and starts the first group.
    ///
    /// Nothing is created when validation fails or a previous batch is still
    /// running. Returns the number of tasks created.
    pub fn submit(
        &mut self,
        data: &[Vec<String>],
        vars: &[PromptVariable],
        default_max_len: usize,
    ) -> Result<usize, BatchError> {
        let rows = check_batch_inputs(data, vars, default_max_len)?;
        if !self.is_finished() {
            return Err(BatchError::Busy);
        }

        self.generation = self.generation.wrapping_add(1);
        self.errors.clear();
        self.retrying.clear();
        let started = self.scheduler.submit(&rows, vars)?;
        for id in started {
            self.spawn(id);
        }
        Ok(rows.len())
    }

    /// Re-issues every failed task that is not already being retried.
    pub fn retry_failed(&mut self) -> Vec<TaskId> {
        let mut ids = Vec::new();
        for task in self.scheduler.retry_failed() {
            if self.retrying.contains(&task.id) || self.in_flight.contains_key(&task.id) {
                continue;
            }
            self.retrying.insert(task.id);
            self.spawn(task.id);
            ids.push(task.id);
        }
        if !ids.is_empty() {
            tracing::info!(tasks = ids.len(), "retrying failed tasks");
        }
        ids
    }

    /// Applies every outcome that has already arrived. Never blocks.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Ok(outcome) = self.rx.try_recv() {
            if self.apply(outcome) {
                n += 1;
            }
        }
        n
    }

    /// Blocks until one outcome arrives (or `timeout` passes) and applies it.
    /// Returns `None` immediately when nothing is in flight.
    pub fn wait_next(&mut self, timeout: Option<Duration>) -> Option<TaskId> {
        if self.in_flight.is_empty() {
            return None;
        }
        let outcome = match timeout {
            Some(t) => self.rx.recv_timeout(t).ok()?,
            None => self.rx.recv().ok()?,
        };
        let id = outcome.id;
        self.apply(outcome).then_some(id)
    }

    pub fn run_to_completion(&mut self) {
        while !self.in_flight.is_empty() {
            self.wait_next(None);
        }
    }

    /// Drops the current batch. Outcomes still in flight are ignored when
    /// they arrive.
    pub fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.scheduler.clear();
        self.errors.clear();
        self.retrying.clear();
        self.in_flight.clear();
    }

    fn spawn(&mut self, id: TaskId) {
        let Some(task) = self.scheduler.task(id) else {
            return;
        };
        let req = CompletionRequest {
            inputs: task.params.inputs.clone(),
            files: Vec::new(),
        };
        let handle = spawn_task(
            Arc::clone(&self.service),
            Arc::clone(&self.sink),
            id,
            self.generation,
            req,
            self.tx.clone(),
        );
        self.in_flight.insert(id, handle);
    }

    fn apply(&mut self, outcome: TaskOutcome) -> bool {
        if outcome.generation != self.generation {
            tracing::debug!(task = outcome.id, "dropping outcome from a previous batch");
            return false;
        }
        if let Some(h) = self.in_flight.remove(&outcome.id) {
            if h.join().is_err() {
                tracing::warn!(task = outcome.id, "task worker panicked");
            }
        }
        self.retrying.remove(&outcome.id);
        match &outcome.error {
            Some(e) => {
                self.errors.insert(outcome.id, e.clone());
            }
            None => {
                self.errors.remove(&outcome.id);
            }
        }

        let admitted = self
            .scheduler
            .reconcile(outcome.id, &outcome.text, outcome.success);
        for id in admitted {
            self.spawn(id);
        }

        if self.is_finished() {
            let c = self.scheduler.counts();
            tracing::info!(completed = c.completed, failed = c.failed, "batch settled");
            self.sink.emit(RunEvent::BatchDone {
                completed: c.completed,
                failed: c.failed,
            });
        }
        true
    }
}
