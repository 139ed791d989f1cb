use std::collections::BTreeMap;

use serde::Serialize;

use super::validate::BatchError;
use crate::prompt::PromptVariable;

pub type TaskId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn has_run(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskParams {
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub params: TaskParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Ordered batch task list with bounded admission.
///
/// At most `group_size` tasks are running at once. A new group is admitted
/// when the number of finished tasks reaches a multiple of the group size, or
/// when fewer than a group's worth of tasks remain.
#[derive(Debug, Clone)]
pub struct Scheduler {
    group_size: usize,
    tasks: Vec<Task>,
    // Number of tasks that had run when the last group was admitted.
    cursor: usize,
    completions: BTreeMap<TaskId, String>,
}

impl Scheduler {
    pub fn new(group_size: usize) -> Self {
        Self {
            group_size: group_size.max(1),
            tasks: Vec::new(),
            cursor: 0,
            completions: BTreeMap::new(),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn completions(&self) -> &BTreeMap<TaskId, String> {
        &self.completions
    }

    pub fn completion(&self, id: TaskId) -> Option<&str> {
        self.completions.get(&id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Builds one task per cleaned row and starts the first group.
    ///
    /// Returns the ids that were started. Rejected with [`BatchError::Busy`]
    /// while the previous batch still has pending or running tasks.
    pub fn submit(
        &mut self,
        rows: &[Vec<String>],
        vars: &[PromptVariable],
    ) -> Result<Vec<TaskId>, BatchError> {
        if !self.all_ran() {
            return Err(BatchError::Busy);
        }

        let mut tasks = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let inputs = vars
                .iter()
                .enumerate()
                .map(|(idx, v)| (v.key.clone(), row.get(idx).cloned().unwrap_or_default()))
                .collect();
            let status = if i < self.group_size {
                TaskStatus::Running
            } else {
                TaskStatus::Pending
            };
            tasks.push(Task {
                id: i as TaskId + 1,
                status,
                params: TaskParams { inputs },
            });
        }

        self.tasks = tasks;
        self.cursor = 0;
        self.completions.clear();
        tracing::info!(
            tasks = self.tasks.len(),
            group_size = self.group_size,
            "batch submitted"
        );
        Ok(self.running_ids())
    }

    /// Applies one task outcome and admits the next group when due.
    ///
    /// Returns the ids newly moved to running. Unknown ids are ignored.
    pub fn reconcile(&mut self, id: TaskId, text: &str, success: bool) -> Vec<TaskId> {
        let Some(pos) = self.tasks.iter().position(|t| t.id == id) else {
            tracing::warn!(task = id, "ignoring outcome for unknown task");
            return Vec::new();
        };

        let ran_total = 1 + self
            .tasks
            .iter()
            .filter(|t| t.id != id && t.status.has_run())
            .count();
        let pending = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();
        let total = self.tasks.len();
        let admit = self.cursor != ran_total
            && pending > 0
            && (ran_total % self.group_size == 0
                || total.saturating_sub(ran_total) < self.group_size);

        let mut next = self.tasks.clone();
        next[pos].status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        let mut admitted = Vec::new();
        if admit {
            self.cursor = ran_total;
            for t in next
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Pending)
                .take(self.group_size)
            {
                t.status = TaskStatus::Running;
                admitted.push(t.id);
            }
        }
        self.tasks = next;
        self.completions.insert(id, text.to_string());

        tracing::debug!(
            task = id,
            success,
            ran_total,
            admitted = admitted.len(),
            "task reconciled"
        );
        admitted
    }

    /// Snapshot of the failed tasks to re-issue. Their outcomes come back
    /// through [`Scheduler::reconcile`].
    pub fn retry_failed(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> Counts {
        let mut c = Counts::default();
        for t in &self.tasks {
            match t.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::Running => c.running += 1,
                TaskStatus::Completed => c.completed += 1,
                TaskStatus::Failed => c.failed += 1,
            }
        }
        c
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.ids_with(TaskStatus::Running)
    }

    pub fn pending(&self) -> Vec<&Task> {
        self.with_status(TaskStatus::Pending)
    }

    // Everything that has been admitted at least once.
    pub fn shown(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Pending)
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&Task> {
        self.with_status(TaskStatus::Completed)
    }

    pub fn failed(&self) -> Vec<&Task> {
        self.with_status(TaskStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn all_ran(&self) -> bool {
        self.tasks.iter().all(|t| t.status.has_run())
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.cursor = 0;
        self.completions.clear();
    }

    fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    fn ids_with(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::VarType;

    fn vars() -> Vec<PromptVariable> {
        vec![PromptVariable::new("query", "Query", VarType::String)]
    }

    fn rows(n: usize) -> Vec<Vec<String>> {
        (1..=n).map(|i| vec![format!("q{i}")]).collect()
    }

    #[test]
    fn small_batch_starts_everything() {
        let mut s = Scheduler::new(5);
        let started = s.submit(&rows(3), &vars()).unwrap();
        assert_eq!(started, vec![1, 2, 3]);
        assert_eq!(s.counts().running, 3);
    }

    #[test]
    fn inputs_follow_variable_order() {
        let vars = vec![
            PromptVariable::new("a", "A", VarType::String),
            PromptVariable::new("b", "B", VarType::Paragraph),
        ];
        let mut s = Scheduler::new(5);
        s.submit(&[vec!["1".into(), "2".into(), "extra".into()], vec!["x".into()]], &vars)
            .unwrap();
        let t1 = &s.tasks()[0].params.inputs;
        assert_eq!(t1.len(), 2);
        assert_eq!(t1["a"], "1");
        assert_eq!(t1["b"], "2");
        assert_eq!(s.tasks()[1].params.inputs["b"], "");
    }

    #[test]
    fn running_never_exceeds_group_size() {
        let mut s = Scheduler::new(5);
        s.submit(&rows(23), &vars()).unwrap();
        assert_eq!(s.counts().running, 5);
        let mut step = 0;
        while !s.all_ran() {
            let running = s.running_ids();
            assert!(!running.is_empty(), "stalled with pending tasks");
            // Finish out of order: newest first.
            let id = running[running.len() - 1];
            s.reconcile(id, "ok", step % 4 != 0);
            assert!(s.counts().running <= 5);
            step += 1;
        }
        assert_eq!(s.completions().len(), 23);
    }

    #[test]
    fn seven_tasks_admit_the_tail_early() {
        let mut s = Scheduler::new(5);
        s.submit(&rows(7), &vars()).unwrap();
        assert!(s.reconcile(1, "a", true).is_empty());
        assert!(s.reconcile(2, "b", true).is_empty());
        // 7 - 3 < 5: the remaining two start now.
        assert_eq!(s.reconcile(3, "c", true), vec![6, 7]);
        assert_eq!(s.cursor(), 3);
        assert_eq!(s.counts().running, 4);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut s = Scheduler::new(5);
        s.submit(&rows(2), &vars()).unwrap();
        assert!(s.reconcile(0, "x", true).is_empty());
        assert!(s.reconcile(99, "x", true).is_empty());
        assert!(s.completions().is_empty());
        assert_eq!(s.counts().running, 2);
    }

    #[test]
    fn submit_is_rejected_while_busy() {
        let mut s = Scheduler::new(5);
        s.submit(&rows(2), &vars()).unwrap();
        assert_eq!(s.submit(&rows(1), &vars()), Err(BatchError::Busy));
        s.reconcile(1, "a", true);
        s.reconcile(2, "", false);
        assert!(s.all_ran());
        assert!(!s.all_completed());
        assert_eq!(s.submit(&rows(1), &vars()).unwrap(), vec![1]);
        assert!(s.completions().is_empty());
    }

    #[test]
    fn retry_success_moves_failed_to_completed() {
        let mut s = Scheduler::new(5);
        s.submit(&rows(4), &vars()).unwrap();
        for (id, ok) in [(1, false), (2, true), (3, false), (4, false)] {
            s.reconcile(id, "", ok);
        }
        let retry: Vec<TaskId> = s.retry_failed().iter().map(|t| t.id).collect();
        assert_eq!(retry, vec![1, 3, 4]);

        s.reconcile(3, "recovered", true);
        assert_eq!(s.task(3).map(|t| t.status), Some(TaskStatus::Completed));
        assert_eq!(s.task(1).map(|t| t.status), Some(TaskStatus::Failed));
        assert_eq!(s.task(4).map(|t| t.status), Some(TaskStatus::Failed));
        assert_eq!(s.completion(3), Some("recovered"));
        assert_eq!(s.counts().pending, 0);
    }

    #[test]
    fn views_partition_tasks() {
        let mut s = Scheduler::new(2);
        s.submit(&rows(4), &vars()).unwrap();
        s.reconcile(1, "a", true);
        assert_eq!(s.pending().len(), 2);
        assert_eq!(s.shown().len(), 2);
        assert_eq!(s.succeeded().len(), 1);
        assert!(s.failed().is_empty());
        s.clear();
        assert!(s.is_empty());
        assert!(s.all_ran());
    }
}
