use role_agent::batch::{Scheduler, TaskStatus};
use role_agent::prompt::{PromptVariable, VarType};

fn vars() -> Vec<PromptVariable> {
    vec![PromptVariable::new("query", "Query", VarType::String)]
}

fn rows(n: usize) -> Vec<Vec<String>> {
    (1..=n).map(|i| vec![format!("question {i}")]).collect()
}

fn ids_with(s: &Scheduler, status: TaskStatus) -> Vec<u32> {
    s.tasks()
        .iter()
        .filter(|t| t.status == status)
        .map(|t| t.id)
        .collect()
}

#[test]
fn twelve_rows_run_in_groups_of_five() {
    let mut s = Scheduler::new(5);
    let started = s.submit(&rows(12), &vars()).unwrap();
    assert_eq!(started, vec![1, 2, 3, 4, 5]);
    assert_eq!(ids_with(&s, TaskStatus::Pending), (6..=12).collect::<Vec<_>>());

    // First group resolves out of order.
    for id in [3, 1, 5, 2] {
        assert!(s.reconcile(id, &format!("answer {id}"), true).is_empty());
        assert_eq!(s.cursor(), 0);
    }
    let admitted = s.reconcile(4, "answer 4", true);
    assert_eq!(admitted, vec![6, 7, 8, 9, 10]);
    assert_eq!(s.cursor(), 5);
    assert_eq!(s.running_ids(), vec![6, 7, 8, 9, 10]);

    let mut next = vec![6u32, 7, 8, 9, 10];
    while let Some(id) = next.first().copied() {
        next.remove(0);
        let admitted = s.reconcile(id, &format!("answer {id}"), true);
        next.extend(admitted);
        assert!(s.counts().running <= 5);
    }

    assert!(s.all_completed());
    // The short tail group is admitted once fewer than five tasks remain unrun.
    assert_eq!(s.cursor(), 8);
    assert_eq!(s.completions().len(), 12);
    assert_eq!(s.completion(12), Some("answer 12"));
}

#[test]
fn retry_reissues_only_failed_tasks() {
    let mut s = Scheduler::new(5);
    s.submit(&rows(5), &vars()).unwrap();
    for id in 1..=5 {
        let ok = !matches!(id, 2 | 3 | 5);
        s.reconcile(id, if ok { "fine" } else { "" }, ok);
    }
    assert_eq!(s.counts().failed, 3);

    let retry: Vec<u32> = s.retry_failed().iter().map(|t| t.id).collect();
    assert_eq!(retry, vec![2, 3, 5]);

    s.reconcile(3, "second try", true);
    assert_eq!(s.task(3).map(|t| t.status), Some(TaskStatus::Completed));
    assert_eq!(s.task(2).map(|t| t.status), Some(TaskStatus::Failed));
    assert_eq!(s.task(1).map(|t| t.status), Some(TaskStatus::Completed));
    assert_eq!(s.completion(1), Some("fine"));
    assert_eq!(s.counts().failed, 2);
}

#[test]
fn small_batch_starts_everything() {
    let mut s = Scheduler::new(5);
    let started = s.submit(&rows(3), &vars()).unwrap();
    assert_eq!(started, vec![1, 2, 3]);
    assert!(s.pending().is_empty());
}
