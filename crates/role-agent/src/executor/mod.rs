use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::batch::TaskId;
use crate::log_sanitize::{TextStream, sanitize_log_line};
use crate::service::{
    CompletionOutcome, CompletionProgress, CompletionRequest, CompletionService, ServiceError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TaskStarted {
        id: TaskId,
    },
    TaskChunk {
        id: TaskId,
        text: String,
    },
    TaskFinished {
        id: TaskId,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    BatchDone {
        completed: usize,
        failed: usize,
    },
    SingleStarted,
    SingleChunk {
        text: String,
    },
    SingleFinished {
        ok: bool,
        message_id: Option<String>,
        error: Option<String>,
        elapsed_ms: u128,
    },
}

pub trait RunSink: Send + Sync {
    fn emit(&self, ev: RunEvent);
}

/// Line-oriented sink for the CLI. Single-run text is streamed to stdout as it
/// arrives; batch tasks print one status line each and a summary at the end.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    total_task_ms: u128,
    failed_tasks: Vec<TaskId>,
    single_text: TextStream,
}

impl StdoutSink {
    // Escape state carries over between chunks of one single run.
    fn clean_chunk(&self, text: &str) -> String {
        match self.state.lock() {
            Ok(mut s) => s.single_text.push(text),
            Err(_) => TextStream::new().push(text),
        }
    }
}

impl RunSink for StdoutSink {
    fn emit(&self, ev: RunEvent) {
        match ev {
            RunEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started = s.tasks_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: task {id}");
            }
            // Batch text is printed from the result panel once the batch settles.
            RunEvent::TaskChunk { .. } => {}
            RunEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok = s.tasks_ok.saturating_add(1);
                    } else {
                        s.tasks_failed = s.tasks_failed.saturating_add(1);
                        s.failed_tasks.push(id);
                    }
                    s.total_task_ms = s.total_task_ms.saturating_add(elapsed_ms);
                }
                if ok {
                    println!("DONE: task {id} ({elapsed_ms}ms)");
                } else {
                    println!(
                        "FAIL: task {id} ({elapsed_ms}ms) {}",
                        sanitize_log_line(&error.unwrap_or_default())
                    );
                }
            }
            RunEvent::BatchDone { completed, failed } => {
                let mut summary = String::new();
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str("SUMMARY:\n");
                    summary.push_str(&format!(
                        "  status: {}\n",
                        if failed == 0 { "ok" } else { "failed" }
                    ));
                    summary.push_str(&format!(
                        "  tasks: completed={completed} failed={failed} attempts={} (ok={} failed={})\n",
                        s.tasks_started, s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    summary.push_str(&format!(
                        "  summed_task_time: {}\n",
                        format_elapsed_hms((s.total_task_ms / 1000) as u64)
                    ));
                    if !s.failed_tasks.is_empty() {
                        let mut ids = s.failed_tasks.clone();
                        ids.sort_unstable();
                        ids.dedup();
                        let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                        summary.push_str(&format!("  failed_tasks: {}\n", ids.join(", ")));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
            }
            RunEvent::SingleStarted => {
                if let Ok(mut s) = self.state.lock() {
                    s.single_text = TextStream::new();
                }
            }
            RunEvent::SingleChunk { text } => {
                print!("{}", self.clean_chunk(&text));
                use std::io::Write as _;
                let _ = std::io::stdout().flush();
            }
            RunEvent::SingleFinished {
                ok, error, elapsed_ms, ..
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.single_text = TextStream::new();
                }
                println!();
                if !ok {
                    println!(
                        "FAIL: ({elapsed_ms}ms) {}",
                        sanitize_log_line(&error.unwrap_or_default())
                    );
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RunEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }
}

impl RunSink for ChannelSink {
    fn emit(&self, ev: RunEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub id: TaskId,
    // Batch generation the task was issued under; stale outcomes are dropped.
    pub generation: u64,
    pub text: String,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

/// Runs one batch task on its own thread and sends the outcome back on `tx`.
/// Exactly one outcome is sent per task, even when the service or the sink
/// panics; the panic becomes a failed outcome.
pub fn spawn_task(
    service: Arc<dyn CompletionService>,
    sink: Arc<dyn RunSink>,
    id: TaskId,
    generation: u64,
    req: CompletionRequest,
    tx: mpsc::Sender<TaskOutcome>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            run_task(service.as_ref(), sink.as_ref(), id, generation, &req)
        }))
        .unwrap_or_else(|_| {
            tracing::error!(task = id, "task worker panicked");
            TaskOutcome {
                id,
                generation,
                text: String::new(),
                success: false,
                error: Some("task worker panicked".into()),
                elapsed_ms: start.elapsed().as_millis(),
            }
        });
        let _ = tx.send(outcome);
    })
}

fn run_task(
    service: &dyn CompletionService,
    sink: &dyn RunSink,
    id: TaskId,
    generation: u64,
    req: &CompletionRequest,
) -> TaskOutcome {
    sink.emit(RunEvent::TaskStarted { id });
    let start = Instant::now();
    // Batch tasks are not individually cancellable.
    let never = AtomicBool::new(false);
    let mut on_progress = |p: CompletionProgress| {
        if let CompletionProgress::Chunk(text) = p {
            sink.emit(RunEvent::TaskChunk { id, text });
        }
    };
    let res = service.complete(req, &never, &mut on_progress);
    let elapsed_ms = start.elapsed().as_millis();

    let outcome = match res {
        Ok(out) => TaskOutcome {
            id,
            generation,
            text: out.text,
            success: true,
            error: None,
            elapsed_ms,
        },
        Err(e) => {
            tracing::warn!(task = id, "task failed: {e}");
            TaskOutcome {
                id,
                generation,
                text: String::new(),
                success: false,
                error: Some(e.to_string()),
                elapsed_ms,
            }
        }
    };
    sink.emit(RunEvent::TaskFinished {
        id,
        ok: outcome.success,
        error: outcome.error.clone(),
        elapsed_ms,
    });
    outcome
}

/// An in-flight single run. Stopping sets the local cancel flag and asks the
/// platform to stop the server-side task once its id is known.
pub struct SingleRun {
    service: Arc<dyn CompletionService>,
    cancel: Arc<AtomicBool>,
    task_id: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<Result<CompletionOutcome, ServiceError>>>,
}

impl SingleRun {
    pub fn start(
        service: Arc<dyn CompletionService>,
        sink: Arc<dyn RunSink>,
        req: CompletionRequest,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let task_id = Arc::new(Mutex::new(None::<String>));

        let handle = {
            let service = Arc::clone(&service);
            let cancel = Arc::clone(&cancel);
            let task_id = Arc::clone(&task_id);
            std::thread::spawn(move || {
                sink.emit(RunEvent::SingleStarted);
                let start = Instant::now();
                let mut on_progress = |p: CompletionProgress| match p {
                    CompletionProgress::Started { task_id: t } => {
                        if let Ok(mut g) = task_id.lock() {
                            *g = Some(t);
                        }
                    }
                    CompletionProgress::Chunk(text) => sink.emit(RunEvent::SingleChunk { text }),
                };
                let res = service.complete(&req, &cancel, &mut on_progress);
                let elapsed_ms = start.elapsed().as_millis();
                match &res {
                    Ok(out) => sink.emit(RunEvent::SingleFinished {
                        ok: true,
                        message_id: out.message_id.clone(),
                        error: None,
                        elapsed_ms,
                    }),
                    Err(e) => sink.emit(RunEvent::SingleFinished {
                        ok: false,
                        message_id: None,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    }),
                }
                res
            })
        };

        Self {
            service,
            cancel,
            task_id,
            handle: Some(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn server_task_id(&self) -> Option<String> {
        self.task_id.lock().ok().and_then(|g| g.clone())
    }

    // The remote stop call runs on its own thread so the caller never blocks on it.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let Some(task_id) = self.server_task_id() else {
            tracing::debug!("stop requested before the server task id was known");
            return;
        };
        let service = Arc::clone(&self.service);
        std::thread::spawn(move || {
            if let Err(e) = service.stop(&task_id) {
                tracing::warn!(task = %task_id, "failed to stop generation: {e}");
            }
        });
    }

    pub fn join(mut self) -> Result<CompletionOutcome, ServiceError> {
        match self.handle.take() {
            Some(h) => h
                .join()
                .unwrap_or_else(|_| Err(ServiceError::Stream("completion worker panicked".into()))),
            None => Err(ServiceError::Cancelled),
        }
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    // Streamed text per task, in arrival order.
    pub fn task_text(&self) -> BTreeMap<TaskId, String> {
        let mut out = BTreeMap::<TaskId, String>::new();
        for ev in self.events() {
            if let RunEvent::TaskChunk { id, text } = ev {
                out.entry(id).or_default().push_str(&text);
            }
        }
        out
    }
}

impl RunSink for RecordingSink {
    fn emit(&self, ev: RunEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Rating;

    struct Echo;

    impl CompletionService for Echo {
        fn complete(
            &self,
            req: &CompletionRequest,
            cancel: &AtomicBool,
            on_progress: &mut dyn FnMut(CompletionProgress),
        ) -> Result<CompletionOutcome, ServiceError> {
            on_progress(CompletionProgress::Started {
                task_id: "srv-1".into(),
            });
            let q = req.inputs.get("query").cloned().unwrap_or_default();
            if q == "fail" {
                return Err(ServiceError::Stream("boom".into()));
            }
            if cancel.load(Ordering::Relaxed) {
                return Err(ServiceError::Cancelled);
            }
            on_progress(CompletionProgress::Chunk(format!("echo {q}")));
            Ok(CompletionOutcome {
                text: format!("echo {q}"),
                message_id: Some("m-1".into()),
                task_id: Some("srv-1".into()),
            })
        }

        fn stop(&self, _task_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn feedback(&self, _id: &str, _rating: Option<Rating>) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn req(q: &str) -> CompletionRequest {
        let mut r = CompletionRequest::default();
        r.inputs.insert("query".into(), q.into());
        r
    }

    #[test]
    fn spawn_task_reports_success_and_failure() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel();
        spawn_task(Arc::new(Echo), sink.clone(), 1, 7, req("hi"), tx.clone())
            .join()
            .unwrap();
        spawn_task(Arc::new(Echo), sink.clone(), 2, 7, req("fail"), tx)
            .join()
            .unwrap();

        let a = rx.recv().unwrap();
        assert_eq!((a.id, a.generation, a.success), (1, 7, true));
        assert_eq!(a.text, "echo hi");
        let b = rx.recv().unwrap();
        assert!(!b.success);
        assert!(b.error.unwrap().contains("boom"));
        assert_eq!(sink.task_text().get(&1).map(String::as_str), Some("echo hi"));
    }

    #[test]
    fn single_run_streams_and_returns_message_id() {
        let sink = Arc::new(RecordingSink::default());
        let run = SingleRun::start(Arc::new(Echo), sink.clone(), req("CL vs TDM"));
        let out = run.join().unwrap();
        assert_eq!(out.message_id.as_deref(), Some("m-1"));
        let events = sink.events();
        assert_eq!(events.first(), Some(&RunEvent::SingleStarted));
        assert!(events.contains(&RunEvent::SingleChunk {
            text: "echo CL vs TDM".into()
        }));
        assert!(matches!(
            events.last(),
            Some(RunEvent::SingleFinished { ok: true, .. })
        ));
    }

    struct PanicOnStart;

    impl RunSink for PanicOnStart {
        fn emit(&self, ev: RunEvent) {
            if let RunEvent::TaskStarted { id } = ev {
                panic!("sink broke on task {id}");
            }
        }
    }

    #[test]
    fn panicking_worker_still_sends_a_failed_outcome() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_task(Arc::new(Echo), Arc::new(PanicOnStart), 3, 2, req("hi"), tx);
        assert!(handle.join().is_ok());
        let out = rx.recv().unwrap();
        assert_eq!((out.id, out.generation, out.success), (3, 2, false));
        assert_eq!(out.error.as_deref(), Some("task worker panicked"));
    }

    #[test]
    fn stdout_sink_strips_sequences_split_across_chunks() {
        let sink = StdoutSink::default();
        let mut out = sink.clean_chunk("plan\u{1b}[3");
        out.push_str(&sink.clean_chunk("1m ready"));
        assert_eq!(out, "plan ready");
    }

    #[test]
    fn elapsed_formats_as_hms() {
        assert_eq!(format_elapsed_hms(3725), "01:02:05");
    }
}
