use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::batch::Scheduler;
use crate::error::{Error, Result};
use crate::prompt::PromptVariable;
use crate::service::{CompletionService, Rating, ServiceError};

pub const COMPLETION_RESULT_COLUMN: &str = "Completion result";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn of(scheduler: &Scheduler) -> Self {
        let c = scheduler.counts();
        Self {
            total: scheduler.tasks().len(),
            pending: c.pending,
            running: c.running,
            completed: c.completed,
            failed: c.failed,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.pending > 0
    }

    pub fn can_export(&self) -> bool {
        self.completed > 0
    }

    pub fn can_retry(&self) -> bool {
        self.failed > 0
    }

    pub fn failed_label(&self) -> Option<String> {
        self.can_retry()
            .then(|| format!("{} failed executions", self.failed))
    }
}

/// Header and one row per task: each variable's input by display name, then
/// the latest completion text.
pub fn export_rows(
    scheduler: &Scheduler,
    vars: &[PromptVariable],
) -> (Vec<String>, Vec<Vec<String>>) {
    let mut header: Vec<String> = vars.iter().map(|v| v.name.clone()).collect();
    header.push(COMPLETION_RESULT_COLUMN.to_string());

    let rows = scheduler
        .tasks()
        .iter()
        .map(|task| {
            let mut row: Vec<String> = vars
                .iter()
                .map(|v| task.params.inputs.get(&v.key).cloned().unwrap_or_default())
                .collect();
            row.push(scheduler.completion(task.id).unwrap_or_default().to_string());
            row
        })
        .collect();
    (header, rows)
}

pub fn write_export<W: Write>(
    out: W,
    scheduler: &Scheduler,
    vars: &[PromptVariable],
) -> Result<()> {
    let (header, rows) = export_rows(scheduler, vars);
    let mut w = csv::Writer::from_writer(out);
    w.write_record(&header)?;
    for row in rows {
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

pub fn export_to_file(path: &Path, scheduler: &Scheduler, vars: &[PromptVariable]) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))?;
    write_export(file, scheduler, vars)?;
    tracing::info!(path = %path.display(), tasks = scheduler.tasks().len(), "results exported");
    Ok(())
}

/// Rating state of the last single-run answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackState {
    pub message_id: Option<String>,
    pub rating: Option<Rating>,
}

impl FeedbackState {
    pub fn for_message(message_id: Option<String>) -> Self {
        Self {
            message_id,
            rating: None,
        }
    }

    /// Posts `rating` (or clears it with `None`). Without a message id this is
    /// a no-op and returns `Ok(false)`.
    pub fn submit(
        &mut self,
        service: &dyn CompletionService,
        rating: Option<Rating>,
    ) -> std::result::Result<bool, ServiceError> {
        let Some(id) = self.message_id.as_deref() else {
            return Ok(false);
        };
        service.feedback(id, rating)?;
        self.rating = rating;
        Ok(true)
    }
}
