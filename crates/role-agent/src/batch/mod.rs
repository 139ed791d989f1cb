pub mod input;
pub mod scheduler;
pub mod session;
pub mod validate;

pub use input::{parse_csv, read_csv_file};
pub use scheduler::{Counts, Scheduler, Task, TaskId, TaskParams, TaskStatus};
pub use session::BatchSession;
pub use validate::{BatchError, check_batch_inputs, check_rows};

use crate::notify::{Notify, Toast};
use crate::prompt::PromptVariable;

/// Submits a batch and reports a rejection as a single toast: busy is
/// informational, anything else is an error. Returns the number of tasks.
pub fn submit_with_notice(
    session: &mut BatchSession,
    data: &[Vec<String>],
    vars: &[PromptVariable],
    default_max_len: usize,
    notify: &dyn Notify,
) -> Option<usize> {
    match session.submit(data, vars, default_max_len) {
        Ok(n) => Some(n),
        Err(e @ BatchError::Busy) => {
            notify.notify(Toast::info(e.to_string()));
            None
        }
        Err(e) => {
            tracing::info!("batch rejected: {e}");
            notify.notify(Toast::error(e.to_string()));
            None
        }
    }
}
