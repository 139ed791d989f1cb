use thiserror::Error;

use crate::prompt::PromptVariable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("Please input content in the uploaded file.")]
    Empty,
    #[error("The uploaded file does not match the structure.")]
    HeaderMismatch,
    #[error("Please input at least one row in the uploaded file.")]
    NoRows,
    #[error("Row {row} is empty")]
    GapBlankLine { row: usize },
    #[error("Row {row}: {var} value can not be empty")]
    MissingRequired { row: usize, var: String },
    #[error("Row {row}: {var} value can not be more than {max} characters")]
    ExceedsMaxLength { row: usize, var: String, max: usize },
    #[error("Please wait for the response to the batch task to complete.")]
    Busy,
}

// Line number of the data row at `index`: the header occupies line 1.
fn file_row(index: usize) -> usize {
    index + 2
}

pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.is_empty())
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

/// Validates a parsed batch file and returns the data rows with the header and
/// blank padding removed.
pub fn check_batch_inputs(
    data: &[Vec<String>],
    vars: &[PromptVariable],
    default_max_len: usize,
) -> Result<Vec<Vec<String>>, BatchError> {
    let Some(header) = data.first() else {
        return Err(BatchError::Empty);
    };
    let header_matches = vars
        .iter()
        .enumerate()
        .all(|(i, v)| header.get(i).is_some_and(|h| *h == v.name));
    if !header_matches {
        return Err(BatchError::HeaderMismatch);
    }
    check_rows(&data[1..], vars, default_max_len)
}

/// Re-validates header-less rows, e.g. a payload already cleaned by
/// [`check_batch_inputs`].
pub fn check_rows(
    rows: &[Vec<String>],
    vars: &[PromptVariable],
    default_max_len: usize,
) -> Result<Vec<Vec<String>>, BatchError> {
    if rows.is_empty() {
        return Err(BatchError::NoRows);
    }

    let first = rows.iter().position(|r| !is_blank_row(r));
    let last = rows.iter().rposition(|r| !is_blank_row(r));
    if let (Some(first), Some(last)) = (first, last) {
        if let Some(gap) = (first..=last).find(|&i| is_blank_row(&rows[i])) {
            return Err(BatchError::GapBlankLine { row: file_row(gap) });
        }
    }

    let kept: Vec<(usize, &Vec<String>)> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| !is_blank_row(r))
        .collect();
    if kept.is_empty() {
        return Err(BatchError::NoRows);
    }

    for &(index, row) in &kept {
        for (var_index, var) in vars.iter().enumerate() {
            let value = cell(row, var_index);
            if var.is_string() {
                let max = var.max_len(default_max_len);
                if value.chars().count() > max {
                    return Err(BatchError::ExceedsMaxLength {
                        row: file_row(index),
                        var: var.name.clone(),
                        max,
                    });
                }
            }
            if var.is_required() && value.trim().is_empty() {
                return Err(BatchError::MissingRequired {
                    row: file_row(index),
                    var: var.name.clone(),
                });
            }
        }
    }

    Ok(kept.into_iter().map(|(_, r)| r.clone()).collect())
}
