use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

struct Parsed {
    cells: Vec<String>,
    // Reader line after the record's terminator was consumed.
    line_after: u64,
    embedded_newlines: u64,
}

/// Parses CSV text into rows of cells. The first row is the header.
///
/// The csv reader skips empty lines, so they are rebuilt from its line
/// counter and kept as single-empty-cell rows. Validation needs them to tell
/// a gap between rows from trailing padding.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_reader(text.as_bytes());

    let mut parsed = Vec::new();
    let mut record = csv::StringRecord::new();
    while rdr.read_record(&mut record)? {
        let mut cells: Vec<String> = record.iter().map(str::to_string).collect();
        // Only LF terminates a record; a CRLF leaves its CR on the last cell.
        if let Some(last) = cells.last_mut() {
            if last.ends_with('\r') {
                last.pop();
            }
        }
        parsed.push(Parsed {
            embedded_newlines: cells.iter().map(|c| c.matches('\n').count() as u64).sum(),
            cells,
            line_after: rdr.position().line(),
        });
    }
    let end_line = rdr.position().line();

    let mut rows = Vec::with_capacity(parsed.len());
    let mut next_line = 1u64;
    let count = parsed.len();
    for (i, p) in parsed.into_iter().enumerate() {
        let terminated = u64::from(i + 1 < count || text.ends_with('\n'));
        let start_line = p.line_after - p.embedded_newlines - terminated;
        push_blank_rows(&mut rows, start_line.saturating_sub(next_line));
        rows.push(p.cells);
        next_line = p.line_after;
    }
    push_blank_rows(&mut rows, end_line.saturating_sub(next_line));
    Ok(rows)
}

fn push_blank_rows(rows: &mut Vec<Vec<String>>, n: u64) {
    for _ in 0..n {
        rows.push(vec![String::new()]);
    }
}

pub fn read_csv_file(path: &Path) -> Result<Vec<Vec<String>>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let rows = parse_csv(&text)?;
    tracing::debug!(path = %path.display(), rows = rows.len(), "batch file parsed");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn keeps_blank_lines_and_drops_final_newline() {
        let rows = parse_csv("Query\r\nA\r\n\r\nB\r\n").unwrap();
        assert_eq!(rows, vec![row(&["Query"]), row(&["A"]), row(&[""]), row(&["B"])]);
    }

    #[test]
    fn quoted_cells_may_span_lines() {
        let rows = parse_csv("Query,Context\n\"multi\nline\",\"a, b\"\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], row(&["multi\nline", "a, b"]));
    }

    #[test]
    fn stray_quote_in_unquoted_cell_is_literal() {
        let rows = parse_csv("Query\nCompare a 5\" screen\nSecond question\nThird question\n")
            .unwrap();
        assert_eq!(
            rows,
            vec![
                row(&["Query"]),
                row(&["Compare a 5\" screen"]),
                row(&["Second question"]),
                row(&["Third question"]),
            ]
        );

        let rows = parse_csv("Query\nA 5\" x\n\nB\n").unwrap();
        assert_eq!(rows, vec![row(&["Query"]), row(&["A 5\" x"]), row(&[""]), row(&["B"])]);
    }

    #[test]
    fn blank_lines_around_multiline_cells() {
        let rows = parse_csv("\nQuery,Context\n\"a\nb\",x\n\n\nc,y").unwrap();
        assert_eq!(
            rows,
            vec![
                row(&[""]),
                row(&["Query", "Context"]),
                row(&["a\nb", "x"]),
                row(&[""]),
                row(&[""]),
                row(&["c", "y"]),
            ]
        );
    }

    #[test]
    fn strips_byte_order_mark() {
        let rows = parse_csv("\u{feff}Query\nجلسة\n").unwrap();
        assert_eq!(rows, vec![row(&["Query"]), row(&["جلسة"])]);
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("batch.csv");
        fs::write(&p, "Query\nTop 5 CL responsibilities\n").unwrap();
        let rows = read_csv_file(&p).unwrap();
        assert_eq!(rows[1], row(&["Top 5 CL responsibilities"]));
        assert!(read_csv_file(&dir.path().join("missing.csv")).is_err());
    }
}
