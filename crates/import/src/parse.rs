use serde::Serialize;
use thiserror::Error;

/// One parsed line: ordered cells plus the 1-based source line number.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub line: u64,
    pub cells: Vec<String>,
}

/// A row-level problem that did not abort the parse.
#[derive(Debug, Clone, Serialize)]
pub struct RowIssue {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug)]
pub struct ParsedRows {
    pub header: Option<Vec<String>>,
    pub rows: Vec<RawRow>,
    pub issues: Vec<RowIssue>,
    /// Data rows encountered, well-formed or not.
    pub rows_read: usize,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("No data rows")]
    NoDataRows,
    #[error("{failed} of {total} rows malformed ({observed_pct:.1}%), over the {ceiling_pct:.1}% ceiling")]
    ErrorRateExceeded {
        failed: usize,
        total: usize,
        observed_pct: f64,
        ceiling_pct: f64,
    },
}

/// Split file content into rows. Quoted fields may contain the delimiter,
/// doubled quotes, and embedded newlines. A row whose field count does not
/// match the expected width is recorded as an issue and excluded, never
/// fatal on its own; the parse as a whole fails only when the malformed
/// fraction exceeds `max_error_rate`.
pub fn parse_rows(
    text: &str,
    delimiter: char,
    has_header: bool,
    skip_rows: usize,
    max_error_rate: f64,
) -> Result<ParsedRows, ParseError> {
    let (body, line_offset) = skip_preamble(text, skip_rows);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter as u8)
        .from_reader(body.as_bytes());

    let mut header: Option<Vec<String>> = None;
    let mut expected: Option<usize> = None;
    let mut rows = Vec::new();
    let mut issues = Vec::new();
    let mut rows_read = 0usize;

    for result in reader.records() {
        let record = result?;
        let line = line_offset + record.position().map_or(0, |p| p.line());
        let mut cells: Vec<String> = record.iter().map(|s| s.to_string()).collect();

        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        if expected.is_none() {
            expected = Some(cells.len());
            if has_header {
                header = Some(cells);
                continue;
            }
        }
        let width = expected.unwrap_or(cells.len());

        rows_read += 1;

        // Extra trailing empty fields are tolerated; anything else is a
        // width mismatch.
        while cells.len() > width && cells.last().is_some_and(|c| c.trim().is_empty()) {
            cells.pop();
        }
        if cells.len() != width {
            issues.push(RowIssue {
                line,
                reason: format!("expected {width} fields, found {}", cells.len()),
            });
            continue;
        }

        rows.push(RawRow { line, cells });
    }

    if rows_read == 0 {
        return Err(ParseError::NoDataRows);
    }

    let observed = issues.len() as f64 / rows_read as f64;
    if observed > max_error_rate {
        return Err(ParseError::ErrorRateExceeded {
            failed: issues.len(),
            total: rows_read,
            observed_pct: observed * 100.0,
            ceiling_pct: max_error_rate * 100.0,
        });
    }

    Ok(ParsedRows {
        header,
        rows,
        issues,
        rows_read,
    })
}

/// Drop `skip_rows` physical lines of preamble, returning the remainder and
/// the number of lines dropped (for line-number accounting).
fn skip_preamble(text: &str, skip_rows: usize) -> (&str, u64) {
    let mut offset = 0;
    let mut skipped = 0u64;
    for _ in 0..skip_rows {
        match text[offset..].find('\n') {
            Some(pos) => {
                offset += pos + 1;
                skipped += 1;
            }
            None => return ("", skip_rows as u64),
        }
    }
    (&text[offset..], skipped)
}
