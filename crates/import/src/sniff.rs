use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Delimiter candidates in priority order; ties go to the earlier entry.
const CANDIDATES: [char; 4] = [',', ';', '\t', '|'];

/// How many lines of the file the sniffer looks at.
const SAMPLE_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Latin1,
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TextEncoding::Utf8 => "UTF-8",
            TextEncoding::Utf8Bom => "UTF-8 (BOM)",
            TextEncoding::Utf16Le => "UTF-16LE",
            TextEncoding::Utf16Be => "UTF-16BE",
            TextEncoding::Latin1 => "ISO-8859-1",
        };
        f.write_str(name)
    }
}

/// What the sniffer concluded about a file before any catalog is consulted.
#[derive(Debug, Clone)]
pub struct SniffOutcome {
    pub encoding: TextEncoding,
    pub delimiter: char,
    pub likely_has_header: bool,
    /// Consistent field count the winning delimiter produced.
    pub field_count: usize,
    /// Set when no candidate yielded a consistent field count of at least
    /// two; the delimiter is then a best-effort pick.
    pub low_confidence: bool,
}

/// Decode raw file bytes to text. Byte-order marks are honoured first; bytes
/// that are not valid UTF-8 fall back to Latin-1, which cannot fail.
pub fn decode(bytes: &[u8]) -> (String, TextEncoding) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(rest).into_owned(), TextEncoding::Utf8Bom);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return (decode_utf16(rest, true), TextEncoding::Utf16Le);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return (decode_utf16(rest, false), TextEncoding::Utf16Be);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), TextEncoding::Utf8),
        Err(_) => (
            bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Latin1,
        ),
    }
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Infer delimiter and header presence from decoded text.
pub fn sniff(text: &str, encoding: TextEncoding) -> SniffOutcome {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SAMPLE_LINES)
        .collect();

    let (delimiter, field_count, consistent) = infer_delimiter(&lines);
    let likely_has_header = header_heuristic(&lines, delimiter);

    SniffOutcome {
        encoding,
        delimiter,
        likely_has_header,
        field_count,
        low_confidence: !consistent,
    }
}

/// A delimiter is accepted only when every sampled line agrees on one field
/// count, allowing for empty trailing fields that exporters variously omit
/// or append. The candidate producing the highest consistent count wins;
/// ties go to candidate priority order.
fn infer_delimiter(lines: &[&str]) -> (char, usize, bool) {
    let mut best: Option<(char, usize)> = None;
    for &candidate in &CANDIDATES {
        if let Some(width) = consistent_width(lines, candidate) {
            if width >= 2 && best.map_or(true, |(_, w)| width > w) {
                best = Some((candidate, width));
            }
        }
    }
    if let Some((delimiter, width)) = best {
        return (delimiter, width, true);
    }

    // Best effort: the candidate with the widest single line.
    let mut fallback = (CANDIDATES[0], 1);
    for &candidate in &CANDIDATES {
        let widest = lines
            .iter()
            .map(|l| trimmed_width(l, candidate))
            .max()
            .unwrap_or(1);
        if widest > fallback.1 {
            fallback = (candidate, widest);
        }
    }
    (fallback.0, fallback.1, false)
}

/// Field counts for one line: the full count, and the count with empty
/// trailing fields removed.
fn field_widths(line: &str, delimiter: char) -> (usize, usize) {
    let cells = split_line(line, delimiter);
    let full = cells.len();
    let trimmed = cells
        .iter()
        .rposition(|c| !c.trim().is_empty())
        .map_or(0, |i| i + 1);
    (full, trimmed)
}

fn trimmed_width(line: &str, delimiter: char) -> usize {
    field_widths(line, delimiter).1
}

fn consistent_width(lines: &[&str], delimiter: char) -> Option<usize> {
    let widths: Vec<(usize, usize)> = lines
        .iter()
        .map(|l| field_widths(l, delimiter))
        .collect();
    let target = widths.iter().map(|&(_, t)| t).max()?;
    let all_fit = widths
        .iter()
        .all(|&(full, trimmed)| trimmed == target || full >= target);
    all_fit.then_some(target)
}

/// Quote-aware split of a single line. Doubled quotes inside a quoted field
/// are the standard escape for a literal quote.
pub(crate) fn split_line(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            cells.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    cells.push(current);
    cells
}

/// Row 1 is called a header when a strict majority of its cells are neither
/// numeric nor dates while a majority of row 2's aligned, populated cells
/// are. Empty cells carry no signal and sit out the vote.
fn header_heuristic(lines: &[&str], delimiter: char) -> bool {
    if lines.len() < 2 {
        return false;
    }
    let first = split_line(lines[0], delimiter);
    let second = split_line(lines[1], delimiter);
    if first.is_empty() || second.is_empty() {
        return false;
    }

    let textual = first.iter().filter(|c| !is_data_cell(c)).count();
    if textual * 2 <= first.len() {
        return false;
    }

    let aligned = second.len().min(first.len());
    let populated: Vec<&String> = second[..aligned]
        .iter()
        .filter(|c| !c.trim().is_empty())
        .collect();
    if populated.is_empty() {
        return false;
    }
    let data = populated.iter().filter(|c| is_data_cell(c)).count();
    data * 2 >= populated.len()
}

const DATE_PROBE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%d.%m.%y",
    "%Y/%m/%d",
    "%Y%m%d",
];

pub(crate) fn is_data_cell(cell: &str) -> bool {
    let cell = cell.trim();
    if cell.is_empty() {
        return false;
    }
    let numeric: String = cell
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' ' | '\u{a0}'))
        .collect();
    if Decimal::from_str(&numeric).is_ok() {
        return true;
    }
    DATE_PROBE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(cell, fmt).is_ok())
}
