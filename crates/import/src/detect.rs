use chrono::NaiveDate;
use tracing::debug;

use crate::catalog::{
    AmountConvention, BankFormatDescriptor, ColumnRef, FieldMap, FormatCatalog, FormatEntry,
};

const IDENTIFIER_WEIGHT: f64 = 2.0;
const COLUMN_COVERAGE_WEIGHT: f64 = 3.0;
const SAMPLE_HEADER_BONUS: f64 = 2.0;
const DATE_PARSE_CREDIT: f64 = 1.0;

/// Everything the detector gets to look at: sniffed header cells, a handful
/// of data rows, the first stretch of raw content, and the filename hint.
pub struct SniffedSample<'a> {
    pub header: Option<&'a [String]>,
    pub raw_header_line: Option<&'a str>,
    pub rows: &'a [Vec<String>],
    pub content_head: &'a str,
    pub filename: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub format: FormatEntry,
    /// Normalized score in [0,1] for the winning descriptor.
    pub confidence: f64,
}

/// Score every catalog descriptor against the sample and return the best
/// match, or `None` when nothing clears the acceptance threshold. Scoring is
/// additive and order-independent; ties go to the first-registered entry.
pub fn detect(
    catalog: &FormatCatalog,
    sample: &SniffedSample<'_>,
    min_confidence: f64,
) -> Option<Detection> {
    let content_lower = sample.content_head.to_lowercase();
    let filename_lower = sample.filename.map(str::to_lowercase);

    let mut best: Option<(&FormatEntry, f64, f64)> = None;
    for entry in catalog.entries() {
        let (score, max) = score_descriptor(
            &entry.descriptor,
            sample,
            &content_lower,
            filename_lower.as_deref(),
        );
        debug!(format = %entry.descriptor.key, score, max, "scored descriptor");
        if score > best.map_or(0.0, |(_, s, _)| s) {
            best = Some((entry, score, max));
        }
    }

    let (entry, score, max) = best?;
    if max <= 0.0 {
        return None;
    }
    let confidence = (score / max).min(1.0);
    if confidence < min_confidence {
        return None;
    }
    Some(Detection {
        format: entry.clone(),
        confidence,
    })
}

fn score_descriptor(
    d: &BankFormatDescriptor,
    sample: &SniffedSample<'_>,
    content_lower: &str,
    filename_lower: Option<&str>,
) -> (f64, f64) {
    let mut score = 0.0;
    let mut max = 0.0;

    max += d.identifiers.len() as f64 * IDENTIFIER_WEIGHT;
    for id in &d.identifiers {
        let needle = id.to_lowercase();
        let in_content = content_lower.contains(&needle);
        let in_filename = filename_lower.is_some_and(|f| f.contains(&needle));
        if in_content || in_filename {
            score += IDENTIFIER_WEIGHT;
        }
    }

    let named = d.fields.named_columns();
    if !named.is_empty() {
        max += COLUMN_COVERAGE_WEIGHT;
        if let Some(header) = sample.header {
            let found = named
                .iter()
                .filter(|name| {
                    let needle = name.trim().to_lowercase();
                    header
                        .iter()
                        .any(|cell| cell.trim().to_lowercase().contains(&needle))
                })
                .count();
            score += COLUMN_COVERAGE_WEIGHT * found as f64 / named.len() as f64;
        }
    }

    if let Some(expected) = &d.sample_header {
        max += SAMPLE_HEADER_BONUS;
        if let Some(raw) = sample.raw_header_line {
            if normalize_header(expected) == normalize_header(raw) {
                score += SAMPLE_HEADER_BONUS;
            }
        }
    }

    max += DATE_PARSE_CREDIT;
    if sample_date_parses(d, sample) {
        score += DATE_PARSE_CREDIT;
    }

    (score, max)
}

fn sample_date_parses(d: &BankFormatDescriptor, sample: &SniffedSample<'_>) -> bool {
    let Some(date_ref) = &d.fields.date else {
        return false;
    };
    let Some(idx) = date_ref.resolve(sample.header) else {
        return false;
    };
    sample.rows.iter().any(|row| {
        row.get(idx)
            .is_some_and(|cell| NaiveDate::parse_from_str(cell.trim(), &d.date_format).is_ok())
    })
}

fn normalize_header(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

const DATE_KEYWORDS: [&str; 5] = ["date", "datum", "buchungstag", "valuta", "posted"];
const DESCRIPTION_KEYWORDS: [&str; 9] = [
    "description",
    "details",
    "narrative",
    "payee",
    "memo",
    "verwendungszweck",
    "omschrijving",
    "text",
    "name",
];
const AMOUNT_KEYWORDS: [&str; 4] = ["amount", "betrag", "bedrag", "value"];
const DEBIT_KEYWORDS: [&str; 3] = ["debit", "withdrawal", "soll"];
const CREDIT_KEYWORDS: [&str; 3] = ["credit", "deposit", "haben"];

/// Build the generic fallback descriptor by best-effort keyword matching
/// against the header. Used when no catalog entry clears the acceptance
/// threshold; the pipeline marks the result low-confidence.
pub fn generic_format(
    header: Option<&[String]>,
    delimiter: char,
    has_header: bool,
) -> FormatEntry {
    let find = |keywords: &[&str]| -> Option<ColumnRef> {
        let header = header?;
        for keyword in keywords {
            if let Some(idx) = header
                .iter()
                .position(|cell| cell.trim().to_lowercase().contains(keyword))
            {
                return Some(ColumnRef::Index(idx));
            }
        }
        None
    };

    let mut fields = FieldMap {
        date: find(&DATE_KEYWORDS),
        description: find(&DESCRIPTION_KEYWORDS),
        amount: find(&AMOUNT_KEYWORDS),
        debit: find(&DEBIT_KEYWORDS),
        credit: find(&CREDIT_KEYWORDS),
        type_flag: None,
    };

    let convention = if fields.amount.is_some() {
        fields.debit = None;
        fields.credit = None;
        AmountConvention::SingleSigned
    } else if fields.debit.is_some() && fields.credit.is_some() {
        AmountConvention::SeparateDebitCredit
    } else {
        // Positional guess, the common date/description/amount layout.
        fields.date = Some(ColumnRef::Index(0));
        fields.description = Some(ColumnRef::Index(1));
        fields.amount = Some(ColumnRef::Index(2));
        fields.debit = None;
        fields.credit = None;
        AmountConvention::SingleSigned
    };

    let descriptor = BankFormatDescriptor {
        key: "generic".to_string(),
        institution: "Unknown".to_string(),
        country: String::new(),
        // ISO 4217 placeholder for "unknown".
        currency: "XXX".to_string(),
        delimiter,
        has_header,
        skip_rows: 0,
        date_format: "%Y-%m-%d".to_string(),
        date_fallbacks: true,
        decimal_comma: delimiter == ';',
        invert_sign: false,
        convention,
        outflow_markers: Vec::new(),
        inflow_markers: Vec::new(),
        identifiers: Vec::new(),
        sample_header: None,
        fields,
        merchant_patterns: Vec::new(),
    };

    FormatEntry {
        descriptor,
        patterns: Vec::new(),
    }
}
