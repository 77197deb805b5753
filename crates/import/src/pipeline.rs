use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use bankfeed_core::{CanonicalTransaction, Money};

use crate::catalog::FormatCatalog;
use crate::dedupe::{DedupeConfig, DuplicateDetector, DuplicateStatus, FingerprintStore};
use crate::detect::{self, SniffedSample};
use crate::map::FieldMapper;
use crate::parse::{self, ParseError};
use crate::sniff;

/// Pipeline stages, entered strictly in order; `Failed` is terminal and
/// reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    Validating,
    Sniffing,
    DetectingFormat,
    Parsing,
    Mapping,
    Deduplicating,
    Completed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Validating => "validating",
            Stage::Sniffing => "sniffing",
            Stage::DetectingFormat => "detecting-format",
            Stage::Parsing => "parsing",
            Stage::Mapping => "mapping",
            Stage::Deduplicating => "deduplicating",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Receives a progress event at every stage transition and chunk boundary.
pub trait ProgressSink {
    fn progress(&mut self, stage: Stage, percent: f32);
}

impl<F: FnMut(Stage, f32)> ProgressSink for F {
    fn progress(&mut self, stage: Stage, percent: f32) {
        self(stage, percent)
    }
}

/// Sink for callers that do not care about progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _stage: Stage, _percent: f32) {}
}

/// Cooperative cancellation flag, polled at chunk boundaries. Cloning
/// shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Hard input size ceiling; larger files fail immediately.
    pub max_file_bytes: usize,
    /// Fatal ceiling on (malformed + invalid) / rows read.
    pub max_error_rate: f64,
    /// Rows per chunk between progress/cancellation checks.
    pub chunk_size: usize,
    /// Minimum normalized detection score to accept a catalog format.
    pub min_confidence: f64,
    /// Data rows handed to the detector as a sample.
    pub sample_rows: usize,
    pub dedupe: DedupeConfig,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            max_file_bytes: 10 * 1024 * 1024,
            max_error_rate: 0.10,
            chunk_size: 256,
            min_confidence: 0.3,
            sample_rows: 10,
            dedupe: DedupeConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Input is empty")]
    EmptyInput,
    #[error("Input of {size} bytes exceeds the {ceiling} byte ceiling")]
    OversizedInput { size: usize, ceiling: usize },
    #[error("Input is not readable as delimited text")]
    UnreadableInput,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Import cancelled")]
    Cancelled,
}

/// A row excluded from the batch, with the line it came from and why.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
}

/// A transaction kept in the output but flagged for human review.
#[derive(Debug, Clone, Serialize)]
pub struct ProbableDuplicate {
    pub line: u64,
    pub score: f64,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub rows_read: usize,
    pub rows_parsed: usize,
    pub rejected: Vec<RejectedRow>,
    pub accepted: usize,
    pub exact_duplicates: usize,
    pub probable_duplicates: Vec<ProbableDuplicate>,
    pub detected_format: String,
    pub confidence: f64,
    pub low_confidence: bool,
    pub encoding: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResult {
    pub accepted: Vec<CanonicalTransaction>,
    pub summary: ImportSummary,
    pub detected_format: String,
    pub confidence: f64,
}

/// Orchestrates one import call: sniff, detect, parse, map, deduplicate.
/// Holds no mutable state between calls; concurrent calls need only their
/// own store snapshot and token.
pub struct ImportPipeline<'a> {
    catalog: &'a FormatCatalog,
    config: ImportConfig,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(catalog: &'a FormatCatalog, config: ImportConfig) -> Self {
        ImportPipeline { catalog, config }
    }

    /// Run the pipeline over one exported file. Row-level problems land in
    /// the summary; only file-level conditions, a breached error-rate
    /// ceiling, or cancellation produce an `Err`. Nothing is surfaced to
    /// the caller on `Err`; an aborted call is all-or-nothing.
    pub fn run(
        &self,
        input: &[u8],
        filename: Option<&str>,
        store: &dyn FingerprintStore,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<ImportResult, ImportError> {
        let result = self.run_inner(input, filename, store, progress, cancel);
        if let Err(e) = &result {
            warn!(error = %e, "import failed");
            progress.progress(Stage::Failed, 100.0);
        }
        result
    }

    fn run_inner(
        &self,
        input: &[u8],
        filename: Option<&str>,
        store: &dyn FingerprintStore,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<ImportResult, ImportError> {
        let check = |cancel: &CancelToken| -> Result<(), ImportError> {
            if cancel.is_cancelled() {
                Err(ImportError::Cancelled)
            } else {
                Ok(())
            }
        };

        // ── Validating ────────────────────────────────────────────────────
        progress.progress(Stage::Validating, 0.0);
        if input.is_empty() {
            return Err(ImportError::EmptyInput);
        }
        if input.len() > self.config.max_file_bytes {
            return Err(ImportError::OversizedInput {
                size: input.len(),
                ceiling: self.config.max_file_bytes,
            });
        }
        check(cancel)?;

        // ── Sniffing ──────────────────────────────────────────────────────
        progress.progress(Stage::Sniffing, 10.0);
        let (text, encoding) = sniff::decode(input);
        if text.contains('\0') {
            return Err(ImportError::UnreadableInput);
        }
        if text.trim().is_empty() {
            return Err(ImportError::EmptyInput);
        }
        let sniffed = sniff::sniff(&text, encoding);
        debug!(
            delimiter = %sniffed.delimiter.escape_debug(),
            encoding = %sniffed.encoding,
            header = sniffed.likely_has_header,
            "sniffed input"
        );
        check(cancel)?;

        // ── DetectingFormat ───────────────────────────────────────────────
        progress.progress(Stage::DetectingFormat, 20.0);
        let lines: Vec<&str> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(self.config.sample_rows + 1)
            .collect();
        let header_cells: Option<Vec<String>> = if sniffed.likely_has_header {
            lines.first().map(|l| sniff::split_line(l, sniffed.delimiter))
        } else {
            None
        };
        let data_start = usize::from(sniffed.likely_has_header);
        let sample_rows: Vec<Vec<String>> = lines[data_start.min(lines.len())..]
            .iter()
            .map(|l| sniff::split_line(l, sniffed.delimiter))
            .collect();
        let content_head: String = text.chars().take(2048).collect();
        let sample = SniffedSample {
            header: header_cells.as_deref(),
            raw_header_line: if sniffed.likely_has_header {
                lines.first().copied()
            } else {
                None
            },
            rows: &sample_rows,
            content_head: &content_head,
            filename,
        };

        let (format, confidence, low_confidence) =
            match detect::detect(self.catalog, &sample, self.config.min_confidence) {
                Some(detection) => {
                    info!(
                        format = %detection.format.descriptor.key,
                        confidence = detection.confidence,
                        "matched catalog format"
                    );
                    (detection.format, detection.confidence, false)
                }
                None => {
                    info!("no catalog format cleared the threshold, using generic fallback");
                    let generic = detect::generic_format(
                        header_cells.as_deref(),
                        sniffed.delimiter,
                        sniffed.likely_has_header,
                    );
                    (generic, 0.0, true)
                }
            };
        let low_confidence = low_confidence || sniffed.low_confidence;
        check(cancel)?;

        // ── Parsing ───────────────────────────────────────────────────────
        progress.progress(Stage::Parsing, 30.0);
        let descriptor = &format.descriptor;
        let parsed = parse::parse_rows(
            &text,
            sniffed.delimiter,
            descriptor.has_header,
            descriptor.skip_rows,
            self.config.max_error_rate,
        )?;
        check(cancel)?;

        // ── Mapping ───────────────────────────────────────────────────────
        progress.progress(Stage::Mapping, 40.0);
        let mapper = FieldMapper::new(&format, parsed.header.as_deref());
        let mut rejected: Vec<RejectedRow> = parsed
            .issues
            .iter()
            .map(|i| RejectedRow {
                line: i.line,
                reason: i.reason.clone(),
            })
            .collect();
        let mut batch = Vec::with_capacity(parsed.rows.len());
        let total = parsed.rows.len().max(1);
        let mut done = 0usize;
        for chunk in parsed.rows.chunks(self.config.chunk_size) {
            check(cancel)?;
            for row in chunk {
                match mapper.map_row(row) {
                    Ok(tx) => batch.push(tx),
                    Err(e) => rejected.push(RejectedRow {
                        line: row.line,
                        reason: e.to_string(),
                    }),
                }
            }
            done += chunk.len();
            progress.progress(Stage::Mapping, 40.0 + 30.0 * done as f32 / total as f32);
        }

        // Parse and validation failures share one ceiling.
        let failed = rejected.len();
        let observed = failed as f64 / parsed.rows_read as f64;
        if observed > self.config.max_error_rate {
            return Err(ParseError::ErrorRateExceeded {
                failed,
                total: parsed.rows_read,
                observed_pct: observed * 100.0,
                ceiling_pct: self.config.max_error_rate * 100.0,
            }
            .into());
        }

        // ── Deduplicating ─────────────────────────────────────────────────
        progress.progress(Stage::Deduplicating, 70.0);
        let mut detector = DuplicateDetector::new(&self.config.dedupe, store);
        let mut accepted = Vec::with_capacity(batch.len());
        let mut exact_duplicates = 0usize;
        let mut probable_duplicates = Vec::new();
        let total = batch.len().max(1);
        let mut done = 0usize;
        for chunk in batch.chunks(self.config.chunk_size) {
            check(cancel)?;
            for tx in chunk {
                match detector.classify(tx).1 {
                    DuplicateStatus::ExactDuplicate => exact_duplicates += 1,
                    DuplicateStatus::ProbableDuplicate { score } => {
                        probable_duplicates.push(ProbableDuplicate {
                            line: tx.source_line,
                            score,
                            date: tx.date,
                            amount: tx.amount,
                            description: tx.raw_description.clone(),
                        });
                        accepted.push(tx.clone());
                    }
                    DuplicateStatus::New => accepted.push(tx.clone()),
                }
            }
            done += chunk.len();
            progress.progress(
                Stage::Deduplicating,
                70.0 + 25.0 * done as f32 / total as f32,
            );
        }

        // ── Completed ─────────────────────────────────────────────────────
        let summary = ImportSummary {
            rows_read: parsed.rows_read,
            rows_parsed: parsed.rows.len(),
            rejected,
            accepted: accepted.len(),
            exact_duplicates,
            probable_duplicates,
            detected_format: descriptor.key.clone(),
            confidence,
            low_confidence,
            encoding: sniffed.encoding.to_string(),
        };
        info!(
            format = %summary.detected_format,
            accepted = summary.accepted,
            exact_duplicates = summary.exact_duplicates,
            flagged = summary.probable_duplicates.len(),
            rejected = summary.rejected.len(),
            "import completed"
        );
        progress.progress(Stage::Completed, 100.0);

        Ok(ImportResult {
            detected_format: summary.detected_format.clone(),
            confidence,
            accepted,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::{InMemoryFingerprintStore, StoredTransaction};

    const ANZ_FILE: &str = "\
Date,Amount,Details,Particulars,Reference
15/01/2024,-4.50,EFTPOS 1234567 Coffee Shop,,
16/01/2024,-12.00,VISA PURCHASE NETFLIX.COM,,
17/01/2024,1500.00,SALARY ACME LTD,,
15/01/2024,-4.50,EFTPOS 9876543 Coffee Shop,,
";

    fn run_anz(
        store: &dyn FingerprintStore,
    ) -> Result<ImportResult, ImportError> {
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        pipeline.run(
            ANZ_FILE.as_bytes(),
            Some("anz-jan.csv"),
            store,
            &mut NoProgress,
            &CancelToken::new(),
        )
    }

    #[test]
    fn end_to_end_detects_maps_and_dedups() {
        let store = InMemoryFingerprintStore::new();
        let result = run_anz(&store).unwrap();

        assert_eq!(result.detected_format, "anz-nz");
        assert!(result.confidence > 0.9);
        assert!(!result.summary.low_confidence);
        assert_eq!(result.summary.rows_read, 4);
        assert_eq!(result.summary.rows_parsed, 4);
        // The re-exported EFTPOS row differs only by reference code.
        assert_eq!(result.summary.exact_duplicates, 1);
        assert_eq!(result.accepted.len(), 3);

        let coffee = &result.accepted[0];
        assert_eq!(coffee.amount.minor(), -450);
        assert_eq!(coffee.merchant, "Coffee Shop");
        assert_eq!(coffee.subtype.as_deref(), Some("card-present"));
        assert_eq!(coffee.currency, "NZD");
        assert_eq!(coffee.source_line, 2);

        let salary = &result.accepted[2];
        assert_eq!(salary.amount.minor(), 150000);
        assert!(salary.subtype.is_none());
    }

    #[test]
    fn rerun_against_stored_output_accepts_nothing() {
        let mut store = InMemoryFingerprintStore::new();
        let first = run_anz(&store).unwrap();
        let config = DedupeConfig::default();
        for tx in &first.accepted {
            store.insert(StoredTransaction::from(tx), &config);
        }

        let second = run_anz(&store).unwrap();
        assert_eq!(second.accepted.len(), 0);
        assert_eq!(second.summary.exact_duplicates, 4);
    }

    #[test]
    fn identical_input_gives_identical_results() {
        let store = InMemoryFingerprintStore::new();
        let a = run_anz(&store).unwrap();
        let b = run_anz(&store).unwrap();
        assert_eq!(a.detected_format, b.detected_format);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.accepted.len(), b.accepted.len());
        assert_eq!(
            serde_json::to_string(&a.summary).unwrap(),
            serde_json::to_string(&b.summary).unwrap()
        );
    }

    #[test]
    fn error_rate_over_ceiling_fails() {
        let mut file = String::from("Date,Description,Amount\n");
        for _ in 0..17 {
            file.push_str("2024-01-15,OK ROW,-1.00\n");
        }
        for _ in 0..3 {
            file.push_str("2024-01-15,BAD DATE ROW,not-an-amount\n");
        }
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let result = pipeline.run(
            file.as_bytes(),
            None,
            &store,
            &mut NoProgress,
            &CancelToken::new(),
        );
        assert!(matches!(
            result,
            Err(ImportError::Parse(ParseError::ErrorRateExceeded { failed: 3, total: 20, .. }))
        ));
    }

    #[test]
    fn error_rate_under_ceiling_completes_with_rejects() {
        let mut file = String::from("Date,Description,Amount\n");
        for _ in 0..19 {
            file.push_str("2024-01-15,OK ROW,-1.00\n");
        }
        file.push_str("2024-01-15,BAD ROW,not-an-amount\n");
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let result = pipeline
            .run(
                file.as_bytes(),
                None,
                &store,
                &mut NoProgress,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.summary.rejected.len(), 1);
        assert_eq!(result.summary.rejected[0].line, 21);
        // 19 rows map, and they all share one fingerprint: 18 are in-file
        // exact duplicates of the first.
        assert_eq!(result.summary.exact_duplicates, 18);
        assert_eq!(result.accepted.len(), 1);
    }

    #[test]
    fn unknown_header_falls_back_to_generic() {
        let file = "Date,Description,Amount\n\
                    2024-01-15,SOMETHING NOVEL,-3.00\n\
                    2024-01-16,OTHER THING,4.00\n";
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let result = pipeline
            .run(
                file.as_bytes(),
                None,
                &store,
                &mut NoProgress,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.detected_format, "generic");
        assert!(result.summary.low_confidence);
        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.accepted[0].amount.minor(), -300);
    }

    #[test]
    fn empty_input_fails() {
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let result = pipeline.run(b"", None, &store, &mut NoProgress, &CancelToken::new());
        assert!(matches!(result, Err(ImportError::EmptyInput)));
    }

    #[test]
    fn oversized_input_fails() {
        let catalog = FormatCatalog::builtin().unwrap();
        let config = ImportConfig {
            max_file_bytes: 16,
            ..ImportConfig::default()
        };
        let pipeline = ImportPipeline::new(&catalog, config);
        let store = InMemoryFingerprintStore::new();
        let result = pipeline.run(
            ANZ_FILE.as_bytes(),
            None,
            &store,
            &mut NoProgress,
            &CancelToken::new(),
        );
        assert!(matches!(
            result,
            Err(ImportError::OversizedInput { ceiling: 16, .. })
        ));
    }

    #[test]
    fn cancellation_discards_everything() {
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = pipeline.run(
            ANZ_FILE.as_bytes(),
            None,
            &store,
            &mut NoProgress,
            &cancel,
        );
        assert!(matches!(result, Err(ImportError::Cancelled)));
    }

    #[test]
    fn progress_moves_forward_through_stages() {
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let mut events: Vec<(Stage, f32)> = Vec::new();
        let mut sink = |stage: Stage, percent: f32| events.push((stage, percent));
        pipeline
            .run(
                ANZ_FILE.as_bytes(),
                Some("anz-jan.csv"),
                &store,
                &mut sink,
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(events.first().map(|e| e.0), Some(Stage::Validating));
        assert_eq!(events.last().copied(), Some((Stage::Completed, 100.0)));
        assert!(events.windows(2).all(|w| w[0].1 <= w[1].1));
        let stages: Vec<Stage> = events.iter().map(|e| e.0).collect();
        for expected in [
            Stage::Validating,
            Stage::Sniffing,
            Stage::DetectingFormat,
            Stage::Parsing,
            Stage::Mapping,
            Stage::Deduplicating,
            Stage::Completed,
        ] {
            assert!(stages.contains(&expected), "missing stage {expected}");
        }
    }

    #[test]
    fn failed_stage_is_emitted_on_fatal_error() {
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let mut events: Vec<Stage> = Vec::new();
        let mut sink = |stage: Stage, _| events.push(stage);
        let result = pipeline.run(b"", None, &store, &mut sink, &CancelToken::new());
        assert!(result.is_err());
        assert_eq!(events.last().copied(), Some(Stage::Failed));
    }

    #[test]
    fn german_semicolon_export_end_to_end() {
        let file = "Auftragskonto;Buchungstag;Valutadatum;Buchungstext;Verwendungszweck;Betrag;Waehrung\n\
                    DE0012;15.01.24;15.01.24;KARTENZAHLUNG;KARTENZAHLUNG Baeckerei Schmidt;-4,50;EUR\n\
                    DE0012;16.01.24;16.01.24;LASTSCHRIFT;LASTSCHRIFT Miete Januar;-850,00;EUR\n";
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let result = pipeline
            .run(
                file.as_bytes(),
                Some("umsaetze-sparkasse.csv"),
                &store,
                &mut NoProgress,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.detected_format, "sparkasse-de");
        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.accepted[0].amount.minor(), -450);
        assert_eq!(result.accepted[0].subtype.as_deref(), Some("card-present"));
        assert_eq!(result.accepted[1].amount.minor(), -85000);
        assert_eq!(result.accepted[1].subtype.as_deref(), Some("direct-debit"));
        assert_eq!(result.accepted[1].merchant, "Miete Januar");
    }

    #[test]
    fn ing_type_flag_export_end_to_end() {
        let file = "Datum;Naam / Omschrijving;Rekening;Tegenrekening;Code;Af Bij;Bedrag (EUR);Mutatiesoort;Mededelingen\n\
                    20240115;ALBERT HEIJN;NL01;;BA;Af;23,45;Betaalautomaat;\n\
                    20240125;WERKGEVER BV;NL01;;GT;Bij;2.100,00;Overschrijving;\n";
        let catalog = FormatCatalog::builtin().unwrap();
        let pipeline = ImportPipeline::new(&catalog, ImportConfig::default());
        let store = InMemoryFingerprintStore::new();
        let result = pipeline
            .run(
                file.as_bytes(),
                None,
                &store,
                &mut NoProgress,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.detected_format, "ing-nl");
        assert_eq!(result.accepted[0].amount.minor(), -2345);
        assert_eq!(result.accepted[1].amount.minor(), 210000);
    }
}
