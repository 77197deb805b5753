pub mod catalog;
pub mod dedupe;
pub mod detect;
pub mod map;
pub mod parse;
pub mod pipeline;
pub mod sniff;

pub use catalog::{AmountConvention, BankFormatDescriptor, FormatCatalog, FormatEntry};
pub use dedupe::{
    DedupeConfig, DuplicateDetector, DuplicateStatus, FingerprintStore,
    InMemoryFingerprintStore, StoredTransaction,
};
pub use detect::Detection;
pub use map::{FieldMapper, ValidationError};
pub use parse::{ParseError, RawRow};
pub use pipeline::{
    CancelToken, ImportConfig, ImportError, ImportPipeline, ImportResult, ImportSummary,
    ProgressSink, Stage,
};
pub use sniff::{SniffOutcome, TextEncoding};
