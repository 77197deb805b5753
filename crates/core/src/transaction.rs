use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::money::Money;

/// A normalized transaction record, independent of source-bank formatting.
///
/// Sign convention: negative = outflow, positive = inflow, regardless of how
/// the source file expressed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTransaction {
    pub date: NaiveDate,
    pub amount: Money,
    /// ISO 4217 code, taken from the matched format descriptor.
    pub currency: String,
    /// Description exactly as it appeared in the source row.
    pub raw_description: String,
    /// Cleaned merchant string; falls back to the raw description when no
    /// merchant pattern matched.
    pub merchant: String,
    /// Stable key of the format descriptor this row was mapped under.
    pub source_format: String,
    /// 1-based line number in the source file.
    pub source_line: u64,
    /// Transaction subtype supplied by the first matching merchant pattern,
    /// e.g. "card-present" or "direct-debit".
    pub subtype: Option<String>,
}
