use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// How a source format expresses the sign of an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmountConvention {
    /// One signed amount column.
    SingleSigned,
    /// One unsigned magnitude column plus a separate type/indicator column.
    UnsignedWithTypeFlag,
    /// Separate debit and credit columns, exactly one populated per row.
    SeparateDebitCredit,
}

/// A source column referenced either by header name or by 0-based index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl ColumnRef {
    /// Resolve to a 0-based cell index. Name refs match a header cell
    /// exactly first, then by substring, case-insensitively.
    pub fn resolve(&self, header: Option<&[String]>) -> Option<usize> {
        match self {
            ColumnRef::Index(i) => Some(*i),
            ColumnRef::Name(name) => {
                let header = header?;
                let needle = name.trim().to_lowercase();
                header
                    .iter()
                    .position(|cell| cell.trim().to_lowercase() == needle)
                    .or_else(|| {
                        header
                            .iter()
                            .position(|cell| cell.trim().to_lowercase().contains(&needle))
                    })
            }
        }
    }
}

/// Canonical field → source column mapping for one format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMap {
    pub date: Option<ColumnRef>,
    pub description: Option<ColumnRef>,
    pub amount: Option<ColumnRef>,
    pub debit: Option<ColumnRef>,
    pub credit: Option<ColumnRef>,
    pub type_flag: Option<ColumnRef>,
}

impl FieldMap {
    /// Column names this map declares, for header-coverage scoring.
    pub fn named_columns(&self) -> Vec<&str> {
        [
            &self.date,
            &self.description,
            &self.amount,
            &self.debit,
            &self.credit,
            &self.type_flag,
        ]
        .into_iter()
        .filter_map(|c| match c {
            Some(ColumnRef::Name(n)) => Some(n.as_str()),
            _ => None,
        })
        .collect()
    }
}

/// A merchant cleanup rule: regex pattern tagged with a transaction subtype.
/// Rules are evaluated in declared order; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantPattern {
    pub pattern: String,
    pub subtype: String,
}

/// Static metadata describing one institution's export layout and
/// conventions. Loaded once at startup and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankFormatDescriptor {
    pub key: String,
    pub institution: String,
    pub country: String,
    pub currency: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default)]
    pub skip_rows: usize,
    pub date_format: String,
    /// Try the common-format fallback list when the declared date format
    /// fails. Set on the generic fallback descriptor only.
    #[serde(default)]
    pub date_fallbacks: bool,
    /// Continental number formatting: `1.234,56`.
    #[serde(default)]
    pub decimal_comma: bool,
    /// Source reports outflows as positive (card exports commonly do).
    #[serde(default)]
    pub invert_sign: bool,
    pub convention: AmountConvention,
    #[serde(default)]
    pub outflow_markers: Vec<String>,
    #[serde(default)]
    pub inflow_markers: Vec<String>,
    /// Substrings expected in file content or filename.
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Verbatim header line as this institution exports it.
    #[serde(default)]
    pub sample_header: Option<String>,
    pub fields: FieldMap,
    #[serde(default)]
    pub merchant_patterns: Vec<MerchantPattern>,
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub regex: regex::Regex,
    pub subtype: String,
}

/// A descriptor paired with its precompiled merchant patterns.
#[derive(Debug, Clone)]
pub struct FormatEntry {
    pub descriptor: BankFormatDescriptor,
    pub patterns: Vec<CompiledPattern>,
}

impl FormatEntry {
    /// Apply the merchant patterns to a raw description. The first matching
    /// rule supplies the subtype and the extracted merchant substring (the
    /// first capture group when present, the whole match otherwise). With no
    /// match the raw description stands, untagged.
    pub fn clean_merchant(&self, description: &str) -> (String, Option<String>) {
        for p in &self.patterns {
            if let Some(caps) = p.regex.captures(description) {
                let text = caps
                    .get(1)
                    .map_or_else(|| caps.get(0).map_or(description, |m| m.as_str()), |m| m.as_str());
                return (text.trim().to_string(), Some(p.subtype.clone()));
            }
        }
        (description.trim().to_string(), None)
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to parse catalog TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Duplicate format key: {0}")]
    DuplicateKey(String),
    #[error("Invalid merchant pattern '{pattern}' in format {key}: {source}")]
    BadPattern {
        key: String,
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Deserialize)]
struct CatalogFile {
    format: Vec<BankFormatDescriptor>,
}

/// Immutable ordered registry of bank format descriptors. Declaration order
/// is significant: the detector breaks score ties in favour of the
/// first-registered format.
pub struct FormatCatalog {
    entries: Vec<FormatEntry>,
}

impl FormatCatalog {
    pub fn from_toml(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(text)?;
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(file.format.len());
        for descriptor in file.format {
            if !seen.insert(descriptor.key.clone()) {
                return Err(CatalogError::DuplicateKey(descriptor.key));
            }
            let patterns = compile_patterns(&descriptor)?;
            entries.push(FormatEntry {
                descriptor,
                patterns,
            });
        }
        Ok(FormatCatalog { entries })
    }

    /// The catalog shipped with the crate.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml(include_str!("formats.toml"))
    }

    pub fn entries(&self) -> &[FormatEntry] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&FormatEntry> {
        self.entries.iter().find(|e| e.descriptor.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn compile_patterns(
    descriptor: &BankFormatDescriptor,
) -> Result<Vec<CompiledPattern>, CatalogError> {
    descriptor
        .merchant_patterns
        .iter()
        .map(|p| {
            regex::Regex::new(&p.pattern)
                .map(|regex| CompiledPattern {
                    regex,
                    subtype: p.subtype.clone(),
                })
                .map_err(|source| CatalogError::BadPattern {
                    key: descriptor.key.clone(),
                    pattern: p.pattern.clone(),
                    source,
                })
        })
        .collect()
}
