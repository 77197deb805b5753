use bankfeed_core::{CanonicalTransaction, Money};
use chrono::NaiveDate;
use thiserror::Error;

use crate::catalog::{AmountConvention, ColumnRef, FormatEntry};
use crate::parse::RawRow;

/// Per-row mapping failure. Collected into the import summary, never thrown
/// across stage boundaries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unparsable date '{0}'")]
    BadDate(String),
    #[error("unparsable amount '{0}'")]
    BadAmount(String),
    #[error("missing {0} column")]
    MissingColumn(&'static str),
    #[error("both debit and credit populated")]
    BothDebitAndCredit,
    #[error("neither debit nor credit populated")]
    NeitherDebitNorCredit,
    #[error("unrecognized type flag '{0}'")]
    UnknownTypeFlag(String),
}

const FALLBACK_DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%m-%d-%Y",
    "%d-%m-%Y",
];

/// Maps raw rows onto the canonical schema for one resolved format. Column
/// name refs are resolved against the header once, up front.
pub struct FieldMapper<'a> {
    entry: &'a FormatEntry,
    date: Option<usize>,
    description: Option<usize>,
    amount: Option<usize>,
    debit: Option<usize>,
    credit: Option<usize>,
    type_flag: Option<usize>,
}

impl<'a> FieldMapper<'a> {
    pub fn new(entry: &'a FormatEntry, header: Option<&[String]>) -> Self {
        let resolve = |r: &Option<ColumnRef>| r.as_ref().and_then(|r| r.resolve(header));
        let fields = &entry.descriptor.fields;
        FieldMapper {
            entry,
            date: resolve(&fields.date),
            description: resolve(&fields.description),
            amount: resolve(&fields.amount),
            debit: resolve(&fields.debit),
            credit: resolve(&fields.credit),
            type_flag: resolve(&fields.type_flag),
        }
    }

    /// Produce one canonical transaction or a validation error, never both.
    /// Pure; all side bookkeeping belongs to the pipeline.
    pub fn map_row(&self, row: &RawRow) -> Result<CanonicalTransaction, ValidationError> {
        let d = &self.entry.descriptor;

        let date_cell = self
            .cell(row, self.date)
            .ok_or(ValidationError::MissingColumn("date"))?;
        let date = self.parse_date(date_cell)?;

        let amount = self.resolve_amount(row)?;

        let raw_description = self.cell(row, self.description).unwrap_or("").trim().to_string();
        let (merchant, subtype) = self.entry.clean_merchant(&raw_description);

        Ok(CanonicalTransaction {
            date,
            amount,
            currency: d.currency.clone(),
            raw_description,
            merchant,
            source_format: d.key.clone(),
            source_line: row.line,
            subtype,
        })
    }

    fn cell<'r>(&self, row: &'r RawRow, idx: Option<usize>) -> Option<&'r str> {
        idx.and_then(|i| row.cells.get(i)).map(String::as_str)
    }

    fn parse_date(&self, cell: &str) -> Result<NaiveDate, ValidationError> {
        let cell = cell.trim();
        if let Ok(date) = NaiveDate::parse_from_str(cell, &self.entry.descriptor.date_format) {
            return Ok(date);
        }
        if self.entry.descriptor.date_fallbacks {
            for fmt in FALLBACK_DATE_FORMATS {
                if let Ok(date) = NaiveDate::parse_from_str(cell, fmt) {
                    return Ok(date);
                }
            }
        }
        Err(ValidationError::BadDate(cell.to_string()))
    }

    /// Resolve the signed amount in minor units under the descriptor's sign
    /// convention. Canonical sign: negative = outflow, positive = inflow.
    fn resolve_amount(&self, row: &RawRow) -> Result<Money, ValidationError> {
        let d = &self.entry.descriptor;
        match d.convention {
            AmountConvention::SingleSigned => {
                let cell = self
                    .cell(row, self.amount)
                    .ok_or(ValidationError::MissingColumn("amount"))?;
                let amount = parse_money(cell, d.decimal_comma)?;
                Ok(if d.invert_sign { -amount } else { amount })
            }
            AmountConvention::UnsignedWithTypeFlag => {
                let cell = self
                    .cell(row, self.amount)
                    .ok_or(ValidationError::MissingColumn("amount"))?;
                let magnitude = parse_money(cell, d.decimal_comma)?.abs();
                let flag = self
                    .cell(row, self.type_flag)
                    .ok_or(ValidationError::MissingColumn("type flag"))?
                    .trim();
                if matches_marker(&d.outflow_markers, flag) {
                    Ok(-magnitude)
                } else if d.inflow_markers.is_empty() || matches_marker(&d.inflow_markers, flag) {
                    Ok(magnitude)
                } else {
                    Err(ValidationError::UnknownTypeFlag(flag.to_string()))
                }
            }
            AmountConvention::SeparateDebitCredit => {
                if self.debit.is_none() {
                    return Err(ValidationError::MissingColumn("debit"));
                }
                if self.credit.is_none() {
                    return Err(ValidationError::MissingColumn("credit"));
                }
                let debit = self.cell(row, self.debit).unwrap_or("").trim();
                let credit = self.cell(row, self.credit).unwrap_or("").trim();
                match (debit.is_empty(), credit.is_empty()) {
                    (false, false) => Err(ValidationError::BothDebitAndCredit),
                    (true, true) => Err(ValidationError::NeitherDebitNorCredit),
                    (false, true) => Ok(-parse_money(debit, d.decimal_comma)?.abs()),
                    (true, false) => Ok(parse_money(credit, d.decimal_comma)?.abs()),
                }
            }
        }
    }
}

fn parse_money(cell: &str, decimal_comma: bool) -> Result<Money, ValidationError> {
    Money::parse(cell, decimal_comma).map_err(|_| ValidationError::BadAmount(cell.trim().to_string()))
}

fn matches_marker(markers: &[String], flag: &str) -> bool {
    markers.iter().any(|m| m.eq_ignore_ascii_case(flag))
}
