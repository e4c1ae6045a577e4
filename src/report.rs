//! Validation findings and the views derived from them.
//!
//! Findings come from the validation service and never change during a
//! session. Everything here is recomputed from the findings and the current
//! patch overlay on demand; nothing is cached across overlay mutations.

use crate::dataset::{CellValue, Dataset, Record};
use crate::patch::PatchOverlay;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    MissingRequired,
    NotStandardTerm,
    NotNumberType,
    NotStringType,
    InvalidUrl,
    InvalidValueFormat,
    InvalidSchemaId,
}

impl ErrorType {
    /// Adherence kinds in the order they are summarized.
    pub const ADHERENCE: [ErrorType; 6] = [
        ErrorType::NotStandardTerm,
        ErrorType::NotNumberType,
        ErrorType::NotStringType,
        ErrorType::InvalidUrl,
        ErrorType::InvalidValueFormat,
        ErrorType::InvalidSchemaId,
    ];

    pub fn is_completeness(self) -> bool {
        self == ErrorType::MissingRequired
    }

    pub fn is_adherence(self) -> bool {
        !self.is_completeness()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingRequired => "missingRequired",
            Self::NotStandardTerm => "notStandardTerm",
            Self::NotNumberType => "notNumberType",
            Self::NotStringType => "notStringType",
            Self::InvalidUrl => "invalidUrl",
            Self::InvalidValueFormat => "invalidValueFormat",
            Self::InvalidSchemaId => "invalidSchemaId",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        std::iter::once(Self::MissingRequired)
            .chain(Self::ADHERENCE)
            .find(|t| t.as_str() == s)
    }

    /// Identifier used by navigation entries for adherence kinds.
    pub fn error_id(self) -> &'static str {
        match self {
            Self::MissingRequired => "missing-required",
            Self::NotStandardTerm => "not-standard-term-error",
            Self::NotNumberType => "not-number-type-error",
            Self::NotStringType => "not-string-type-error",
            Self::InvalidUrl => "invalid-url-error",
            Self::InvalidValueFormat => "invalid-value-format-error",
            Self::InvalidSchemaId => "invalid-schema-id-error",
        }
    }

    /// Short flag shown beside an offending value.
    pub fn flag_title(self, column: &str) -> String {
        match self {
            Self::MissingRequired => format!("Missing \"{}\" value", column),
            Self::NotStandardTerm => "Value is not a standard term".to_string(),
            Self::NotNumberType => "Value is not number".to_string(),
            Self::NotStringType => "Value is not string".to_string(),
            Self::InvalidUrl => "Value is not a valid URL".to_string(),
            Self::InvalidValueFormat => "Value does not match the required format".to_string(),
            Self::InvalidSchemaId => "Value is not a valid schema identifier".to_string(),
        }
    }

    pub fn total_count_title(self, count: usize, column: &str) -> String {
        let (one, many) = ("value that is", "values that are");
        let noun = if count == 1 { one } else { many };
        match self {
            Self::MissingRequired => format!(
                "Found {} {} a missing \"{}\" value",
                count,
                if count == 1 { "metadata record that has" } else { "metadata records that have" },
                column
            ),
            Self::NotStandardTerm => format!("Found {} {} not using the standard term", count, noun),
            Self::NotNumberType => format!("Found {} {} not a number", count, noun),
            Self::NotStringType => format!("Found {} {} not a string", count, noun),
            Self::InvalidUrl => format!("Found {} {} not a valid URL string", count, noun),
            Self::InvalidValueFormat => format!("Found {} {} not in the required format", count, noun),
            Self::InvalidSchemaId => format!("Found {} {} not a valid schema identifier", count, noun),
        }
    }

    pub fn action_title(self, column: &str) -> String {
        match self {
            Self::MissingRequired => format!("Fill out missing \"{}\" value", column),
            Self::NotStandardTerm => "Replace value with the standard term".to_string(),
            Self::NotNumberType => "Replace value with a number".to_string(),
            Self::NotStringType => "Replace value with a string".to_string(),
            Self::InvalidUrl => "Replace value with a valid URL".to_string(),
            Self::InvalidValueFormat => "Replace value with a correctly formatted one".to_string(),
            Self::InvalidSchemaId => "Replace value with a valid schema identifier".to_string(),
        }
    }
}

/// One per-cell finding from the validation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub row: usize,
    pub column: String,
    #[serde(default)]
    pub value: CellValue,
    #[serde(default)]
    pub repair_suggestion: CellValue,
    pub error_type: ErrorType,
}

impl Finding {
    pub fn new(row: usize, column: &str, value: CellValue, error_type: ErrorType) -> Self {
        Self {
            row,
            column: column.to_string(),
            value,
            repair_suggestion: CellValue::Null,
            error_type,
        }
    }

    pub fn with_suggestion(mut self, suggestion: CellValue) -> Self {
        self.repair_suggestion = suggestion;
        self
    }
}

fn remaining(rows: &[usize], column: &str, overlay: &PatchOverlay) -> usize {
    rows.iter().filter(|&&row| !overlay.has(row, column)).count()
}

/// Findings grouped by `(column, errorType)`, both classes, in order of appearance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryGroup {
    pub column: String,
    pub error_type: ErrorType,
    pub rows: Vec<usize>,
}

pub fn error_summary(findings: &[Finding]) -> Vec<SummaryGroup> {
    let mut groups: Vec<SummaryGroup> = Vec::new();
    let mut index: HashMap<(&str, ErrorType), usize> = HashMap::new();
    for finding in findings {
        let key = (finding.column.as_str(), finding.error_type);
        let pos = *index.entry(key).or_insert_with(|| {
            groups.push(SummaryGroup {
                column: finding.column.clone(),
                error_type: finding.error_type,
                rows: Vec::new(),
            });
            groups.len() - 1
        });
        groups[pos].rows.push(finding.row);
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessGroup {
    pub error_id: String,
    pub column: String,
    pub rows: Vec<usize>,
    pub remaining_count: usize,
}

/// Missing-required findings per column, in order of first appearance.
pub fn group_completeness_by_column(findings: &[Finding], overlay: &PatchOverlay) -> Vec<CompletenessGroup> {
    error_summary(findings)
        .into_iter()
        .filter(|g| g.error_type.is_completeness())
        .map(|g| CompletenessGroup {
            error_id: format!("missing-required-{}", g.column),
            remaining_count: remaining(&g.rows, &g.column, overlay),
            column: g.column,
            rows: g.rows,
        })
        .collect()
}

/// Identical bad values under one column and error kind, repaired as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdherenceGroup {
    pub id: String,
    pub column: String,
    pub value: CellValue,
    pub repair_suggestion: CellValue,
    pub error_type: ErrorType,
    pub rows: Vec<usize>,
    pub records: Vec<Record>,
}

impl AdherenceGroup {
    pub fn remaining_count(&self, overlay: &PatchOverlay) -> usize {
        remaining(&self.rows, &self.column, overlay)
    }

    /// Value to pre-fill the repair input with: the existing patch of the
    /// first row, else the service's suggestion.
    pub fn proposed_value(&self, overlay: &PatchOverlay) -> CellValue {
        self.rows
            .first()
            .and_then(|&row| overlay.get(row, &self.column))
            .map(|p| p.value.clone())
            .unwrap_or_else(|| self.repair_suggestion.clone())
    }

    /// Whether the group was already accepted, judged by its first row.
    pub fn approved(&self, overlay: &PatchOverlay) -> bool {
        self.rows
            .first()
            .is_some_and(|&row| overlay.has(row, &self.column))
    }
}

/// Adherence findings grouped literally by `(column, value, errorType)`.
/// Records are resolved through the overlay; rows missing from the dataset
/// resolve to empty records.
pub fn group_adherence_by_type_and_value(
    findings: &[Finding],
    dataset: &Dataset,
    overlay: &PatchOverlay,
) -> Vec<AdherenceGroup> {
    let mut groups: Vec<AdherenceGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for finding in findings.iter().filter(|f| f.error_type.is_adherence()) {
        let key = format!(
            "{}-{}-{}",
            finding.column,
            finding.value.key_text(),
            finding.error_type.as_str()
        );
        let pos = match index.get(&key) {
            Some(&pos) => pos,
            None => {
                groups.push(AdherenceGroup {
                    id: key.clone(),
                    column: finding.column.clone(),
                    value: finding.value.clone(),
                    repair_suggestion: finding.repair_suggestion.clone(),
                    error_type: finding.error_type,
                    rows: Vec::new(),
                    records: Vec::new(),
                });
                index.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[pos].rows.push(finding.row);
        groups[pos].records.push(overlay.effective_record(dataset, finding.row));
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorKindSummary {
    pub error_id: String,
    pub error_kind: ErrorType,
    pub remaining_count: usize,
}

/// Remaining counts for each adherence kind that has findings, in fixed order.
pub fn summary_by_error_kind(findings: &[Finding], overlay: &PatchOverlay) -> Vec<ErrorKindSummary> {
    let summary = error_summary(findings);
    ErrorType::ADHERENCE
        .iter()
        .filter_map(|&kind| {
            let groups: Vec<&SummaryGroup> = summary.iter().filter(|g| g.error_type == kind).collect();
            if groups.is_empty() {
                return None;
            }
            let remaining_count = groups
                .iter()
                .map(|g| remaining(&g.rows, &g.column, overlay))
                .sum();
            Some(ErrorKindSummary {
                error_id: kind.error_id().to_string(),
                error_kind: kind,
                remaining_count,
            })
        })
        .collect()
}

/// Headline numbers for the overview page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSummary {
    pub record_count: usize,
    pub invalid_record_count: usize,
    pub valid_record_count: usize,
    pub has_completeness_errors: bool,
    pub has_adherence_errors: bool,
}

pub fn evaluation_summary(dataset: &Dataset, findings: &[Finding]) -> EvaluationSummary {
    let invalid: HashSet<usize> = findings.iter().map(|f| f.row).collect();
    EvaluationSummary {
        record_count: dataset.len(),
        invalid_record_count: invalid.len(),
        valid_record_count: dataset.len().saturating_sub(invalid.len()),
        has_completeness_errors: findings.iter().any(|f| f.error_type.is_completeness()),
        has_adherence_errors: findings.iter().any(|f| f.error_type.is_adherence()),
    }
}

/// One bar of the per-column error charts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRow {
    pub column: String,
    pub error_type: ErrorType,
    pub error_flag: String,
    pub invalid: usize,
    pub valid: usize,
}

/// Chart rows for one error class, most affected column first.
pub fn chart_rows(dataset: &Dataset, findings: &[Finding], completeness: bool) -> Vec<ChartRow> {
    let mut rows: Vec<ChartRow> = error_summary(findings)
        .into_iter()
        .filter(|g| g.error_type.is_completeness() == completeness)
        .map(|g| ChartRow {
            error_flag: g.error_type.flag_title(&g.column),
            invalid: g.rows.len(),
            valid: dataset.len().saturating_sub(g.rows.len()),
            column: g.column,
            error_type: g.error_type,
        })
        .collect();
    // Stable sort keeps appearance order among equal counts.
    rows.sort_by(|a, b| b.invalid.cmp(&a.invalid));
    rows
}

/// Repair targets in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationPaths {
    pub completeness_error_locations: Vec<String>,
    pub adherence_error_types: Vec<ErrorType>,
}

impl NavigationPaths {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut paths = Self::default();
        for finding in findings {
            if finding.error_type.is_completeness() {
                if !paths.completeness_error_locations.contains(&finding.column) {
                    paths.completeness_error_locations.push(finding.column.clone());
                }
            } else if !paths.adherence_error_types.contains(&finding.error_type) {
                paths.adherence_error_types.push(finding.error_type);
            }
        }
        paths
    }

    /// Column to repair after `current`, wrapping around.
    pub fn next_column(&self, current: &str) -> Option<&str> {
        next_cyclic(&self.completeness_error_locations, |c| c == current).map(String::as_str)
    }

    pub fn next_error_type(&self, current: ErrorType) -> Option<ErrorType> {
        next_cyclic(&self.adherence_error_types, |t| *t == current).copied()
    }
}

fn next_cyclic<T>(items: &[T], is_current: impl Fn(&T) -> bool) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let next = match items.iter().position(is_current) {
        Some(i) if i + 1 < items.len() => i + 1,
        _ => 0,
    };
    items.get(next)
}

/// Case-insensitive substring filter on one column's effective value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub value: String,
}

impl ColumnFilter {
    pub fn matches(&self, record: &Record) -> bool {
        let needle = self.value.to_lowercase();
        record
            .get(&self.column)
            .map(|v| v.to_string().to_lowercase().contains(&needle))
            .unwrap_or(needle.is_empty())
    }
}

/// Records matching every filter, order preserved.
pub fn filter_records<'a>(records: &'a [Record], filters: &[ColumnFilter]) -> Vec<&'a Record> {
    records
        .iter()
        .filter(|r| filters.iter().all(|f| f.matches(r)))
        .collect()
}

/// Slice one page. A zero page size returns everything.
pub fn page<T>(items: &[T], page: usize, rows_per_page: usize) -> &[T] {
    if rows_per_page == 0 {
        return items;
    }
    let start = page.saturating_mul(rows_per_page).min(items.len());
    let end = start.saturating_add(rows_per_page).min(items.len());
    &items[start..end]
}

/// Effective records for the rows of one completeness column, in finding order.
pub fn completeness_table(
    findings: &[Finding],
    column: &str,
    dataset: &Dataset,
    overlay: &PatchOverlay,
) -> Vec<Record> {
    findings
        .iter()
        .filter(|f| f.error_type.is_completeness() && f.column == column)
        .map(|f| overlay.effective_record(dataset, f.row))
        .collect()
}
