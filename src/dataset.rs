//! Tabular data model shared by every stage of a repair session.
//!
//! A dataset is an ordered list of records. Each record carries the row number
//! assigned when the file was loaded; that number is the address used by the
//! patch overlay and lives beside the cell values, never inside them, so it can
//! never leak into an exported file.

use regex::Regex;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::OnceLock;

/// Keys that may carry the row index in row objects exchanged with the validation service.
pub const ROW_NUMBER_FIELDS: [&str; 2] = ["rowNumber", "_row"];

/// A single scalar cell value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn integer(value: i64) -> Self {
        Self::Number(value.into())
    }

    /// Non-finite floats have no JSON representation and become `Null`.
    pub fn float(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(Self::Number)
            .unwrap_or(Self::Null)
    }

    /// True for `Null` and for text that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Text used when grouping findings by value. Mirrors string interpolation,
    /// so `5` and `"5"` land in the same group.
    pub fn key_text(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            other => other.to_string(),
        }
    }

    /// Type a raw delimited-text field: booleans, then numbers, then text.
    pub fn infer(raw: &str) -> Self {
        match raw {
            "true" | "TRUE" => return Self::Bool(true),
            "false" | "FALSE" => return Self::Bool(false),
            _ => {}
        }
        if float_pattern().is_match(raw) {
            let trimmed = raw.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Self::integer(i);
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                if f.is_finite() {
                    return Self::float(f);
                }
            }
        }
        Self::Text(raw.to_string())
    }
}

fn float_pattern() -> &'static Regex {
    static FLOAT: OnceLock<Regex> = OnceLock::new();
    FLOAT.get_or_init(|| {
        Regex::new(r"(?i)^\s*-?(\d*\.?\d+|\d+\.?\d*)(e[-+]?\d+)?\s*$").expect("float pattern compiles")
    })
}

/// Rendering used for delimited output and text filters. `Null` renders empty.
impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::integer(value)
    }
}

/// One row of the dataset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub row_number: usize,
    pub values: BTreeMap<String, CellValue>,
}

impl Record {
    pub fn new(row_number: usize, values: BTreeMap<String, CellValue>) -> Self {
        Self { row_number, values }
    }

    /// Placeholder for a row that no longer exists.
    pub fn empty(row_number: usize) -> Self {
        Self {
            row_number,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 1))?;
        map.serialize_entry(ROW_NUMBER_FIELDS[0], &self.row_number)?;
        for (column, value) in &self.values {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Ordered collection of records with O(1) lookup by row number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    rows: Vec<Record>,
    positions: HashMap<usize, usize>,
}

impl Dataset {
    pub fn new(rows: Vec<Record>) -> Self {
        let positions = rows
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.row_number, pos))
            .collect();
        Self { rows, positions }
    }

    /// Build a dataset from bare value maps, numbering rows by position.
    pub fn from_values(rows: Vec<BTreeMap<String, CellValue>>) -> Self {
        Self::new(
            rows.into_iter()
                .enumerate()
                .map(|(pos, values)| Record::new(pos, values))
                .collect(),
        )
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn record(&self, row: usize) -> Option<&Record> {
        self.positions.get(&row).map(|&pos| &self.rows[pos])
    }

    /// Original value at `(row, column)`, if the row exists and carries the column.
    pub fn value(&self, row: usize, column: &str) -> Option<&CellValue> {
        self.record(row).and_then(|r| r.get(column))
    }

    #[cfg(test)]
    pub fn row_numbers(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.row_number).collect()
    }

    /// Union of the columns carried by any record, sorted.
    pub fn columns(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .flat_map(|r| r.values.keys().cloned())
            .collect()
    }

    /// Row objects as sent to the validation service (no row number key).
    pub fn to_json_rows(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|r| serde_json::to_value(&r.values).unwrap_or(serde_json::Value::Null))
            .collect()
    }
}

impl Serialize for Dataset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.rows.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Dataset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<BTreeMap<String, serde_json::Value>> = Vec::deserialize(deserializer)?;
        let mut rows = Vec::with_capacity(raw.len());
        for (position, mut object) in raw.into_iter().enumerate() {
            let mut row_number = position;
            for key in ROW_NUMBER_FIELDS {
                if let Some(n) = object.remove(key).and_then(|v| v.as_u64()) {
                    row_number = n as usize;
                }
            }
            let mut values = BTreeMap::new();
            for (column, value) in object {
                let cell = CellValue::deserialize(value).map_err(de::Error::custom)?;
                values.insert(column, cell);
            }
            rows.push(Record::new(row_number, values));
        }
        Ok(Self::new(rows))
    }
}

/// A workbook sheet carried through a session unchanged (e.g. `.metadata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}
