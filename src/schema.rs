//! Schema description returned by the validation service and its accessors.
//!
//! Every accessor fails with [`SchemaError::MissingColumn`] when asked about a
//! column the schema does not describe. That is a data-contract violation
//! between findings, schema and dataset, not something a user can fix.

use crate::dataset::Dataset;
use crate::error::SchemaError;
use crate::report::Finding;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[serde(alias = "string")]
    Text,
    Number,
    Date,
    Time,
    Email,
    Url,
    Phone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissibleValue {
    pub value: String,
    pub label: String,
}

/// Descriptor of a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissible_values: Option<Vec<PermissibleValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// What a column accepts as input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "labels", rename_all = "camelCase")]
pub enum PermissibleValues {
    FreeText,
    Terms(Vec<String>),
}

/// Column descriptors plus the display order of columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub column_description: HashMap<String, ColumnDescriptor>,
    #[serde(default)]
    pub column_order: Vec<String>,
}

impl SchemaDescriptor {
    pub fn column(&self, column: &str) -> Result<&ColumnDescriptor, SchemaError> {
        self.column_description
            .get(column)
            .ok_or_else(|| SchemaError::MissingColumn(column.to_string()))
    }

    pub fn column_order(&self) -> &[String] {
        &self.column_order
    }

    pub fn label(&self, column: &str) -> Result<&str, SchemaError> {
        Ok(&self.column(column)?.label)
    }

    pub fn value_type(&self, column: &str) -> Result<ValueType, SchemaError> {
        Ok(self.column(column)?.value_type)
    }

    pub fn required(&self, column: &str) -> Result<bool, SchemaError> {
        Ok(self.column(column)?.required)
    }

    pub fn description(&self, column: &str) -> Result<&str, SchemaError> {
        Ok(&self.column(column)?.description)
    }

    pub fn example(&self, column: &str) -> Result<Option<&str>, SchemaError> {
        Ok(self.column(column)?.example.as_deref())
    }

    /// An empty example counts as no example.
    pub fn has_example(&self, column: &str) -> Result<bool, SchemaError> {
        Ok(self.example(column)?.is_some_and(|e| !e.is_empty()))
    }

    /// Display labels of the permissible values, in schema order.
    pub fn permissible_values(&self, column: &str) -> Result<PermissibleValues, SchemaError> {
        let values = match &self.column(column)?.permissible_values {
            Some(values) if !values.is_empty() => {
                PermissibleValues::Terms(values.iter().map(|v| v.label.clone()).collect())
            }
            _ => PermissibleValues::FreeText,
        };
        Ok(values)
    }

    pub fn pattern(&self, column: &str) -> Result<Option<&str>, SchemaError> {
        Ok(self
            .column(column)?
            .regex
            .as_deref()
            .filter(|p| !p.is_empty()))
    }

    /// Check that every column referenced by the dataset or the findings is described.
    pub fn ensure_covers(&self, dataset: &Dataset, findings: &[Finding]) -> Result<(), SchemaError> {
        for column in dataset.columns() {
            self.column(&column)?;
        }
        for finding in findings {
            self.column(&finding.column)?;
        }
        Ok(())
    }

    /// Column order with `column` moved to the front, as the repair table shows it.
    pub fn order_with_first(&self, column: &str) -> Vec<String> {
        let mut order = Vec::with_capacity(self.column_order.len());
        order.push(column.to_string());
        order.extend(self.column_order.iter().filter(|c| *c != column).cloned());
        order
    }
}
