//! Sparse overlay of user corrections on top of the original dataset.
//!
//! Patches are addressed by row number, then column name. The original
//! dataset is never mutated; every displayed or exported value goes through
//! [`PatchOverlay::effective_value`].

use crate::dataset::{CellValue, Dataset, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
}

/// A single correction. `value: Null` is a deliberate clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    pub value: CellValue,
}

impl Patch {
    pub fn new(op: PatchOp, row: usize, column: &str, value: CellValue) -> Self {
        Self {
            op,
            path: format!("/{}/{}", row, column),
            value,
        }
    }
}

/// Row-then-column keyed patch map. A row without patches has no entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatchOverlay {
    rows: BTreeMap<usize, BTreeMap<String, Patch>>,
}

impl PatchOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Patch> {
        self.rows.get(&row).and_then(|group| group.get(column))
    }

    /// True when a patch exists for the cell, including one that clears it.
    pub fn has(&self, row: usize, column: &str) -> bool {
        self.get(row, column).is_some()
    }

    /// Record a correction. The op is `replace` when the cell held a value at
    /// load time and `add` otherwise; it does not change how the patch applies.
    pub fn set(&mut self, dataset: &Dataset, row: usize, column: &str, value: CellValue) -> &Patch {
        let op = match dataset.value(row, column) {
            Some(original) if !original.is_blank() => PatchOp::Replace,
            _ => PatchOp::Add,
        };
        let group = self.rows.entry(row).or_default();
        group.insert(column.to_string(), Patch::new(op, row, column, value));
        &group[column]
    }

    /// Drop the patch for a cell. Returns the removed patch, if any.
    pub fn remove(&mut self, row: usize, column: &str) -> Option<Patch> {
        let group = self.rows.get_mut(&row)?;
        let removed = group.remove(column);
        if group.is_empty() {
            self.rows.remove(&row);
        }
        removed
    }

    /// Set the same value for many rows under one column.
    pub fn set_many<I>(&mut self, dataset: &Dataset, rows: I, column: &str, value: &CellValue) -> usize
    where
        I: IntoIterator<Item = usize>,
    {
        let mut count = 0;
        for row in rows {
            self.set(dataset, row, column, value.clone());
            count += 1;
        }
        count
    }

    /// Apply per-row edits under one column: `Some` sets, `None` removes.
    pub fn apply_edits<I>(&mut self, dataset: &Dataset, column: &str, edits: I)
    where
        I: IntoIterator<Item = (usize, Option<CellValue>)>,
    {
        for (row, edit) in edits {
            match edit {
                Some(value) => {
                    self.set(dataset, row, column, value);
                }
                None => {
                    self.remove(row, column);
                }
            }
        }
    }

    /// Patched value when the cell is patched, otherwise the original value.
    /// Cells absent from both resolve to `Null`.
    pub fn effective_value(&self, dataset: &Dataset, row: usize, column: &str) -> CellValue {
        match self.get(row, column) {
            Some(patch) => patch.value.clone(),
            None => dataset.value(row, column).cloned().unwrap_or_default(),
        }
    }

    /// The record at `row` with every cell resolved through the overlay.
    /// Rows missing from the dataset resolve to an empty record.
    pub fn effective_record(&self, dataset: &Dataset, row: usize) -> Record {
        let Some(original) = dataset.record(row) else {
            return Record::empty(row);
        };
        let mut values = original.values.clone();
        if let Some(group) = self.rows.get(&row) {
            for (column, patch) in group {
                values.insert(column.clone(), patch.value.clone());
            }
        }
        Record::new(row, values)
    }

    /// Patched columns of a row, in column order.
    pub fn row_patches(&self, row: usize) -> impl Iterator<Item = (&String, &Patch)> {
        self.rows.get(&row).into_iter().flat_map(|group| group.iter())
    }

    /// All patches flattened in row, then column order.
    pub fn to_patch_array(&self) -> Vec<Patch> {
        self.rows
            .values()
            .flat_map(|group| group.values().cloned())
            .collect()
    }

    pub fn patch_count(&self) -> usize {
        self.rows.values().map(|g| g.len()).sum()
    }

    pub fn patched_row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_values(vec![
            BTreeMap::from([
                ("name".to_string(), CellValue::text("")),
                ("tissue".to_string(), CellValue::text("Cardiac")),
            ]),
            BTreeMap::from([
                ("name".to_string(), CellValue::text("Bob")),
                ("tissue".to_string(), CellValue::text("Liver")),
            ]),
        ])
    }

    #[test]
    fn test_get_untouched_row_is_absent() {
        let overlay = PatchOverlay::new();
        assert!(overlay.get(42, "name").is_none());
        assert!(!overlay.has(42, "name"));
    }

    #[test]
    fn test_set_chooses_op_from_original_value() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        assert_eq!(overlay.set(&data, 0, "name", "Alice".into()).op, PatchOp::Add);
        assert_eq!(overlay.set(&data, 0, "tissue", "Heart".into()).op, PatchOp::Replace);
        assert_eq!(overlay.set(&data, 0, "extra", "x".into()).op, PatchOp::Add);
        assert_eq!(overlay.get(0, "tissue").unwrap().path, "/0/tissue");
    }

    #[test]
    fn test_remove_prunes_empty_rows() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        overlay.set(&data, 1, "name", "Robert".into());
        assert_eq!(overlay.patched_row_count(), 1);
        assert!(overlay.remove(1, "name").is_some());
        assert_eq!(overlay.patched_row_count(), 0);
        assert!(overlay.is_empty());
        assert!(overlay.to_patch_array().is_empty());
        assert!(overlay.remove(1, "name").is_none());
    }

    #[test]
    fn test_effective_value_precedence() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        overlay.set(&data, 1, "tissue", "Heart".into());
        for row in data.row_numbers() {
            for column in ["name", "tissue"] {
                let expected = match overlay.get(row, column) {
                    Some(p) => p.value.clone(),
                    None => data.value(row, column).cloned().unwrap(),
                };
                assert_eq!(overlay.effective_value(&data, row, column), expected);
            }
        }
        assert_eq!(overlay.effective_value(&data, 1, "tissue"), CellValue::text("Heart"));
        assert_eq!(overlay.effective_value(&data, 0, "tissue"), CellValue::text("Cardiac"));
        assert_eq!(overlay.effective_value(&data, 9, "tissue"), CellValue::Null);
    }

    #[test]
    fn test_null_clear_is_distinct_from_unedited() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        overlay.set(&data, 1, "name", CellValue::Null);
        assert!(overlay.has(1, "name"));
        assert_eq!(overlay.effective_value(&data, 1, "name"), CellValue::Null);
        assert!(!overlay.has(0, "name"));
        assert_eq!(overlay.effective_value(&data, 0, "name"), CellValue::text(""));
    }

    #[test]
    fn test_set_many_covers_every_row() {
        let rows: Vec<BTreeMap<String, CellValue>> = (0..150)
            .map(|_| BTreeMap::from([("donor_age".to_string(), CellValue::text(""))]))
            .collect();
        let data = Dataset::from_values(rows);
        let mut overlay = PatchOverlay::new();
        let count = overlay.set_many(&data, 0..100, "donor_age", &CellValue::text("N/A"));
        assert_eq!(count, 100);
        assert_eq!(overlay.patch_count(), 100);
        assert!((0..100).all(|r| overlay.has(r, "donor_age")));
        assert!(!overlay.has(100, "donor_age"));
    }

    #[test]
    fn test_apply_edits_sets_and_removes() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        overlay.set(&data, 1, "name", "Robert".into());
        overlay.apply_edits(&data, "name", vec![(0, Some("Alice".into())), (1, None)]);
        assert_eq!(overlay.get(0, "name").unwrap().value, CellValue::text("Alice"));
        assert!(!overlay.has(1, "name"));
        assert_eq!(overlay.patched_row_count(), 1);
    }

    #[test]
    fn test_effective_record_and_missing_row() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        overlay.set(&data, 0, "name", "Alice".into());
        let record = overlay.effective_record(&data, 0);
        assert_eq!(record.get("name"), Some(&CellValue::text("Alice")));
        assert_eq!(record.get("tissue"), Some(&CellValue::text("Cardiac")));
        assert!(overlay.effective_record(&data, 99).values.is_empty());
    }

    #[test]
    fn test_patch_array_order() {
        let data = dataset();
        let mut overlay = PatchOverlay::new();
        overlay.set(&data, 1, "tissue", "Heart".into());
        overlay.set(&data, 0, "tissue", "Heart".into());
        overlay.set(&data, 0, "name", "Alice".into());
        let paths: Vec<String> = overlay.to_patch_array().into_iter().map(|p| p.path).collect();
        assert_eq!(paths, vec!["/0/name", "/0/tissue", "/1/tissue"]);
    }
}
