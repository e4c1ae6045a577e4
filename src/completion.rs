//! Whether every reported error has been answered by a patch.

use crate::patch::PatchOverlay;
use crate::report::Finding;
use std::collections::HashSet;

/// Distinct `(row, column)` cells named by the findings.
fn reported_cells(findings: &[Finding]) -> HashSet<(usize, &str)> {
    findings.iter().map(|f| (f.row, f.column.as_str())).collect()
}

/// True iff each reported cell has a patch. Zero findings is complete.
pub fn is_complete(findings: &[Finding], overlay: &PatchOverlay) -> bool {
    findings.iter().all(|f| overlay.has(f.row, &f.column))
}

/// Number of distinct reported cells that currently have a patch.
pub fn satisfied_count(findings: &[Finding], overlay: &PatchOverlay) -> usize {
    reported_cells(findings)
        .into_iter()
        .filter(|&(row, column)| overlay.has(row, column))
        .count()
}

/// Number of distinct reported cells.
pub fn reported_count(findings: &[Finding]) -> usize {
    reported_cells(findings).len()
}
