//! In-memory validation sessions and the repair actions applied to them.
//!
//! A session lives from one successful upload until it is discarded. The
//! dataset, schema and findings are fixed at creation; only the patch overlay
//! changes, and every change goes through [`SessionStore::update`] under one
//! write guard.

use crate::completion;
use crate::dataset::{CellValue, Dataset, Record, Sheet};
use crate::error::{AppError, SchemaError};
use crate::export::{self, ExportFile, ExportFormat, ExportRequest};
use crate::field_check::{FieldCheckRegistry, FieldKey, FieldStatus};
use crate::patch::{Patch, PatchOverlay};
use crate::report::{
    self, AdherenceGroup, ChartRow, ColumnFilter, CompletenessGroup, ErrorKindSummary, ErrorType,
    EvaluationSummary, Finding, NavigationPaths,
};
use crate::schema::{ColumnDescriptor, PermissibleValues, SchemaDescriptor, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub input_file_name: String,
    pub input_size: usize,
    pub template_iri: String,
    pub schema: SchemaDescriptor,
    pub dataset: Dataset,
    pub findings: Vec<Finding>,
    pub overlay: PatchOverlay,
    pub auxiliary_sheets: Vec<Sheet>,
    pub paths: NavigationPaths,
    last_used: Mutex<Instant>,
}

/// Session contents before an id is assigned.
pub struct NewSession {
    pub input_file_name: String,
    pub input_size: usize,
    pub template_iri: String,
    pub schema: SchemaDescriptor,
    pub dataset: Dataset,
    pub findings: Vec<Finding>,
    pub auxiliary_sheets: Vec<Sheet>,
}

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub id: String,
    pub input_file_name: String,
    pub input_size: usize,
    pub template_iri: String,
    pub evaluation: EvaluationSummary,
    pub completeness: Vec<CompletenessGroup>,
    pub adherence: Vec<ErrorKindSummary>,
    pub complete: bool,
    pub satisfied_count: usize,
    pub reported_count: usize,
    pub patch_count: usize,
    pub patched_row_count: usize,
    pub paths: NavigationPaths,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessReport {
    pub groups: Vec<CompletenessGroup>,
    pub chart: Vec<ChartRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdherenceReport {
    pub summary: Vec<ErrorKindSummary>,
    pub chart: Vec<ChartRow>,
}

/// Schema facts the repair tables show for a column.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub column: String,
    pub label: String,
    pub value_type: ValueType,
    pub description: String,
    pub required: bool,
    pub example: Option<String>,
    pub permissible_values: PermissibleValues,
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessView {
    pub info: ColumnInfo,
    pub total_count_title: String,
    pub action_title: String,
    pub column_order: Vec<String>,
    pub total_records: usize,
    pub records: Vec<Record>,
    /// Current effective value of the column for each listed row.
    pub user_input: BTreeMap<usize, CellValue>,
    pub remaining_count: usize,
    pub next: Option<String>,
}

/// Pre-filled repair input for one adherence group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInput {
    pub column: String,
    pub value: CellValue,
    pub rows: Vec<usize>,
    pub approved: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdherenceGroupView {
    #[serde(flatten)]
    pub group: AdherenceGroup,
    pub info: ColumnInfo,
    pub remaining_count: usize,
    pub total_count_title: String,
    pub user_input: GroupInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdherenceView {
    pub error_type: ErrorType,
    pub error_id: String,
    pub action_title: String,
    pub groups: Vec<AdherenceGroupView>,
    pub next: Option<ErrorType>,
}

// ============================================================================
// Repair requests
// ============================================================================

/// The user's decision for one adherence group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupApproval {
    pub id: String,
    #[serde(default)]
    pub value: CellValue,
    #[serde(default = "approved_by_default")]
    pub approved: bool,
}

fn approved_by_default() -> bool {
    true
}

/// Rows a batch edit applies to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchTarget {
    /// Explicit row numbers.
    Rows(Vec<usize>),
    /// Rows of the column's completeness table whose effective records match every filter.
    Filters(Vec<ColumnFilter>),
}

/// Paging and filtering of a repair table.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    pub filters: Vec<ColumnFilter>,
    pub page: usize,
    pub rows_per_page: usize,
}

impl Session {
    pub fn new(id: String, new: NewSession) -> Self {
        let paths = NavigationPaths::from_findings(&new.findings);
        Self {
            id,
            input_file_name: new.input_file_name,
            input_size: new.input_size,
            template_iri: new.template_iri,
            schema: new.schema,
            dataset: new.dataset,
            findings: new.findings,
            overlay: PatchOverlay::new(),
            auxiliary_sheets: new.auxiliary_sheets,
            paths,
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_since(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    /// Refuse the whole update if any value's field check settled as invalid
    /// for exactly that value. Runs before anything is written.
    fn ensure_checks_pass<'a, I>(&self, checks: &FieldCheckRegistry, cells: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = (usize, &'a str, &'a CellValue)>,
    {
        for (row, column, value) in cells {
            let key = FieldKey {
                session: self.id.clone(),
                row,
                column: column.to_string(),
            };
            if let FieldStatus::Invalid { reason } = checks.status_for_value(&key, &value.to_string()) {
                return Err(AppError::BadRequest(format!(
                    "Row {} column '{}' failed its check: {}",
                    row, column, reason
                )));
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        completion::is_complete(&self.findings, &self.overlay)
    }

    pub fn overview(&self) -> SessionOverview {
        SessionOverview {
            id: self.id.clone(),
            input_file_name: self.input_file_name.clone(),
            input_size: self.input_size,
            template_iri: self.template_iri.clone(),
            evaluation: report::evaluation_summary(&self.dataset, &self.findings),
            completeness: report::group_completeness_by_column(&self.findings, &self.overlay),
            adherence: report::summary_by_error_kind(&self.findings, &self.overlay),
            complete: self.is_complete(),
            satisfied_count: completion::satisfied_count(&self.findings, &self.overlay),
            reported_count: completion::reported_count(&self.findings),
            patch_count: self.overlay.patch_count(),
            patched_row_count: self.overlay.patched_row_count(),
            paths: self.paths.clone(),
        }
    }

    pub fn completeness_report(&self) -> CompletenessReport {
        CompletenessReport {
            groups: report::group_completeness_by_column(&self.findings, &self.overlay),
            chart: report::chart_rows(&self.dataset, &self.findings, true),
        }
    }

    pub fn adherence_report(&self) -> AdherenceReport {
        AdherenceReport {
            summary: report::summary_by_error_kind(&self.findings, &self.overlay),
            chart: report::chart_rows(&self.dataset, &self.findings, false),
        }
    }

    fn column_info(&self, column: &str) -> Result<ColumnInfo, SchemaError> {
        let example = match self.schema.has_example(column)? {
            true => self.schema.example(column)?.map(str::to_string),
            false => None,
        };
        Ok(ColumnInfo {
            column: column.to_string(),
            label: self.schema.label(column)?.to_string(),
            value_type: self.schema.value_type(column)?,
            description: self.schema.description(column)?.to_string(),
            required: self.schema.required(column)?,
            example,
            permissible_values: self.schema.permissible_values(column)?,
            pattern: self.schema.pattern(column)?.map(str::to_string),
        })
    }

    /// Resolve a column named by a client. Unknown names are the client's mistake.
    fn known_column(&self, column: &str) -> Result<&ColumnDescriptor, AppError> {
        self.schema
            .column(column)
            .map_err(|_| AppError::BadRequest(format!("Unknown column '{}'", column)))
    }

    fn known_row(&self, row: usize) -> Result<(), AppError> {
        match self.dataset.record(row) {
            Some(_) => Ok(()),
            None => Err(AppError::BadRequest(format!("Unknown row {}", row))),
        }
    }

    /// Repair table for the missing values of one column.
    pub fn completeness_view(&self, column: &str, query: &TableQuery) -> Result<CompletenessView, AppError> {
        self.known_column(column)?;
        let table = report::completeness_table(&self.findings, column, &self.dataset, &self.overlay);
        if table.is_empty() {
            return Err(AppError::BadRequest(format!(
                "Column '{}' has no missing values",
                column
            )));
        }
        let filtered: Vec<Record> = report::filter_records(&table, &query.filters)
            .into_iter()
            .cloned()
            .collect();
        let records = report::page(&filtered, query.page, query.rows_per_page).to_vec();
        let user_input = records
            .iter()
            .map(|r| (r.row_number, r.get(column).cloned().unwrap_or_default()))
            .collect();
        let rows: Vec<usize> = table.iter().map(|r| r.row_number).collect();
        let remaining_count = rows.iter().filter(|&&row| !self.overlay.has(row, column)).count();

        Ok(CompletenessView {
            info: self.column_info(column)?,
            total_count_title: ErrorType::MissingRequired.total_count_title(table.len(), column),
            action_title: ErrorType::MissingRequired.action_title(column),
            column_order: self.schema.order_with_first(column),
            total_records: filtered.len(),
            records,
            user_input,
            remaining_count,
            next: self.paths.next_column(column).map(str::to_string),
        })
    }

    fn adherence_groups(&self, error_type: ErrorType) -> Vec<AdherenceGroup> {
        report::group_adherence_by_type_and_value(&self.findings, &self.dataset, &self.overlay)
            .into_iter()
            .filter(|g| g.error_type == error_type)
            .collect()
    }

    /// Groups of identical bad values for one adherence kind, with seeded input.
    pub fn adherence_view(&self, error_type: ErrorType) -> Result<AdherenceView, AppError> {
        if !error_type.is_adherence() {
            return Err(AppError::BadRequest(format!(
                "'{}' is not an adherence error type",
                error_type.as_str()
            )));
        }
        let mut groups = Vec::new();
        for group in self.adherence_groups(error_type) {
            let user_input = GroupInput {
                column: group.column.clone(),
                value: group.proposed_value(&self.overlay),
                rows: group.rows.clone(),
                approved: group.approved(&self.overlay),
            };
            groups.push(AdherenceGroupView {
                info: self.column_info(&group.column)?,
                remaining_count: group.remaining_count(&self.overlay),
                total_count_title: error_type.total_count_title(group.rows.len(), &group.column),
                user_input,
                group,
            });
        }
        Ok(AdherenceView {
            error_type,
            error_id: error_type.error_id().to_string(),
            action_title: error_type.action_title(""),
            groups,
            next: self.paths.next_error_type(error_type),
        })
    }

    /// Apply the approved groups of one adherence kind as a single update.
    /// A required column given a null value loses its patch instead of being
    /// patched to null. Returns the number of cells touched.
    pub fn accept_adherence(
        &mut self,
        error_type: ErrorType,
        approvals: &[GroupApproval],
        checks: &FieldCheckRegistry,
    ) -> Result<usize, AppError> {
        let groups: HashMap<String, AdherenceGroup> = self
            .adherence_groups(error_type)
            .into_iter()
            .map(|g| (g.id.clone(), g))
            .collect();

        // Resolve everything first so an unknown id changes nothing.
        let mut planned = Vec::new();
        for approval in approvals.iter().filter(|a| a.approved) {
            let group = groups
                .get(&approval.id)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown repair group '{}'", approval.id)))?;
            let required = self.schema.required(&group.column)?;
            planned.push((group, approval.value.clone(), required));
        }
        let written: Vec<(usize, &str, &CellValue)> = planned
            .iter()
            .filter(|(_, value, required)| !(*required && *value == CellValue::Null))
            .flat_map(|(group, value, _)| group.rows.iter().map(move |&row| (row, group.column.as_str(), value)))
            .collect();
        self.ensure_checks_pass(checks, written)?;

        let mut touched = 0;
        for (group, value, required) in planned {
            for &row in &group.rows {
                if required && value == CellValue::Null {
                    self.overlay.remove(row, &group.column);
                } else {
                    self.overlay.set(&self.dataset, row, &group.column, value.clone());
                }
                touched += 1;
            }
        }
        info!(
            "Session {}: accepted {} {} repairs ({} patches total)",
            self.id,
            touched,
            error_type.as_str(),
            self.overlay.patch_count()
        );
        Ok(touched)
    }

    /// Save the completeness table of one column: `Some` sets, `None` clears the patch.
    pub fn save_completeness(
        &mut self,
        column: &str,
        edits: Vec<(usize, Option<CellValue>)>,
        checks: &FieldCheckRegistry,
    ) -> Result<usize, AppError> {
        self.known_column(column)?;
        for (row, _) in &edits {
            self.known_row(*row)?;
        }
        self.ensure_checks_pass(
            checks,
            edits
                .iter()
                .filter_map(|(row, value)| value.as_ref().map(|v| (*row, column, v))),
        )?;
        let count = edits.len();
        self.overlay.apply_edits(&self.dataset, column, edits);
        debug!("Session {}: saved {} edits under '{}'", self.id, count, column);
        Ok(count)
    }

    /// Set one value for many rows of a column. Either every row is patched or none is.
    pub fn batch_set(
        &mut self,
        column: &str,
        target: &BatchTarget,
        value: &CellValue,
        checks: &FieldCheckRegistry,
    ) -> Result<usize, AppError> {
        self.known_column(column)?;
        let rows: Vec<usize> = match target {
            BatchTarget::Rows(rows) => {
                for &row in rows {
                    self.known_row(row)?;
                }
                rows.clone()
            }
            BatchTarget::Filters(filters) => {
                let table = report::completeness_table(&self.findings, column, &self.dataset, &self.overlay);
                report::filter_records(&table, filters)
                    .into_iter()
                    .map(|r| r.row_number)
                    .collect()
            }
        };
        self.ensure_checks_pass(checks, rows.iter().map(|&row| (row, column, value)))?;
        let count = self.overlay.set_many(&self.dataset, rows, column, value);
        info!("Session {}: batch set {} rows under '{}'", self.id, count, column);
        Ok(count)
    }

    pub fn set_patch(
        &mut self,
        row: usize,
        column: &str,
        value: CellValue,
        checks: &FieldCheckRegistry,
    ) -> Result<Patch, AppError> {
        self.known_column(column)?;
        self.known_row(row)?;
        self.ensure_checks_pass(checks, [(row, column, &value)])?;
        Ok(self.overlay.set(&self.dataset, row, column, value).clone())
    }

    pub fn remove_patch(&mut self, row: usize, column: &str) -> Option<Patch> {
        self.overlay.remove(row, column)
    }

    pub fn export(&self, format: ExportFormat) -> anyhow::Result<ExportFile> {
        export::export(
            &ExportRequest {
                input_name: &self.input_file_name,
                dataset: &self.dataset,
                overlay: &self.overlay,
                findings: &self.findings,
                column_order: self.schema.column_order(),
                auxiliary_sheets: &self.auxiliary_sheets,
            },
            format,
        )
    }
}

// ============================================================================
// Store
// ============================================================================

/// Shared session map.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new session and return its id.
    pub fn create(&self, new: NewSession) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), new);
        info!(
            "SessionStore: created '{}' ({}, {} rows, {} findings)",
            id,
            session.input_file_name,
            session.dataset.len(),
            session.findings.len()
        );
        self.inner.write().unwrap().insert(id.clone(), session);
        id
    }

    /// Run `f` against a session under a read guard.
    pub fn read<T>(&self, id: &str, f: impl FnOnce(&Session) -> T) -> Result<T, AppError> {
        let store = self.inner.read().unwrap();
        let session = store
            .get(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;
        session.touch();
        Ok(f(session))
    }

    /// Run a compound update under one write guard. Readers see all of it or none of it.
    pub fn update<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> Result<T, AppError>) -> Result<T, AppError> {
        let mut store = self.inner.write().unwrap();
        let session = store
            .get_mut(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;
        session.touch();
        f(session)
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.inner.write().unwrap().remove(id).is_some();
        if removed {
            info!("SessionStore: discarded '{}'", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard sessions not read or updated within `ttl` of `now`. Returns their ids.
    pub fn sweep_idle(&self, ttl: Duration, now: Instant) -> Vec<String> {
        let mut store = self.inner.write().unwrap();
        let expired: Vec<String> = store
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.idle_since()) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            store.remove(id);
            info!("SessionStore: expired idle session '{}'", id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_check::UrlSyntaxCheck;
    use crate::schema::tests::sample_schema;

    fn row(values: &[(&str, CellValue)]) -> BTreeMap<String, CellValue> {
        values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn new_session() -> NewSession {
        let dataset = Dataset::from_values(vec![
            row(&[
                ("sample_id", CellValue::text("S-0001")),
                ("name", CellValue::text("")),
                ("tissue", CellValue::text("hart")),
            ]),
            row(&[
                ("sample_id", CellValue::text("S-0002")),
                ("name", CellValue::text("Bob")),
                ("tissue", CellValue::text("hart")),
            ]),
            row(&[
                ("sample_id", CellValue::text("S-0003")),
                ("name", CellValue::text("")),
                ("tissue", CellValue::text("Liver")),
            ]),
        ]);
        let findings = vec![
            Finding::new(0, "name", CellValue::text(""), ErrorType::MissingRequired),
            Finding::new(2, "name", CellValue::text(""), ErrorType::MissingRequired),
            Finding::new(0, "tissue", CellValue::text("hart"), ErrorType::NotStandardTerm)
                .with_suggestion(CellValue::text("Heart")),
            Finding::new(1, "tissue", CellValue::text("hart"), ErrorType::NotStandardTerm)
                .with_suggestion(CellValue::text("Heart")),
        ];
        NewSession {
            input_file_name: "samples.csv".to_string(),
            input_size: 128,
            template_iri: "https://repo/templates/1".to_string(),
            schema: sample_schema(),
            dataset,
            findings,
            auxiliary_sheets: Vec::new(),
        }
    }

    const GROUP_ID: &str = "tissue-hart-notStandardTerm";

    fn no_checks() -> FieldCheckRegistry {
        FieldCheckRegistry::new(Duration::ZERO)
    }

    /// Registry holding a settled `invalid` URL check for `value` at (`row`, `homepage`).
    async fn failed_url_check(row: usize, value: &str) -> FieldCheckRegistry {
        let checks = FieldCheckRegistry::new(Duration::from_millis(1));
        let key = FieldKey {
            session: "s".to_string(),
            row,
            column: "homepage".to_string(),
        };
        checks.schedule(key.clone(), value.to_string(), Arc::new(UrlSyntaxCheck));
        for _ in 0..100 {
            if checks.status(&key) != FieldStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(checks.status_for_value(&key, value), FieldStatus::Invalid { .. }));
        checks
    }

    #[test]
    fn test_create_read_remove() {
        let store = SessionStore::new();
        let id = store.create(new_session());
        let overview = store.read(&id, |s| s.overview()).unwrap();
        assert_eq!(overview.reported_count, 4);
        assert!(!overview.complete);
        assert_eq!(overview.paths.completeness_error_locations, vec!["name"]);

        assert!(store.remove(&id));
        assert!(matches!(store.read(&id, |_| ()), Err(AppError::SessionNotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_accept_adherence_group() {
        let store = SessionStore::new();
        let id = store.create(new_session());
        let approvals = vec![GroupApproval {
            id: GROUP_ID.to_string(),
            value: CellValue::text("Heart"),
            approved: true,
        }];
        let touched = store
            .update(&id, |s| s.accept_adherence(ErrorType::NotStandardTerm, &approvals, &no_checks()))
            .unwrap();
        assert_eq!(touched, 2);

        let view = store.read(&id, |s| s.adherence_view(ErrorType::NotStandardTerm)).unwrap().unwrap();
        assert_eq!(view.groups.len(), 1);
        assert_eq!(view.groups[0].remaining_count, 0);
        assert!(view.groups[0].user_input.approved);
        assert_eq!(view.groups[0].user_input.value, CellValue::text("Heart"));
        assert_eq!(
            view.groups[0].group.records[1].get("tissue"),
            Some(&CellValue::text("Heart"))
        );
    }

    #[test]
    fn test_unapproved_group_is_skipped() {
        let mut session = Session::new("s".to_string(), new_session());
        let approvals = vec![GroupApproval {
            id: GROUP_ID.to_string(),
            value: CellValue::text("Heart"),
            approved: false,
        }];
        assert_eq!(session.accept_adherence(ErrorType::NotStandardTerm, &approvals, &no_checks()).unwrap(), 0);
        assert!(session.overlay.is_empty());
    }

    #[test]
    fn test_unknown_group_changes_nothing() {
        let mut session = Session::new("s".to_string(), new_session());
        let approvals = vec![
            GroupApproval {
                id: GROUP_ID.to_string(),
                value: CellValue::text("Heart"),
                approved: true,
            },
            GroupApproval {
                id: "nope".to_string(),
                value: CellValue::Null,
                approved: true,
            },
        ];
        let result = session.accept_adherence(ErrorType::NotStandardTerm, &approvals, &no_checks());
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(session.overlay.is_empty());
    }

    #[test]
    fn test_accept_null_on_required_column_removes_patch() {
        let mut new = new_session();
        new.findings.push(
            Finding::new(1, "sample_id", CellValue::text("S-0002"), ErrorType::InvalidValueFormat),
        );
        let mut session = Session::new("s".to_string(), new);
        session.set_patch(1, "sample_id", CellValue::text("S-9999"), &no_checks()).unwrap();

        let approvals = vec![GroupApproval {
            id: "sample_id-S-0002-invalidValueFormat".to_string(),
            value: CellValue::Null,
            approved: true,
        }];
        session.accept_adherence(ErrorType::InvalidValueFormat, &approvals, &no_checks()).unwrap();
        assert!(!session.overlay.has(1, "sample_id"));
    }

    #[test]
    fn test_seeded_input_uses_suggestion_until_patched() {
        let session = Session::new("s".to_string(), new_session());
        let view = session.adherence_view(ErrorType::NotStandardTerm).unwrap();
        assert_eq!(view.groups[0].user_input.value, CellValue::text("Heart"));
        assert!(!view.groups[0].user_input.approved);
        assert_eq!(view.groups[0].remaining_count, 2);
    }

    #[test]
    fn test_completeness_save_and_clear() {
        let mut session = Session::new("s".to_string(), new_session());
        session
            .save_completeness(
                "name",
                vec![(0, Some(CellValue::text("Ann"))), (2, Some(CellValue::text("Cy")))],
                &no_checks(),
            )
            .unwrap();
        assert!(!session.is_complete());

        // Accepting the adherence group completes the session.
        session
            .accept_adherence(
                ErrorType::NotStandardTerm,
                &[GroupApproval {
                    id: GROUP_ID.to_string(),
                    value: CellValue::text("Heart"),
                    approved: true,
                }],
                &no_checks(),
            )
            .unwrap();
        assert!(session.is_complete());

        // Clearing a saved value reopens it.
        session.save_completeness("name", vec![(2, None)], &no_checks()).unwrap();
        assert!(!session.is_complete());

        let view = session.completeness_view("name", &TableQuery::default()).unwrap();
        assert_eq!(view.remaining_count, 1);
        assert_eq!(view.user_input.get(&0), Some(&CellValue::text("Ann")));
        assert_eq!(view.user_input.get(&2), Some(&CellValue::text("")));
        assert_eq!(view.column_order[0], "name");
    }

    #[test]
    fn test_completeness_view_filters_and_pages() {
        let session = Session::new("s".to_string(), new_session());
        let query = TableQuery {
            filters: vec![ColumnFilter {
                column: "sample_id".to_string(),
                value: "s-0003".to_string(),
            }],
            page: 0,
            rows_per_page: 10,
        };
        let view = session.completeness_view("name", &query).unwrap();
        assert_eq!(view.total_records, 1);
        assert_eq!(view.records[0].row_number, 2);

        let paged = TableQuery {
            rows_per_page: 1,
            page: 1,
            ..TableQuery::default()
        };
        let view = session.completeness_view("name", &paged).unwrap();
        assert_eq!(view.total_records, 2);
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.records[0].row_number, 2);
    }

    #[test]
    fn test_batch_set_by_filter() {
        let mut session = Session::new("s".to_string(), new_session());
        let target = BatchTarget::Filters(vec![ColumnFilter {
            column: "tissue".to_string(),
            value: "HART".to_string(),
        }]);
        let count = session.batch_set("name", &target, &CellValue::text("Unknown"), &no_checks()).unwrap();
        assert_eq!(count, 1);
        assert!(session.overlay.has(0, "name"));
        assert!(!session.overlay.has(2, "name"));
    }

    #[test]
    fn test_batch_with_unknown_row_is_rejected_whole() {
        let mut session = Session::new("s".to_string(), new_session());
        let target = BatchTarget::Rows(vec![0, 1, 99]);
        let result = session.batch_set("name", &target, &CellValue::text("x"), &no_checks());
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(session.overlay.is_empty());
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_batch() {
        let rows: Vec<BTreeMap<String, CellValue>> = (0..100)
            .map(|i| row(&[("name", CellValue::text(format!("n{}", i)))]))
            .collect();
        let new = NewSession {
            dataset: Dataset::from_values(rows),
            findings: Vec::new(),
            ..new_session()
        };
        let store = SessionStore::new();
        let id = store.create(new);

        let reader = {
            let store = store.clone();
            let id = id.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let count = store.read(&id, |s| s.overlay.patch_count()).unwrap();
                    assert!(count == 0 || count == 100, "observed partial batch of {}", count);
                }
            })
        };
        store
            .update(&id, |s| {
                s.batch_set("name", &BatchTarget::Rows((0..100).collect()), &CellValue::text("x"), &no_checks())
            })
            .unwrap();
        reader.join().unwrap();
        assert_eq!(store.read(&id, |s| s.overlay.patch_count()).unwrap(), 100);
    }

    #[test]
    fn test_unknown_column_is_bad_request() {
        let mut session = Session::new("s".to_string(), new_session());
        assert!(matches!(
            session.set_patch(0, "nope", CellValue::text("x"), &no_checks()),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_export_names_follow_completion() {
        let mut session = Session::new("s".to_string(), new_session());
        let draft = session.export(ExportFormat::Csv).unwrap();
        assert!(draft.file_name.starts_with("draft"));

        session
            .save_completeness(
                "name",
                vec![(0, Some(CellValue::text("Ann"))), (2, Some(CellValue::text("Cy")))],
                &no_checks(),
            )
            .unwrap();
        session
            .accept_adherence(
                ErrorType::NotStandardTerm,
                &[GroupApproval {
                    id: GROUP_ID.to_string(),
                    value: CellValue::text("Heart"),
                    approved: true,
                }],
                &no_checks(),
            )
            .unwrap();
        let done = session.export(ExportFormat::Csv).unwrap();
        assert_ne!(done.file_name, draft.file_name);
        let text = String::from_utf8(done.bytes).unwrap();
        assert!(text.contains("Ann"));
        assert!(!text.contains("hart"));
    }

    #[tokio::test]
    async fn test_completeness_save_refuses_failed_check() {
        let checks = failed_url_check(0, "not a url").await;
        let mut session = Session::new("s".to_string(), new_session());
        let result = session.save_completeness(
            "homepage",
            vec![(1, Some(CellValue::text("https://example.org"))), (0, Some(CellValue::text("not a url")))],
            &checks,
        );
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(session.overlay.is_empty());

        // Clearing the cell and other values are unaffected.
        session
            .save_completeness("homepage", vec![(0, Some(CellValue::text("https://example.org"))), (1, None)], &checks)
            .unwrap();
        assert!(session.overlay.has(0, "homepage"));
    }

    #[tokio::test]
    async fn test_batch_set_refuses_failed_check() {
        let checks = failed_url_check(2, "not a url").await;
        let mut session = Session::new("s".to_string(), new_session());
        let result = session.batch_set(
            "homepage",
            &BatchTarget::Rows(vec![0, 1, 2]),
            &CellValue::text("not a url"),
            &checks,
        );
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(session.overlay.is_empty());
    }

    #[tokio::test]
    async fn test_adherence_accept_refuses_failed_check() {
        let checks = failed_url_check(1, "not a url").await;
        let mut new = new_session();
        for row in [0, 1] {
            new.findings.push(
                Finding::new(row, "homepage", CellValue::text("htp:/x"), ErrorType::InvalidUrl)
                    .with_suggestion(CellValue::text("http://x.org")),
            );
        }
        let mut session = Session::new("s".to_string(), new);
        let approvals = vec![
            GroupApproval {
                id: GROUP_ID.to_string(),
                value: CellValue::text("Heart"),
                approved: true,
            },
            GroupApproval {
                id: "homepage-htp:/x-invalidUrl".to_string(),
                value: CellValue::text("not a url"),
                approved: true,
            },
        ];
        let result = session.accept_adherence(ErrorType::InvalidUrl, &approvals[1..], &checks);
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(session.overlay.is_empty());
        assert!(!session.is_complete());

        let touched = session
            .accept_adherence(ErrorType::NotStandardTerm, &approvals[..1], &checks)
            .unwrap();
        assert_eq!(touched, 2);
    }

    #[tokio::test]
    async fn test_single_patch_refuses_failed_check() {
        let checks = failed_url_check(0, "not a url").await;
        let mut session = Session::new("s".to_string(), new_session());
        assert!(matches!(
            session.set_patch(0, "homepage", CellValue::text("not a url"), &checks),
            Err(AppError::BadRequest(_))
        ));
        // A different value has not been checked and may be saved.
        assert!(session
            .set_patch(0, "homepage", CellValue::text("https://example.org"), &checks)
            .is_ok());
    }

    #[test]
    fn test_sweep_idle_discards_untouched_sessions() {
        let store = SessionStore::new();
        let idle = store.create(new_session());
        let ttl = Duration::from_secs(60);

        assert!(store.sweep_idle(ttl, Instant::now()).is_empty());
        let later = Instant::now() + ttl + Duration::from_secs(1);
        assert_eq!(store.sweep_idle(ttl, later), vec![idle.clone()]);
        assert!(matches!(store.read(&idle, |_| ()), Err(AppError::SessionNotFound(_))));
        assert!(store.is_empty());
    }
}
