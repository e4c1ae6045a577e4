//! Materialize the corrected dataset and write it out as CSV, TSV or XLSX.

use crate::completion::is_complete;
use crate::dataset::{CellValue, Dataset, Record, Sheet};
use crate::patch::PatchOverlay;
use crate::report::Finding;
use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};
use std::collections::BTreeSet;
use tracing::info;

/// Name of the main data sheet in exported workbooks.
pub const MAIN_SHEET_NAME: &str = "MAIN";

const DRAFT_PREFIX: &str = "draft-";
const VALIDATED_PREFIX: &str = "validated-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Tsv,
    Xlsx,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => ".csv",
            Self::Tsv => ".tsv",
            Self::Xlsx => ".xlsx",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Csv => "text/csv",
            Self::Tsv => "text/tab-separated-values",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        }
    }
}

/// A rendered download.
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Apply the whole overlay to the dataset. Row order and row numbers are kept;
/// each record gains any column a patch added to it.
pub fn materialize(dataset: &Dataset, overlay: &PatchOverlay) -> Dataset {
    let rows = dataset
        .rows()
        .iter()
        .map(|record| {
            let mut values = record.values.clone();
            for (column, patch) in overlay.row_patches(record.row_number) {
                values.insert(column.clone(), patch.value.clone());
            }
            Record::new(record.row_number, values)
        })
        .collect();
    Dataset::new(rows)
}

/// Header columns: schema order first, then any other data column, sorted.
pub fn header_columns(dataset: &Dataset, column_order: &[String]) -> Vec<String> {
    let mut header: Vec<String> = column_order.to_vec();
    let known: BTreeSet<&String> = column_order.iter().collect();
    let extra: Vec<String> = dataset
        .columns()
        .into_iter()
        .filter(|c| !known.contains(c))
        .collect();
    header.extend(extra);
    header
}

/// Delimiter-separated text with a header row. Fields holding the delimiter,
/// a quote or a line break are quoted.
pub fn serialize_delimited(dataset: &Dataset, column_order: &[String], delimiter: u8) -> Result<String> {
    let header = header_columns(dataset, column_order);
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());

    writer.write_record(&header).context("Failed to write header row")?;
    for record in dataset.rows() {
        let fields: Vec<String> = header
            .iter()
            .map(|column| record.get(column).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        writer
            .write_record(&fields)
            .with_context(|| format!("Failed to write row {}", record.row_number))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush delimited output: {}", e))?;
    String::from_utf8(bytes).context("Delimited output is not valid UTF-8")
}

/// Workbook with the dataset on the `MAIN` sheet followed by the auxiliary
/// sheets, unchanged and in their original order.
pub fn serialize_workbook(dataset: &Dataset, column_order: &[String], auxiliary_sheets: &[Sheet]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();

    let header = header_columns(dataset, column_order);
    let main = workbook.add_worksheet();
    main.set_name(MAIN_SHEET_NAME)?;
    write_header(main, &header)?;
    for (i, record) in dataset.rows().iter().enumerate() {
        let row = (i + 1) as u32;
        for (col, column) in header.iter().enumerate() {
            if let Some(value) = record.get(column) {
                write_cell(main, row, col as u16, value)?;
            }
        }
    }

    for sheet in auxiliary_sheets {
        let worksheet = workbook.add_worksheet();
        worksheet
            .set_name(&sheet.name)
            .with_context(|| format!("Invalid sheet name '{}'", sheet.name))?;
        write_header(worksheet, &sheet.headers)?;
        for (i, values) in sheet.rows.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                write_cell(worksheet, (i + 1) as u32, col as u16, value)?;
            }
        }
    }

    workbook.save_to_buffer().context("Failed to save workbook")
}

fn write_header(worksheet: &mut Worksheet, header: &[String]) -> Result<()> {
    for (col, name) in header.iter().enumerate() {
        worksheet.write_string(0, col as u16, name)?;
    }
    Ok(())
}

fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, value: &CellValue) -> Result<()> {
    match value {
        CellValue::Null => {}
        CellValue::Bool(b) => {
            worksheet.write_boolean(row, col, *b)?;
        }
        CellValue::Number(n) => match n.as_f64() {
            Some(f) => {
                worksheet.write_number(row, col, f)?;
            }
            None => {
                worksheet.write_string(row, col, &n.to_string())?;
            }
        },
        CellValue::Text(s) => {
            worksheet.write_string(row, col, s)?;
        }
    }
    Ok(())
}

/// Download name: any `draft-`/`validated-` prefix is replaced according to
/// completion and the extension is swapped for the target format's.
pub fn output_file_name(input_name: &str, complete: bool, format: ExportFormat) -> String {
    let base = input_name
        .strip_prefix(DRAFT_PREFIX)
        .or_else(|| input_name.strip_prefix(VALIDATED_PREFIX))
        .unwrap_or(input_name);
    let stem = match base.rfind('.') {
        Some(pos) => &base[..pos],
        None => base,
    };
    let prefix = if complete { VALIDATED_PREFIX } else { DRAFT_PREFIX };
    format!("{}{}{}", prefix, stem, format.extension())
}

/// Everything needed to render a download for a session.
pub struct ExportRequest<'a> {
    pub input_name: &'a str,
    pub dataset: &'a Dataset,
    pub overlay: &'a PatchOverlay,
    pub findings: &'a [Finding],
    pub column_order: &'a [String],
    pub auxiliary_sheets: &'a [Sheet],
}

pub fn export(request: &ExportRequest<'_>, format: ExportFormat) -> Result<ExportFile> {
    let complete = is_complete(request.findings, request.overlay);
    let materialized = materialize(request.dataset, request.overlay);
    let bytes = match format {
        ExportFormat::Csv => serialize_delimited(&materialized, request.column_order, b',')?.into_bytes(),
        ExportFormat::Tsv => serialize_delimited(&materialized, request.column_order, b'\t')?.into_bytes(),
        ExportFormat::Xlsx => serialize_workbook(&materialized, request.column_order, request.auxiliary_sheets)?,
    };
    let file_name = output_file_name(request.input_name, complete, format);
    info!(
        "Exported {} ({} rows, {} patches, {} bytes)",
        file_name,
        materialized.len(),
        request.overlay.patch_count(),
        bytes.len()
    );
    Ok(ExportFile {
        file_name,
        content_type: format.content_type(),
        bytes,
    })
}
