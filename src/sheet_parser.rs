//! Upload parsing for delimited text (.csv/.tsv/.txt) and workbooks (.xlsx/.xlsm).
//!
//! Produces the dataset sent for validation, the schema template IRI it must
//! be validated against, and any workbook sheets to carry through to export.

use crate::dataset::{CellValue, Dataset, Sheet};
use crate::error::InputFileError;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, info};

/// Where the template identifier lives in an upload.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub main_sheet: String,
    pub metadata_sheet: String,
    /// Column of the metadata sheet holding the full template IRI.
    pub template_iri_field: String,
    /// Column of a delimited file holding the bare template id.
    pub schema_id_field: String,
    pub template_iri_base: String,
}

/// A parsed upload, ready to be sent to the validation service.
#[derive(Debug, Clone)]
pub struct ParsedUpload {
    pub dataset: Dataset,
    pub template_iri: String,
    pub auxiliary_sheets: Vec<Sheet>,
}

/// Dispatch file parsing by extension.
pub fn parse_upload(filename: &str, data: &[u8], settings: &UploadSettings) -> Result<ParsedUpload, InputFileError> {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_lowercase();

    let upload = match ext.as_str() {
        "csv" | "tsv" | "txt" => {
            let dataset = parse_delimited(filename, data)?;
            let template_iri = delimited_template_iri(&dataset, settings)?;
            ParsedUpload {
                dataset,
                template_iri,
                auxiliary_sheets: Vec::new(),
            }
        }
        "xlsx" | "xlsm" => parse_workbook(data, settings)?,
        _ => {
            return Err(InputFileError {
                message: "Unsupported file type.".to_string(),
                cause: format!(
                    "Files of type .{} cannot be validated. Supported: .csv, .tsv, .txt, .xlsx, .xlsm",
                    ext
                ),
            })
        }
    };

    info!(
        "Parsed upload {}: {} rows, {} auxiliary sheets, template {}",
        filename,
        upload.dataset.len(),
        upload.auxiliary_sheets.len(),
        upload.template_iri
    );
    Ok(upload)
}

/// Parse delimited text with a header row. Values are typed: booleans,
/// numbers, everything else text. Missing trailing fields become empty text.
pub fn parse_delimited(filename: &str, data: &[u8]) -> Result<Dataset, InputFileError> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let delimiter = delimiter_for(filename, data);
    debug!("Parsing {} with delimiter {:?}", filename, delimiter as char);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| InputFileError::invalid(format!("The header row cannot be read: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(InputFileError::invalid("The file is empty."));
    }

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result
            .map_err(|e| InputFileError::invalid(format!("Line {} cannot be read: {}", i + 2, e)))?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        let values: BTreeMap<String, CellValue> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty())
            .map(|(col, h)| (h.clone(), CellValue::infer(record.get(col).unwrap_or(""))))
            .collect();
        rows.push(values);
    }

    if rows.is_empty() {
        return Err(InputFileError::invalid("The file is empty."));
    }

    Ok(Dataset::from_values(rows))
}

/// Delimiter by extension; `.txt` is sniffed from the header line.
fn delimiter_for(filename: &str, data: &[u8]) -> u8 {
    let lower = filename.to_lowercase();
    if lower.ends_with(".tsv") {
        return b'\t';
    }
    if lower.ends_with(".csv") {
        return b',';
    }
    let first_line = data.split(|&b| b == b'\n').next().unwrap_or(&[]);
    let tabs = first_line.iter().filter(|&&b| b == b'\t').count();
    let commas = first_line.iter().filter(|&&b| b == b',').count();
    if tabs > commas {
        b'\t'
    } else {
        b','
    }
}

fn delimited_template_iri(dataset: &Dataset, settings: &UploadSettings) -> Result<String, InputFileError> {
    let schema_id = dataset
        .rows()
        .first()
        .and_then(|r| r.get(&settings.schema_id_field))
        .filter(|v| !v.is_blank())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            InputFileError::invalid(format!("The {} is missing in the file.", settings.schema_id_field))
        })?;
    let schema_id = schema_id.trim();
    if schema_id.starts_with("http://") || schema_id.starts_with("https://") {
        return Ok(schema_id.to_string());
    }
    Ok(format!("{}{}", settings.template_iri_base, schema_id))
}

/// Parse a workbook: main data sheet (named, else first), metadata sheet
/// with the template IRI, and every other sheet carried through unchanged.
pub fn parse_workbook(data: &[u8], settings: &UploadSettings) -> Result<ParsedUpload, InputFileError> {
    let cursor = Cursor::new(data);
    let mut workbook: Xlsx<_> = open_workbook_from_rs(cursor)
        .map_err(|e| InputFileError::invalid(format!("The workbook cannot be opened: {}", e)))?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let main_name = if sheet_names.contains(&settings.main_sheet) {
        settings.main_sheet.clone()
    } else {
        sheet_names
            .first()
            .cloned()
            .ok_or_else(|| InputFileError::invalid(format!("The [{}] sheet is missing.", settings.main_sheet)))?
    };

    let mut sheets = Vec::with_capacity(sheet_names.len());
    for name in &sheet_names {
        let range = workbook
            .worksheet_range(name)
            .map_err(|e| InputFileError::invalid(format!("The [{}] sheet cannot be read: {}", name, e)))?;
        sheets.push(range_to_sheet(name, &range));
    }

    let main = sheets
        .iter()
        .find(|s| s.name == main_name)
        .ok_or_else(|| InputFileError::invalid(format!("The [{}] sheet is missing.", settings.main_sheet)))?;
    let dataset = sheet_to_dataset(main);
    if dataset.is_empty() {
        return Err(InputFileError::invalid(format!("The [{}] sheet is empty.", settings.main_sheet)));
    }

    let metadata = sheets
        .iter()
        .find(|s| s.name == settings.metadata_sheet)
        .ok_or_else(|| InputFileError::invalid(format!("The [{}] sheet is missing.", settings.metadata_sheet)))?;
    if metadata.rows.is_empty() {
        return Err(InputFileError::invalid(format!("The [{}] sheet is empty.", settings.metadata_sheet)));
    }
    let template_iri = metadata
        .headers
        .iter()
        .position(|h| *h == settings.template_iri_field)
        .and_then(|col| metadata.rows[0].get(col))
        .filter(|v| !v.is_blank())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            InputFileError::invalid(format!(
                "The schema IRI is missing in the [{}] sheet.",
                settings.metadata_sheet
            ))
        })?;

    let auxiliary_sheets = sheets.into_iter().filter(|s| s.name != main_name).collect();

    Ok(ParsedUpload {
        dataset,
        template_iri,
        auxiliary_sheets,
    })
}

/// Convert a calamine Range into a Sheet. First row = headers.
fn range_to_sheet(name: &str, range: &calamine::Range<Data>) -> Sheet {
    let mut row_iter = range.rows();
    let headers: Vec<String> = row_iter
        .next()
        .map(|row| row.iter().map(|c| cell_to_value(c).to_string()).collect())
        .unwrap_or_default();
    let rows = row_iter
        .map(|row| row.iter().map(cell_to_value).collect::<Vec<_>>())
        .filter(|values| !values.iter().all(|v| v.is_blank()))
        .collect();
    Sheet {
        name: name.to_string(),
        headers,
        rows,
    }
}

/// Records of the main sheet. Every header becomes a key; blank cells are empty text.
fn sheet_to_dataset(sheet: &Sheet) -> Dataset {
    let rows = sheet
        .rows
        .iter()
        .map(|values| {
            sheet
                .headers
                .iter()
                .enumerate()
                .filter(|(_, h)| !h.is_empty())
                .map(|(col, h)| {
                    let value = match values.get(col) {
                        Some(CellValue::Null) | None => CellValue::text(""),
                        Some(v) => v.clone(),
                    };
                    (h.clone(), value)
                })
                .collect()
        })
        .collect();
    Dataset::from_values(rows)
}

/// Convert a calamine cell to a scalar value.
fn cell_to_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Null,
        Data::String(s) => CellValue::text(s.clone()),
        Data::Int(i) => CellValue::integer(*i),
        Data::Float(f) => {
            // Whole numbers stay integers
            if *f == (*f as i64) as f64 && f.abs() < i64::MAX as f64 {
                CellValue::integer(*f as i64)
            } else {
                CellValue::float(*f)
            }
        }
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::text(excel_serial_to_string(dt.as_f64())),
        Data::DateTimeIso(s) => CellValue::text(s.clone()),
        Data::DurationIso(s) => CellValue::text(s.clone()),
        Data::Error(e) => CellValue::text(format!("#ERR:{:?}", e)),
    }
}

/// Convert an Excel serial date number to `YYYY-MM-DD[ HH:MM:SS]`.
/// Excel epoch: 1899-12-30, with the 1900 leap year bug (serial 60 is "Feb 29, 1900").
fn excel_serial_to_string(serial: f64) -> String {
    let days = serial as i64;
    let frac = serial - days as f64;

    let adjusted_days = if days > 59 { days - 1 } else { days };

    let unix_days = adjusted_days - 25568;
    let total_secs = unix_days * 86400 + (frac * 86400.0).round() as i64;

    let days_since_epoch = total_secs.div_euclid(86400);
    let time_of_day = total_secs.rem_euclid(86400);

    let (year, month, day) = civil_from_days(days_since_epoch);
    let (hours, minutes, seconds) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    if time_of_day == 0 {
        format!("{:04}-{:02}-{:02}", year, month, day)
    } else {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hours, minutes, seconds
        )
    }
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
