use crate::cell::Value;
use crate::error::{FlashError, Result};
use crate::table::{Registry, Table};
use log::{info, warn};
use std::io::Cursor;
use std::path::Path;

/// Extensions that are worth a spreadsheet parse before falling back to text.
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];

/// Delimiters tried when sniffing a header line, in preference order.
const DELIMITERS: &[char] = &[',', ';', '\t', '|'];

/// One uploaded file: its original name and raw bytes.
#[derive(Clone, Debug)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Upload {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Outcome of ingesting a batch of uploads.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
    pub failures: Vec<FlashError>,
}

/// Load a table from delimited text
///
/// The delimiter is sniffed from the header line. Quoted fields may hold
/// delimiters, doubled quotes and line breaks. Blank lines are skipped.
///
/// # Arguments
/// * `bytes` - Raw file content, UTF-8 (a leading BOM is ignored)
///
/// # Returns
/// * `Result<Table, String>` - The parsed table or a reason it is not tabular
pub fn from_delimited(bytes: &[u8]) -> std::result::Result<Table, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not valid UTF-8 text: {}", e))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let first_line = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or("file is empty")?;
    let delimiter = sniff_delimiter(first_line);

    let mut records = parse_records(text, delimiter)?.into_iter();
    let header = records.next().ok_or("file is empty")?;

    let mut table = Table::new(header);
    for record in records {
        let row = record.iter().map(|field| Value::infer(field)).collect();
        table.push_row(row)?;
    }
    Ok(table)
}

/// Load a table from the first sheet of a workbook
///
/// The first row is the header. Accepts anything calamine can open
/// (xlsx, xlsm, xlsb, xls, ods).
///
/// # Arguments
/// * `bytes` - Raw workbook content
///
/// # Returns
/// * `Result<Table, String>` - The parsed table or the reason it could not be read
pub fn from_excel(bytes: &[u8]) -> std::result::Result<Table, String> {
    use calamine::{Data, Reader, open_workbook_auto_from_rs};

    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| e.to_string())?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or("No sheets found in workbook")?
        .map_err(|e| e.to_string())?;

    let mut rows = range.rows();
    let header = rows.next().ok_or("Excel sheet is empty")?;
    let mut table = Table::new(header.iter().map(|c| c.to_string()).collect());

    for row in rows {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        let values = row
            .iter()
            .map(|cell| match cell {
                Data::Int(i) => Value::Int(*i),
                Data::Float(f) => Value::Float(*f),
                Data::Bool(b) => Value::Bool(*b),
                Data::String(s) => Value::infer(s),
                Data::Empty | Data::Error(_) => Value::Null,
                other => Value::infer(&other.to_string()),
            })
            .collect();
        table.push_row(values)?;
    }

    Ok(table)
}

/// Detect file type and load appropriate format
///
/// Spreadsheet extensions get a workbook parse first; on any failure the
/// same bytes are parsed as delimited text. Everything else is parsed as
/// delimited text directly.
///
/// # Arguments
/// * `name` - Original filename, only its extension is consulted
/// * `bytes` - Raw file content
pub fn load_table(name: &str, bytes: &[u8]) -> Result<Table> {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    let spreadsheet_error = match extension.as_deref() {
        Some(ext) if SPREADSHEET_EXTENSIONS.contains(&ext) => match from_excel(bytes) {
            Ok(table) => return Ok(table),
            Err(e) => Some(e),
        },
        _ => None,
    };

    from_delimited(bytes).map_err(|text_error| FlashError::Ingest {
        file: name.to_string(),
        reason: match spreadsheet_error {
            Some(sheet_error) => format!(
                "not a readable workbook ({}) nor delimited text ({})",
                sheet_error, text_error
            ),
            None => text_error,
        },
    })
}

/// Read a file from disk and load it with `load_table`.
pub fn load_path(path: impl AsRef<Path>) -> Result<(String, Table)> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FlashError::InvalidInput(format!("{} has no file name", path.display())))?
        .to_string();
    let bytes = std::fs::read(path)?;
    let table = load_table(&name, &bytes)?;
    Ok((name, table))
}

/// Ingest a batch of uploads into the registry.
///
/// Names already registered are skipped without being parsed. A file that
/// cannot be read is reported and the rest of the batch continues.
pub fn ingest(registry: &mut Registry, uploads: &[Upload]) -> IngestReport {
    let mut report = IngestReport::default();
    for upload in uploads {
        if registry.contains(&upload.name) {
            report.skipped.push(upload.name.clone());
            continue;
        }
        match load_table(&upload.name, &upload.bytes) {
            Ok(table) => {
                info!(
                    "ingested {} ({} rows x {} columns)",
                    upload.name,
                    table.height(),
                    table.width()
                );
                registry.insert(upload.name.clone(), table);
                report.added.push(upload.name.clone());
            }
            Err(e) => {
                warn!("ingestion failed: {}", e);
                report.failures.push(e);
            }
        }
    }
    report
}

// Pick the candidate delimiter that splits the header into the most fields
fn sniff_delimiter(header: &str) -> char {
    let mut best = ',';
    let mut best_count = 0;
    for &d in DELIMITERS {
        let count = count_unquoted(header, d);
        if count > best_count {
            best = d;
            best_count = count;
        }
    }
    best
}

// A quote only opens a quoted field at the start of a field
fn count_unquoted(line: &str, delimiter: char) -> usize {
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut count = 0;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            continue;
        }
        if c == '"' && at_field_start {
            in_quotes = true;
        } else if c == delimiter {
            count += 1;
            at_field_start = true;
            continue;
        }
        at_field_start = false;
    }
    count
}

// Split the whole text into records of fields
fn parse_records(text: &str, delimiter: char) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut current_field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    // Double quote inside quoted field - add a single quote
                    current_field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current_field.push(c);
            }
            continue;
        }

        match c {
            // a quote inside an unquoted field is kept as text
            '"' if current_field.is_empty() => {
                in_quotes = true;
                field_started = true;
            }
            '\r' => {}
            '\n' => {
                if field_started || !record.is_empty() || !current_field.is_empty() {
                    record.push(std::mem::take(&mut current_field));
                    if !record.iter().all(|f| f.trim().is_empty()) {
                        records.push(std::mem::take(&mut record));
                    } else {
                        record.clear();
                    }
                }
                field_started = false;
            }
            c if c == delimiter => {
                record.push(std::mem::take(&mut current_field));
                field_started = true;
            }
            _ => {
                current_field.push(c);
                field_started = true;
            }
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if field_started || !record.is_empty() || !current_field.is_empty() {
        record.push(current_field);
        if !record.iter().all(|f| f.trim().is_empty()) {
            records.push(record);
        }
    }

    Ok(records)
}
