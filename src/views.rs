//! Views derived from the registry on every run: the combined table and the
//! per-dataset variable names handed to snippets.

use crate::cell::Value;
use crate::table::{Registry, SOURCE_COLUMN, Table};
use std::path::Path;

/// Stack every dataset into one table tagged with its origin.
///
/// Columns are the union of all dataset columns in first-appearance order,
/// followed by `__source__`. Cells a dataset does not have are null.
/// Returns `None` for an empty registry.
pub fn build_combined(registry: &Registry) -> Option<Table> {
    if registry.is_empty() {
        return None;
    }

    let mut columns: Vec<String> = Vec::new();
    for dataset in registry.iter() {
        for c in dataset.table.columns() {
            if c != SOURCE_COLUMN && !columns.contains(c) {
                columns.push(c.clone());
            }
        }
    }

    let mut rows = Vec::new();
    for dataset in registry.iter() {
        let mapping: Vec<Option<usize>> = columns
            .iter()
            .map(|c| dataset.table.column_index(c))
            .collect();
        for row in dataset.table.rows() {
            let mut out: Vec<Value> = mapping
                .iter()
                .map(|idx| idx.map(|i| row[i].clone()).unwrap_or(Value::Null))
                .collect();
            out.push(Value::Text(dataset.name.clone()));
            rows.push(out);
        }
    }

    columns.push(SOURCE_COLUMN.to_string());
    Table::from_rows(columns, rows).ok()
}

/// Variable name a dataset is exposed under: `df_<stem>`, with every
/// character outside `[A-Za-z0-9_]` replaced by an underscore.
pub fn alias_for(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("df_{}", cleaned)
}

/// Alias/table pairs in registry order. When two filenames normalise to the
/// same alias both pairs are returned; binding them in order leaves the later
/// one visible.
pub fn aliases(registry: &Registry) -> Vec<(String, Table)> {
    registry
        .iter()
        .map(|d| (alias_for(&d.name), d.table.clone()))
        .collect()
}

/// Short description of the names available to a snippet.
pub fn hint(registry: &Registry) -> String {
    match registry.single() {
        Some(dataset) => format!(
            "Single file uploaded → use df or dfs[\"{}\"] (plus {} alias).",
            dataset.name,
            alias_for(&dataset.name)
        ),
        None => "Multiple files uploaded → use df_all, dfs[\"<filename>\"], or per-file variables df_<stem>.".to_string(),
    }
}
