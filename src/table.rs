use crate::cell::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Reserved column added by the combined view to tag each row's origin.
pub const SOURCE_COLUMN: &str = "__source__";

/// Rows of values under named columns.
///
/// Every row is exactly as wide as the header; constructors and
/// `push_row` enforce it.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create an empty table. Header names are cleaned up the way
    /// spreadsheet users expect: blanks become `Unnamed: <i>` and repeats get
    /// a `.1`, `.2`, ... suffix.
    pub fn new(columns: Vec<String>) -> Self {
        Table {
            columns: normalize_headers(columns),
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, String> {
        let mut table = Table::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Append a row. Short rows are padded with nulls, long rows are rejected.
    pub fn push_row(&mut self, mut row: Vec<Value>) -> Result<(), String> {
        if row.len() > self.columns.len() {
            return Err(format!(
                "row {} has {} fields, header has {}",
                self.rows.len() + 1,
                row.len(),
                self.columns.len()
            ));
        }
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn require_column(&self, name: &str) -> Result<usize, String> {
        self.column_index(name)
            .ok_or_else(|| format!("no column named '{}'", name))
    }

    pub fn column(&self, name: &str) -> Result<Vec<Value>, String> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| r[idx].clone()).collect())
    }

    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    pub fn select(&self, names: &[String]) -> Result<Table, String> {
        let indices = names
            .iter()
            .map(|n| self.require_column(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table {
            columns: names.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// Keep the rows whose `name` column equals `value`.
    pub fn filter_eq(&self, name: &str, value: &Value) -> Result<Table, String> {
        let idx = self.require_column(name)?;
        Ok(Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| values_equal(&r[idx], value))
                .cloned()
                .collect(),
        })
    }

    /// Stable sort on one column.
    pub fn sort_by(&self, name: &str, descending: bool) -> Result<Table, String> {
        let idx = self.require_column(name)?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            let ord = a[idx].compare(&b[idx]);
            if descending { ord.reverse() } else { ord }
        });
        Ok(Table {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Distinct values of a column in first-seen order.
    pub fn unique(&self, name: &str) -> Result<Vec<Value>, String> {
        let idx = self.require_column(name)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in &self.rows {
            let v = &row[idx];
            if seen.insert(v.to_csv_field()) {
                out.push(v.clone());
            }
        }
        Ok(out)
    }

    /// Numeric cells of a column; text and nulls are skipped.
    pub fn numeric(&self, name: &str) -> Result<Vec<f64>, String> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().filter_map(|r| r[idx].as_f64()).collect())
    }

    pub fn sum(&self, name: &str) -> Result<f64, String> {
        Ok(self.numeric(name)?.iter().sum())
    }

    pub fn mean(&self, name: &str) -> Result<f64, String> {
        let values = self.numeric(name)?;
        if values.is_empty() {
            return Ok(f64::NAN);
        }
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub fn min(&self, name: &str) -> Result<f64, String> {
        Ok(self
            .numeric(name)?
            .into_iter()
            .fold(f64::NAN, |acc, v| if acc.is_nan() || v < acc { v } else { acc }))
    }

    pub fn max(&self, name: &str) -> Result<f64, String> {
        Ok(self
            .numeric(name)?
            .into_iter()
            .fold(f64::NAN, |acc, v| if acc.is_nan() || v > acc { v } else { acc }))
    }

    /// Sum `value` per distinct `by`, groups in first-seen order.
    pub fn group_sum(&self, by: &str, value: &str) -> Result<Table, String> {
        let key_idx = self.require_column(by)?;
        let val_idx = self.require_column(value)?;

        let mut order: Vec<Value> = Vec::new();
        let mut totals: HashMap<String, f64> = HashMap::new();
        for row in &self.rows {
            let key = row[key_idx].to_csv_field();
            let entry = totals.entry(key).or_insert_with(|| {
                order.push(row[key_idx].clone());
                0.0
            });
            *entry += row[val_idx].as_f64().unwrap_or(0.0);
        }

        let rows = order
            .into_iter()
            .map(|k| {
                let total = totals[&k.to_csv_field()];
                vec![k, Value::Float(total)]
            })
            .collect();
        Ok(Table {
            columns: vec![by.to_string(), value.to_string()],
            rows,
        })
    }

    /// Fixed-width text preview of the first `max_rows` rows.
    pub fn render(&self, max_rows: usize) -> String {
        let shown: Vec<&Vec<Value>> = self.rows.iter().take(max_rows).collect();
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &shown {
            for (i, v) in row.iter().enumerate() {
                widths[i] = widths[i].max(v.to_string().chars().count());
            }
        }

        let mut out = String::new();
        for (i, c) in self.columns.iter().enumerate() {
            out.push_str(&format!("{:<width$}  ", c, width = widths[i]));
        }
        out = out.trim_end().to_string();
        out.push('\n');
        for row in shown {
            let mut line = String::new();
            for (i, v) in row.iter().enumerate() {
                line.push_str(&format!("{:<width$}  ", v.to_string(), width = widths[i]));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        if self.rows.len() > max_rows {
            out.push_str(&format!("... {} more rows\n", self.rows.len() - max_rows));
        }
        out
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, name)| {
            let name = name.trim().to_string();
            let base = if name.is_empty() {
                format!("Unnamed: {}", i)
            } else {
                name
            };
            let mut out = base.clone();
            // suffixes skip over names already taken, including real headers
            while used.contains(&out) {
                let seen = counts.entry(base.clone()).or_insert(0);
                *seen += 1;
                out = format!("{}.{}", base, seen);
            }
            used.insert(out.clone());
            out
        })
        .collect()
}

/// One ingested file.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub table: Table,
}

/// The live, insertion-ordered collection of datasets for a session.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Registry {
    datasets: Vec<Dataset>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.datasets.iter().any(|d| d.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.datasets.iter().find(|d| d.name == name).map(|d| &d.table)
    }

    /// Register a table. Returns false and leaves the registry untouched
    /// when the name is already present.
    pub fn insert(&mut self, name: impl Into<String>, table: Table) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.datasets.push(Dataset { name, table });
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Table> {
        let idx = self.datasets.iter().position(|d| d.name == name)?;
        Some(self.datasets.remove(idx).table)
    }

    /// Drop every dataset whose name is not in `keep`; returns the dropped names.
    pub fn retain_names(&mut self, keep: &HashSet<String>) -> Vec<String> {
        let removed: Vec<String> = self
            .datasets
            .iter()
            .filter(|d| !keep.contains(&d.name))
            .map(|d| d.name.clone())
            .collect();
        self.datasets.retain(|d| keep.contains(&d.name));
        removed
    }

    pub fn clear(&mut self) {
        self.datasets.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.name.clone()).collect()
    }

    /// The single dataset, when exactly one is registered.
    pub fn single(&self) -> Option<&Dataset> {
        if self.datasets.len() == 1 {
            self.datasets.first()
        } else {
            None
        }
    }
}
