use crate::cell::Value;
use crate::error::{FlashError, Result};
use crate::table::Table;

/// Convert a table to CSV format
///
/// The first line holds the column names; every following line is one row.
/// Nulls become empty fields and text that could be mistaken for a
/// delimiter or quote is quoted, so the output reads back through
/// `loader::from_delimited` with the same values.
///
/// # Arguments
/// * `table` - Reference to the table to convert
///
/// # Returns
/// * `String` - CSV content
///
/// # Examples
/// ```
/// use flashdash::downloader::to_csv;
/// use flashdash::loader::from_delimited;
///
/// let table = from_delimited(b"city,temp\nOslo,4.5\n").unwrap();
/// assert_eq!(to_csv(&table), "city,temp\nOslo,4.5\n");
/// ```
pub fn to_csv(table: &Table) -> String {
    let mut csv_content = String::new();

    // Add header row
    let header: Vec<String> = table
        .columns()
        .iter()
        .map(|c| Value::Text(c.clone()).to_csv_field())
        .collect();
    csv_content.push_str(&header.join(","));
    csv_content.push('\n');

    // Add data rows
    for row in table.rows() {
        let fields: Vec<String> = row.iter().map(Value::to_csv_field).collect();
        csv_content.push_str(&fields.join(","));
        csv_content.push('\n');
    }

    csv_content
}

/// Convert a table to XLSX format
///
/// Writes one worksheet with the column names in the first row. Numbers and
/// booleans keep their cell types, nulls are left blank.
///
/// # Arguments
/// * `table` - Reference to the table to convert
///
/// # Returns
/// * `Result<Vec<u8>>` - XLSX file content as bytes or an export error
pub fn to_xlsx(table: &Table) -> Result<Vec<u8>> {
    use rust_xlsxwriter::{Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();

    write_table(&mut worksheet, table).map_err(|e| FlashError::Export(e.to_string()))?;

    workbook.push_worksheet(worksheet);
    let buffer = workbook
        .save_to_buffer()
        .map_err(|e| FlashError::Export(e.to_string()))?;

    Ok(buffer)
}

fn write_table(
    worksheet: &mut rust_xlsxwriter::Worksheet,
    table: &Table,
) -> std::result::Result<(), rust_xlsxwriter::XlsxError> {
    for (c, name) in table.columns().iter().enumerate() {
        worksheet.write_string(0, c as u16, name)?;
    }

    for (r, row) in table.rows().iter().enumerate() {
        let xr = (r + 1) as u32;
        for (c, value) in row.iter().enumerate() {
            let xc = c as u16;
            match value {
                Value::Null => {}
                Value::Int(i) => {
                    worksheet.write_number(xr, xc, *i as f64)?;
                }
                Value::Float(f) => {
                    worksheet.write_number(xr, xc, *f)?;
                }
                Value::Bool(b) => {
                    worksheet.write_boolean(xr, xc, *b)?;
                }
                Value::Text(s) => {
                    worksheet.write_string(xr, xc, s)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{from_delimited, from_excel};

    #[test]
    fn csv_reads_back_unchanged() {
        let table = Table::from_rows(
            vec!["name".into(), "notes".into(), "score".into()],
            vec![
                vec![Value::Text("a;b".into()), Value::Text("say \"hi\"".into()), Value::Float(1.0)],
                vec![Value::Text("c".into()), Value::Null, Value::Int(3)],
            ],
        )
        .unwrap();
        let back = from_delimited(to_csv(&table).as_bytes()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn deduplicated_headers_survive_export() {
        let table = from_delimited(b"a.1,a,a\n1,2,3\n").unwrap();
        let back = from_delimited(to_csv(&table).as_bytes()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn header_with_delimiter_is_quoted() {
        let table = Table::new(vec!["a|b".into(), "c".into()]);
        assert_eq!(to_csv(&table), "\"a|b\",c\n");
    }

    #[test]
    fn xlsx_export_opens_in_calamine() {
        let table = from_delimited(b"city,temp,wet\nOslo,4.5,true\nRome,,false\n").unwrap();
        let bytes = to_xlsx(&table).unwrap();
        let back = from_excel(&bytes).unwrap();
        assert_eq!(back.columns(), table.columns());
        assert_eq!(back.rows()[0][0], Value::Text("Oslo".into()));
        assert_eq!(back.rows()[0][1], Value::Float(4.5));
        assert_eq!(back.rows()[0][2], Value::Bool(true));
        assert_eq!(back.rows()[1][1], Value::Null);
    }
}
