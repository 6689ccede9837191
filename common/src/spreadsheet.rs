//! Reading task spreadsheets (xlsx or CSV) and writing result tables as CSV.

use anyhow::{Context, Result, anyhow, bail};
use calamine::{Data, Reader, open_workbook_auto};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

/// One spreadsheet row keyed by header. Blank cells are left out.
pub type Row = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // whole numbers come back as floats
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.0}"),
        other => other.to_string(),
    }
}

fn build_row(headers: &[String], cells: impl Iterator<Item = String>) -> Row {
    headers
        .iter()
        .zip(cells)
        .filter(|(header, value)| !header.is_empty() && !value.trim().is_empty())
        .map(|(header, value)| (header.clone(), value))
        .collect()
}

/// Read a sheet from an xlsx/xls/ods workbook by name.
///
/// # Errors
///
/// Returns an error if the workbook cannot be opened or the sheet is missing.
pub fn read_workbook(path: &Path, sheet_name: &str) -> Result<Sheet> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;
    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|e| anyhow!("Failed to read sheet '{sheet_name}': {e}"))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Sheet::default());
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|c| cell_to_string(c).trim().to_string())
        .collect();
    let rows = rows
        .map(|cells| build_row(&headers, cells.iter().map(cell_to_string)))
        .collect();

    Ok(Sheet { headers, rows })
}

/// Read a CSV table with a header row.
///
/// # Errors
///
/// Returns an error if the CSV is malformed.
pub fn read_csv<R: Read>(reader: R) -> Result<Sheet> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read CSV record")?;
        rows.push(build_row(&headers, record.iter().map(str::to_string)));
    }
    Ok(Sheet { headers, rows })
}

/// Read a task table, choosing the format from the file extension.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_sheet(path: &Path, sheet_name: &str) -> Result<Sheet> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path, sheet_name),
        "csv" => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            read_csv(file)
        }
        other => bail!("Unsupported spreadsheet extension '{other}'"),
    }
}

/// Write rows as CSV with the given columns, leaving missing cells blank.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_csv<W: Write>(writer: W, columns: &[&str], rows: &[Row]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(
            columns
                .iter()
                .map(|c| row.get(*c).map_or("", String::as_str)),
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Write rows to a CSV file, replacing it.
///
/// # Errors
///
/// Returns an error if the file cannot be created.
pub fn save_csv(path: &Path, columns: &[&str], rows: &[Row]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_csv(file, columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_csv_skips_blank_cells() {
        let data = "Job,Task,Question,model1\nNurse,Triage,<p>q</p>,\nNurse,Triage,  ,<p>a</p>\n";
        let sheet = read_csv(data.as_bytes()).unwrap();
        assert_eq!(sheet.headers, vec!["Job", "Task", "Question", "model1"]);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0]["Question"], "<p>q</p>");
        assert!(!sheet.rows[0].contains_key("model1"));
        assert!(!sheet.rows[1].contains_key("Question"));
    }

    #[test]
    fn test_cell_to_string() {
        assert_eq!(cell_to_string(&Data::Float(3.0)), "3");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::Empty), "");
        assert_eq!(cell_to_string(&Data::String("x".into())), "x");
    }

    #[test]
    fn test_csv_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let row: Row = [("task_id".to_string(), "task_001_01_1".to_string())]
            .into_iter()
            .collect();
        save_csv(&path, &["task_id", "model1"], &[row]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "task_id,model1\ntask_001_01_1,\n");

        let sheet = read_sheet(&path, "Sheet1").unwrap();
        assert_eq!(sheet.rows[0]["task_id"], "task_001_01_1");
    }

    #[test]
    fn test_unknown_extension() {
        assert!(read_sheet(Path::new("tasks.txt"), "Sheet1").is_err());
    }
}
