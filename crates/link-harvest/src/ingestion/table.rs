//! Tabular upload parsing (CSV and XLSX) into an input batch

use crate::error::{Error, Result};
use crate::types::{InputBatch, InputRecord};

/// Supported upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    #[cfg(feature = "xlsx")]
    Xlsx,
}

impl TableFormat {
    /// Detect the format from the upload's file name; anything unknown is read as CSV
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
        match ext.as_str() {
            #[cfg(feature = "xlsx")]
            "xlsx" | "xls" | "xlsm" | "ods" => TableFormat::Xlsx,
            _ => TableFormat::Csv,
        }
    }
}

/// Parse an uploaded table and validate that it carries the key column
pub fn read_table(filename: &str, data: &[u8], key_column: &str) -> Result<InputBatch> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::validation("Uploaded file is empty"));
    }

    let (headers, rows) = match TableFormat::from_filename(filename) {
        TableFormat::Csv => read_csv(data)?,
        #[cfg(feature = "xlsx")]
        TableFormat::Xlsx => read_xlsx(data)?,
    };

    build_batch(headers, rows, key_column)
}

fn read_csv(data: &[u8]) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(data);

    let headers = reader
        .headers()
        .map_err(|e| Error::validation(format!("Invalid CSV file: {}", e)))?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| Error::validation(format!("Invalid CSV file: {}", e)))?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }

    Ok((headers, rows))
}

#[cfg(feature = "xlsx")]
fn read_xlsx(data: &[u8]) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    use calamine::Reader;

    let cursor = std::io::Cursor::new(data);
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
        .map_err(|e| Error::validation(format!("Invalid spreadsheet: {}", e)))?;

    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| Error::validation("Spreadsheet has no sheets"))?;

    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| Error::validation(format!("Failed to read sheet '{}': {}", sheet, e)))?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect::<Vec<String>>());

    let headers = rows
        .next()
        .ok_or_else(|| Error::validation("Spreadsheet has no header row"))?
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    Ok((headers, rows.collect()))
}

/// Locate the key column (case-insensitive) and turn rows into records
fn build_batch(
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    key_column: &str,
) -> Result<InputBatch> {
    if headers.iter().all(|h| h.is_empty()) {
        return Err(Error::validation("Uploaded file has no header row"));
    }

    let wanted = key_column.trim();
    let key_index = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| {
            Error::validation(format!(
                "Invalid file format. The file must contain a '{}' column.",
                wanted
            ))
        })?;

    let records = rows
        .into_iter()
        // Skip fully blank lines (common trailing noise in exported sheets)
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
        .map(|row| {
            let key = row.get(key_index).map(|k| k.trim().to_string()).unwrap_or_default();
            let mut record = InputRecord::new(key);
            for (i, header) in headers.iter().enumerate() {
                if i == key_index || header.is_empty() {
                    continue;
                }
                if let Some(value) = row.get(i) {
                    record.fields.insert(header.clone(), value.clone());
                }
            }
            record
        })
        .collect();

    Ok(InputBatch::new(headers[key_index].clone(), records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_csv_keeps_order_and_fields() {
        let csv = b"Company,Domain\nAcme,acme.com\nGlobex,globex.io\n,\nInitech,initech.net\n";
        let batch = read_table("domains.csv", csv, "domain").unwrap();

        assert_eq!(batch.key_column, "Domain");
        let keys: Vec<&str> = batch.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["acme.com", "globex.io", "initech.net"]);
        assert_eq!(batch.records[1].fields["Company"], "Globex");
    }

    #[test]
    fn test_blank_key_is_kept() {
        let csv = b"domain,note\n,only a note\nacme.com,\n";
        let batch = read_table("domains.csv", csv, "domain").unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].key, "");
    }

    #[test]
    fn test_missing_key_column_is_rejected() {
        let csv = b"website\nacme.com\n";
        let err = read_table("domains.csv", csv, "domain").unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("'domain'")));
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        assert!(matches!(
            read_table("domains.csv", b"", "domain"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            read_table("domains.csv", b"  \n", "domain"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_header_only_gives_empty_batch() {
        let batch = read_table("domains.csv", b"domain\n", "domain").unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(TableFormat::from_filename("a.csv"), TableFormat::Csv);
        assert_eq!(TableFormat::from_filename("noext"), TableFormat::Csv);
        #[cfg(feature = "xlsx")]
        assert_eq!(TableFormat::from_filename("Report.XLSX"), TableFormat::Xlsx);
    }
}
