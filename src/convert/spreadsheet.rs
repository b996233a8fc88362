//! CSV to XML Spreadsheet 2003 conversion.
//!
//! The output is a single-worksheet SpreadsheetML workbook, which Excel and
//! LibreOffice open directly when served as `application/vnd.ms-excel`.
//! Cells that parse as finite numbers are typed `Number`; everything else is
//! a `String`.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::{ConvertError, Converter, FileSystem};

const WORKBOOK_HEADER: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
    "<?mso-application progid=\"Excel.Sheet\"?>\n",
    "<Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\"",
    " xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n",
);

/// Worksheet names are limited to 31 characters by Excel.
const MAX_SHEET_NAME: usize = 31;

/// Converts CSV files into XML spreadsheets.
#[derive(Clone)]
pub struct CsvConverter {
    fs: Arc<dyn FileSystem>,
    delimiter: u8,
}

impl CsvConverter {
    /// Creates a converter reading comma-separated sources through `fs`.
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs, delimiter: b',' }
    }

    /// Uses `delimiter` instead of a comma.
    #[must_use]
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn render(&self, sheet_name: &str, csv: &[u8]) -> Result<String, ConvertError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(csv);

        let mut xml = String::with_capacity(WORKBOOK_HEADER.len() + csv.len() * 3);
        xml.push_str(WORKBOOK_HEADER);
        xml.push_str(" <Worksheet ss:Name=\"");
        escape_into(&mut xml, sheet_name);
        xml.push_str("\">\n  <Table>\n");

        for record in reader.records() {
            let record = record?;
            xml.push_str("   <Row>");
            for field in record.iter() {
                push_cell(&mut xml, field);
            }
            xml.push_str("</Row>\n");
        }

        xml.push_str("  </Table>\n </Worksheet>\n</Workbook>\n");
        Ok(xml)
    }
}

impl Converter for CsvConverter {
    fn convert(&self, source: &Path) -> Result<Bytes, ConvertError> {
        let csv = self
            .fs
            .read_bytes(source)
            .map_err(|source_err| ConvertError::Io {
                path: source.to_owned(),
                source: source_err,
            })?;

        let xml = self.render(&sheet_name(source), &csv)?;
        debug!(
            source = %source.display(),
            input_bytes = csv.len(),
            output_bytes = xml.len(),
            "converted csv"
        );
        Ok(Bytes::from(xml))
    }
}

fn sheet_name(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();

    let name: String = stem
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(MAX_SHEET_NAME)
        .collect();

    if name.trim().is_empty() {
        "Sheet1".to_owned()
    } else {
        name
    }
}

fn push_cell(xml: &mut String, field: &str) {
    let trimmed = field.trim();
    let is_number = !trimmed.is_empty() && trimmed.parse::<f64>().is_ok_and(f64::is_finite);

    if is_number {
        // Writing to a String cannot fail.
        let _ = write!(xml, "<Cell><Data ss:Type=\"Number\">{trimmed}</Data></Cell>");
    } else {
        xml.push_str("<Cell><Data ss:Type=\"String\">");
        escape_into(xml, field);
        xml.push_str("</Data></Cell>");
    }
}

/// Escapes XML markup and drops characters XML 1.0 cannot carry.
fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
}
