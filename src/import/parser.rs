//! Delimited text -> ordered rows keyed by normalized header names.

use crate::import::validate::ValidationError;
use std::collections::{BTreeMap, HashSet};

/// One data row. `line` is the 1-based source line the row starts on, so a
/// header on line 1 puts the first data row on line 2 even when blank lines
/// were skipped in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: usize,
    values: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new(line: usize, values: BTreeMap<String, String>) -> Self {
        Self { line, values }
    }

    /// `None` when the file has no such column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    /// Trimmed value, `None` when the column is absent or the cell is blank.
    pub fn non_blank(&self, column: &str) -> Option<&str> {
        self.get(column).map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    /// Structural errors only (row 0). Non-empty means `rows` is empty.
    pub errors: Vec<ValidationError>,
}

impl ParsedTable {
    fn structural(message: impl Into<String>) -> Self {
        Self {
            headers: Vec::new(),
            rows: Vec::new(),
            errors: vec![ValidationError::structural(message)],
        }
    }

    pub fn is_structural_failure(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Trim, lowercase and collapse whitespace runs to `_`.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn parse_bytes(bytes: &[u8]) -> ParsedTable {
    match std::str::from_utf8(bytes) {
        Ok(text) => parse_table(text),
        Err(e) => ParsedTable::structural(format!(
            "File is not valid UTF-8 text (byte {})",
            e.valid_up_to()
        )),
    }
}

pub fn parse_table(text: &str) -> ParsedTable {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut headers: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => return ParsedTable::structural(format!("Could not read file: {}", e)),
        }
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(rows.len() + 2);

        let Some(header) = headers.as_ref() else {
            match read_header(&record) {
                Ok(h) => headers = Some(h),
                Err(message) => return ParsedTable::structural(message),
            }
            continue;
        };

        if record.len() > header.len() {
            let extra_has_data = record.iter().skip(header.len()).any(|f| !f.trim().is_empty());
            if extra_has_data {
                return ParsedTable::structural(format!(
                    "Line {} has {} cells but the header declares {} columns",
                    line,
                    record.len(),
                    header.len()
                ));
            }
        }

        let values = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), record.get(i).unwrap_or("").to_string()))
            .collect::<BTreeMap<_, _>>();
        rows.push(RawRow::new(line, values));
    }

    match headers {
        Some(headers) => ParsedTable {
            headers,
            rows,
            errors: Vec::new(),
        },
        None => ParsedTable::structural("File is empty: a header row is required"),
    }
}

fn read_header(record: &csv::StringRecord) -> Result<Vec<String>, String> {
    let mut names = record.iter().map(normalize_header).collect::<Vec<_>>();
    // Spreadsheet tools often leave trailing empty header cells.
    while names.last().map(|n| n.is_empty()).unwrap_or(false) {
        names.pop();
    }
    let mut seen = HashSet::new();
    for (i, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(format!("Header column {} has no name", i + 1));
        }
        if !seen.insert(name.as_str()) {
            return Err(format!("Header column '{}' appears more than once", name));
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_headers() {
        assert_eq!(normalize_header("  Date   Joined "), "date_joined");
        assert_eq!(normalize_header("date_joined"), "date_joined");
        assert_eq!(normalize_header("Employee\tNo"), "employee_no");
    }

    #[test]
    fn skips_blank_lines_but_keeps_line_numbers() {
        let t = parse_table("Employee No,First Name\nEMP001,Jane\n\n   ,  \nEMP002,John\n");
        assert!(t.errors.is_empty());
        assert_eq!(t.headers, vec!["employee_no", "first_name"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0].line, 2);
        assert_eq!(t.rows[1].line, 5);
        assert_eq!(t.rows[1].get("first_name"), Some("John"));
        assert_eq!(t.rows[1].get("email"), None);
    }

    #[test]
    fn quoted_cells_and_bom() {
        let t = parse_table("\u{feff}name,notes\r\n\"Doe, Jane\",\"said \"\"hi\"\"\"\r\n");
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0].get("name"), Some("Doe, Jane"));
        assert_eq!(t.rows[0].get("notes"), Some("said \"hi\""));
    }

    #[test]
    fn short_rows_are_padded_and_trailing_empty_cells_ignored() {
        let t = parse_table("a,b,c\n1\n4,5,6,,\n");
        assert!(t.errors.is_empty(), "{:?}", t.errors);
        assert_eq!(t.rows[0].get("c"), Some(""));
        assert_eq!(t.rows[0].non_blank("c"), None);
        assert_eq!(t.rows[1].get("c"), Some("6"));
    }

    #[test]
    fn structural_failures_are_row_zero_errors() {
        for input in ["", "\n\n", "a,,b\n1,2,3\n", "a,A\n1,2\n", "a,b\n1,2,3\n"] {
            let t = parse_table(input);
            assert_eq!(t.errors.len(), 1, "input {:?}", input);
            assert_eq!(t.errors[0].row, 0);
            assert!(t.rows.is_empty());
        }
        let t = parse_bytes(&[b'a', b'\n', 0xff, 0xfe]);
        assert!(t.is_structural_failure());
    }
}
