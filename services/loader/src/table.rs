//! In-memory batch of raw records plus the generic readers that build one
//! from a JSON, CSV or Excel payload.
//!
//! Readers are deterministic: same bytes, same table. Column names and string
//! cells are trimmed on the way in.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use serde_json::Value;

use crate::error::{EtlError, EtlResult};
use crate::value::{sanitize_f64, Row, NULL};

/// Where the record list lives inside a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPath {
    /// The payload itself is the array of records.
    Root,
    /// Dotted path to the array, e.g. `"data"` for Socrata exports.
    Field(String),
}

impl Default for DataPath {
    fn default() -> Self {
        DataPath::Field("data".to_string())
    }
}

/// A batch of raw records. `index` keeps each row's position in the
/// original payload so errors can point back at it after filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
    index: Vec<usize>,
}

impl Table {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns = Vec::new();
        let mut seen = HashSet::new();
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(key, value)| {
                        let key = key.trim().to_string();
                        if seen.insert(key.clone()) {
                            columns.push(key.clone());
                        }
                        let value = match value {
                            Value::String(s) => Value::String(s.trim().to_string()),
                            other => other,
                        };
                        (key, value)
                    })
                    .collect()
            })
            .collect();
        let index = (0..rows.len()).collect();
        Self {
            columns,
            rows,
            index,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of row `i` in the original payload.
    pub fn original_index(&self, i: usize) -> usize {
        self.index.get(i).copied().unwrap_or(i)
    }

    /// Iterate rows together with their original positions.
    pub fn indexed_rows(&self) -> impl Iterator<Item = (usize, &Row)> {
        self.index.iter().copied().zip(self.rows.iter())
    }

    /// Every cell of a column, null where a row lacks the key.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().map(move |row| row.get(name).unwrap_or(&NULL))
    }

    pub(crate) fn add_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    /// Keep rows whose mask entry is `true`, preserving original positions.
    pub(crate) fn retain_mask(&mut self, keep: &[bool]) {
        let rows = std::mem::take(&mut self.rows);
        let index = std::mem::take(&mut self.index);
        for ((row, idx), keep) in rows.into_iter().zip(index).zip(keep.iter().copied()) {
            if keep {
                self.rows.push(row);
                self.index.push(idx);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    /// Pick a reader from the file extension.
    pub fn from_bytes(name: &str, bytes: &[u8], data_path: &DataPath) -> EtlResult<Self> {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "json" => Self::from_json_bytes(bytes, data_path),
            "csv" | "txt" => Self::from_csv(bytes),
            "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => Self::from_excel(bytes),
            other => Err(EtlError::payload(format!(
                "unsupported file type '{other}' for {name}"
            ))),
        }
    }

    pub fn from_json_bytes(bytes: &[u8], data_path: &DataPath) -> EtlResult<Self> {
        let payload: Value = serde_json::from_slice(bytes)?;
        Self::from_json(&payload, data_path)
    }

    pub fn from_json(payload: &Value, data_path: &DataPath) -> EtlResult<Self> {
        let records = match data_path {
            DataPath::Root => payload,
            DataPath::Field(path) => path
                .split('.')
                .try_fold(payload, |node, key| node.get(key))
                .ok_or_else(|| {
                    EtlError::payload(format!("JSON structure has no '{path}' record list"))
                })?,
        };
        let items = records
            .as_array()
            .ok_or_else(|| EtlError::payload("record list is not a JSON array"))?;

        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item {
                Value::Object(map) => rows.push(map.clone()),
                _ => {
                    return Err(EtlError::payload(format!(
                        "record {i} is not a JSON object"
                    )))
                }
            }
        }
        Ok(Self::from_rows(rows))
    }

    /// CSV with a header row. Accepts UTF-8 (with or without BOM) or
    /// Windows-1252, and `;` as delimiter when the header uses it.
    pub fn from_csv(bytes: &[u8]) -> EtlResult<Self> {
        let text = decode_text(bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

        let header = text.lines().next().unwrap_or("");
        let delimiter = if header.matches(';').count() > header.matches(',').count() {
            b';'
        } else {
            b','
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row: Row = headers
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    let value = match record.get(i) {
                        Some(s) if !s.is_empty() => Value::String(s.to_string()),
                        _ => Value::Null,
                    };
                    (h.clone(), value)
                })
                .collect();
            rows.push(row);
        }
        Ok(Self::from_rows(rows))
    }

    /// First sheet of a workbook, first row as header. Blank header cells
    /// get positional names (`col_3`) so no data is dropped silently.
    pub fn from_excel(bytes: &[u8]) -> EtlResult<Self> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| EtlError::payload("workbook has no sheets"))?;
        let range = workbook.worksheet_range(&sheet_name)?;

        let mut lines = range.rows();
        let headers: Vec<String> = match lines.next() {
            Some(cells) => cells
                .iter()
                .enumerate()
                .map(|(i, cell)| match cell {
                    Data::Empty => format!("col_{i}"),
                    other => other.to_string().trim().to_string(),
                })
                .collect(),
            None => return Ok(Self::default()),
        };

        let rows = lines
            .filter(|cells| cells.iter().any(|c| !matches!(c, Data::Empty)))
            .map(|cells| {
                headers
                    .iter()
                    .zip(cells.iter())
                    .map(|(h, cell)| (h.clone(), cell_value(cell)))
                    .collect::<Row>()
            })
            .collect();
        Ok(Self::from_rows(rows))
    }
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::String(s) => Value::String(s.trim().to_string()),
        Data::Float(f) => sanitize_f64(*f),
        Data::Int(i) => Value::from(*i),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -------------------------------------------------------------------------
    // JSON
    // -------------------------------------------------------------------------

    #[test]
    fn test_json_socrata_data_key() {
        let payload = json!({"data": [{"mes": "1", "a_o": "2024"}, {"mes": "2", "a_o": "2024"}]});
        let table = Table::from_json(&payload, &DataPath::default()).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.has_column("mes"));
        assert!(table.has_column("a_o"));
    }

    #[test]
    fn test_json_root_array() {
        let payload = json!([{"campo": "RUBIALES"}]);
        let table = Table::from_json(&payload, &DataPath::Root).unwrap();
        assert_eq!(table.rows()[0]["campo"], "RUBIALES");
    }

    #[test]
    fn test_json_dotted_path() {
        let payload = json!({"result": {"records": [{"x": 1}]}});
        let path = DataPath::Field("result.records".to_string());
        let table = Table::from_json(&payload, &path).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_json_missing_path_fails() {
        let payload = json!({"rows": []});
        let result = Table::from_json(&payload, &DataPath::default());
        assert!(matches!(result, Err(EtlError::Payload(_))));
    }

    #[test]
    fn test_json_non_object_record_fails() {
        let payload = json!({"data": [1, 2]});
        assert!(Table::from_json(&payload, &DataPath::default()).is_err());
    }

    #[test]
    fn test_columns_are_union_and_trimmed() {
        let payload = json!({"data": [{" mes ": " 1 "}, {"campo": "X"}]});
        let table = Table::from_json(&payload, &DataPath::default()).unwrap();
        assert_eq!(table.columns(), &["mes".to_string(), "campo".to_string()]);
        assert_eq!(table.rows()[0]["mes"], "1");
        let campos: Vec<&Value> = table.column("campo").collect();
        assert_eq!(campos, vec![&Value::Null, &json!("X")]);
    }

    // -------------------------------------------------------------------------
    // CSV
    // -------------------------------------------------------------------------

    #[test]
    fn test_csv_comma() {
        let csv = "mes,a_o,precio\n1,2024,10\n2,2024,\n";
        let table = Table::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0]["precio"], "10");
        assert_eq!(table.rows()[1]["precio"], Value::Null);
    }

    #[test]
    fn test_csv_semicolon_with_bom() {
        let csv = "\u{feff}Partida;Monto Pesos\n01;100000\n";
        let table = Table::from_csv(csv.as_bytes()).unwrap();
        assert!(table.has_column("Partida"));
        assert_eq!(table.rows()[0]["Monto Pesos"], "100000");
    }

    #[test]
    fn test_csv_windows_1252() {
        // "Bogotá" encoded as Windows-1252
        let bytes = b"departamento\nBogot\xe1\n";
        let table = Table::from_csv(bytes).unwrap();
        assert_eq!(table.rows()[0]["departamento"], "Bogotá");
    }

    #[test]
    fn test_from_bytes_rejects_unknown_extension() {
        let result = Table::from_bytes("raw.pdf", b"%PDF", &DataPath::default());
        assert!(matches!(result, Err(EtlError::Payload(_))));
    }

    // -------------------------------------------------------------------------
    // Filtering
    // -------------------------------------------------------------------------

    #[test]
    fn test_retain_mask_keeps_original_positions() {
        let payload = json!([{"a": 1}, {"a": 2}, {"a": 3}]);
        let mut table = Table::from_json(&payload, &DataPath::Root).unwrap();
        table.retain_mask(&[true, false, true]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.original_index(0), 0);
        assert_eq!(table.original_index(1), 2);
        let positions: Vec<usize> = table.indexed_rows().map(|(i, _)| i).collect();
        assert_eq!(positions, vec![0, 2]);
    }
}
