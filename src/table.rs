//! In-memory tabular data shared by the refinement job and the reporting layer.
//!
//! Raw CSV files load as text cells; query results arrive typed from the
//! engine's column metadata. Aggregations in [`crate::report`] work on both.

use std::fmt;
use std::io::Read;

use serde::Serialize;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view; text cells are parsed so raw CSV columns work too.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            Value::Text(text) => text.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Parses a text cell into the representation of `column_type`.
    /// Empty or unparsable cells become null.
    pub fn parse_as(raw: &str, column_type: ColumnType) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        match column_type {
            ColumnType::Int64 => trimmed.parse().map(Value::Int).unwrap_or(Value::Null),
            ColumnType::Float64 => trimmed.parse().map(Value::Float).unwrap_or(Value::Null),
            ColumnType::Utf8 => Value::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NaN"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(text) => write!(f, "{text}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    /// Narrowest type that every non-empty cell parses as.
    pub fn infer<'a, I>(cells: I) -> ColumnType
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut inferred = None;
        for cell in cells {
            if cell.trim().is_empty() {
                continue;
            }
            let next = widen(inferred.unwrap_or(ColumnType::Int64), cell);
            if next == ColumnType::Utf8 {
                return next;
            }
            inferred = Some(next);
        }
        inferred.unwrap_or(ColumnType::Utf8)
    }

    /// Same as [`ColumnType::infer`] over already-loaded cells.
    pub fn infer_values<'a, I>(values: I) -> ColumnType
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut inferred = None;
        for value in values {
            let current = inferred.unwrap_or(ColumnType::Int64);
            let next = match value {
                Value::Null => continue,
                Value::Text(text) if text.trim().is_empty() => continue,
                Value::Text(text) => widen(current, text),
                Value::Int(_) => current,
                Value::Float(_) if current == ColumnType::Int64 => ColumnType::Float64,
                Value::Float(_) => current,
            };
            if next == ColumnType::Utf8 {
                return next;
            }
            inferred = Some(next);
        }
        inferred.unwrap_or(ColumnType::Utf8)
    }

    /// Maps a SQL engine type name such as `bigint` or `varchar`.
    pub fn from_sql_type(name: &str) -> ColumnType {
        match name.trim().to_ascii_lowercase().as_str() {
            "tinyint" | "smallint" | "integer" | "int" | "bigint" => ColumnType::Int64,
            "double" | "float" | "real" => ColumnType::Float64,
            other if other.starts_with("decimal") => ColumnType::Float64,
            _ => ColumnType::Utf8,
        }
    }
}

fn widen(current: ColumnType, cell: &str) -> ColumnType {
    let cell = cell.trim();
    let is_float = || cell.parse::<f64>().map(f64::is_finite).unwrap_or(false);
    match current {
        ColumnType::Int64 if cell.parse::<i64>().is_ok() => ColumnType::Int64,
        ColumnType::Int64 | ColumnType::Float64 if is_float() => ColumnType::Float64,
        _ => ColumnType::Utf8,
    }
}

/// Counters from loading a delimited file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub rows: usize,
    pub padded_rows: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, PipelineError> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Reads a header row plus records. Short records are padded with nulls,
    /// records with more fields than the header are dropped and counted.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<(Self, LoadStats), PipelineError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader
            .headers()
            .map_err(|err| PipelineError::Schema(format!("unreadable header row: {err}")))?
            .iter()
            .map(|name| name.trim().to_string())
            .collect::<Vec<_>>();
        if headers.is_empty() || headers.iter().all(String::is_empty) {
            return Err(PipelineError::Schema("missing header row".to_string()));
        }

        let width = headers.len();
        let mut table = Self::new(headers);
        let mut stats = LoadStats::default();
        for record in csv_reader.records() {
            let record =
                record.map_err(|err| PipelineError::Schema(format!("malformed record: {err}")))?;
            if record.len() > width {
                stats.skipped_rows += 1;
                continue;
            }
            if record.len() < width {
                stats.padded_rows += 1;
            }
            let mut row = record
                .iter()
                .map(|cell| {
                    if cell.trim().is_empty() {
                        Value::Null
                    } else {
                        Value::Text(cell.to_string())
                    }
                })
                .collect::<Vec<_>>();
            row.resize(width, Value::Null);
            table.rows.push(row);
            stats.rows += 1;
        }
        Ok((table, stats))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), PipelineError> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::Schema(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, PipelineError> {
        self.column_index(name)
            .ok_or_else(|| PipelineError::Schema(format!("missing column `{name}`")))
    }

    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().map(move |row| &row[index])
    }

    pub fn set_columns(&mut self, columns: Vec<String>) -> Result<(), PipelineError> {
        if columns.len() != self.columns.len() {
            return Err(PipelineError::Schema(format!(
                "expected {} column names, got {}",
                self.columns.len(),
                columns.len()
            )));
        }
        self.columns = columns;
        Ok(())
    }

    /// Turns a zero-row table into [`PipelineError::EmptyResult`].
    pub fn require_rows(self, context: &str) -> Result<Self, PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::EmptyResult(context.to_string()));
        }
        Ok(self)
    }

    pub fn filter<F>(&self, mut predicate: F) -> Table
    where
        F: FnMut(&[Value]) -> bool,
    {
        Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| predicate(row))
                .cloned()
                .collect(),
        }
    }

    pub fn select(&self, names: &[&str]) -> Result<Table, PipelineError> {
        let indices = names
            .iter()
            .map(|name| self.require_column(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table {
            columns: names.iter().map(|name| name.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&index| row[index].clone()).collect())
                .collect(),
        })
    }

    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Appends a column computed from each row.
    pub fn with_column<F>(&self, name: &str, mut compute: F) -> Table
    where
        F: FnMut(&[Value]) -> Value,
    {
        let mut columns = self.columns.clone();
        columns.push(name.to_string());
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                let value = compute(&row);
                row.push(value);
                row
            })
            .collect();
        Table { columns, rows }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells = self
            .rows
            .iter()
            .map(|row| row.iter().map(ToString::to_string).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let widths = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, name)| {
                cells
                    .iter()
                    .map(|row| row[index].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect::<Vec<_>>();

        let header = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(name, width)| format!("{name:>width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        writeln!(f, "{header}")?;
        for row in cells {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:>width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(f, "{line}")?;
        }
        write!(f, "[{} rows x {} columns]", self.rows.len(), self.columns.len())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn infer_column_types() {
        assert_eq!(ColumnType::infer(["2014", "", "2015"]), ColumnType::Int64);
        assert_eq!(ColumnType::infer(["4.5", "3"]), ColumnType::Float64);
        assert_eq!(ColumnType::infer(["4.5", "ca"]), ColumnType::Utf8);
        assert_eq!(ColumnType::infer(["", " "]), ColumnType::Utf8);
        assert_eq!(ColumnType::infer(["inf"]), ColumnType::Utf8);
    }

    #[test]
    fn infer_loaded_values() {
        let values = [
            Value::Text("1".to_string()),
            Value::Null,
            Value::Float(2.5),
        ];
        assert_eq!(ColumnType::infer_values(&values), ColumnType::Float64);
        let values = [Value::Int(1), Value::Text("x".to_string())];
        assert_eq!(ColumnType::infer_values(&values), ColumnType::Utf8);
    }

    #[test]
    fn sql_types_map_to_columns() {
        assert_eq!(ColumnType::from_sql_type("bigint"), ColumnType::Int64);
        assert_eq!(ColumnType::from_sql_type("decimal(10,2)"), ColumnType::Float64);
        assert_eq!(ColumnType::from_sql_type("varchar"), ColumnType::Utf8);
    }

    #[test]
    fn csv_pads_short_and_skips_long_records() {
        let data = "a,b,c\n1,2,3\n4,5\n6,7,8,9\n";
        let (table, stats) = Table::from_csv_reader(data.as_bytes()).unwrap();
        assert_eq!(table.columns(), ["a", "b", "c"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[1][2], Value::Null);
        assert_eq!(
            stats,
            LoadStats {
                rows: 2,
                padded_rows: 1,
                skipped_rows: 1
            }
        );
    }

    #[test]
    fn csv_without_header_is_schema_error() {
        assert_matches!(
            Table::from_csv_reader("".as_bytes()),
            Err(PipelineError::Schema(_))
        );
    }

    #[test]
    fn require_rows_reports_empty() {
        let table = Table::new(vec!["make".to_string()]);
        assert_matches!(
            table.require_rows("makes"),
            Err(PipelineError::EmptyResult(context)) if context == "makes"
        );
    }

    #[test]
    fn push_row_checks_width() {
        let mut table = Table::new(vec!["a".to_string(), "b".to_string()]);
        assert!(table.push_row(vec![Value::Int(1)]).is_err());
        assert!(table.push_row(vec![Value::Int(1), Value::Null]).is_ok());
    }
}
