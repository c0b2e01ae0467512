use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

static NULL: Value = Value::Null;

/// Row-major table whose column set is registered at runtime.
///
/// Column order is registration order. A cell that was never written reads
/// as JSON null, which is also how missing values are represented.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    #[must_use]
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for column in columns {
            table.ensure_column(column);
        }
        table
    }

    /// Registers `column` if it is not already present. Returns `true` when
    /// the column is new.
    pub fn ensure_column(&mut self, column: impl Into<String>) -> bool {
        let column = column.into();
        if self.has_column(&column) {
            return false;
        }
        self.columns.push(column);
        true
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|candidate| candidate == column)
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Appends a row, registering any columns it introduces.
    pub fn push_row(&mut self, row: Row) {
        for key in row.keys() {
            if !self.has_column(key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Cell at (`row`, `column`); null when the row lacks the column.
    #[must_use]
    pub fn get(&self, row: usize, column: &str) -> &Value {
        self.rows
            .get(row)
            .and_then(|row| row.get(column))
            .unwrap_or(&NULL)
    }

    pub fn column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(column).unwrap_or(&NULL))
    }
}

/// Missing means JSON null; every other value, including `false`, `0` and
/// empty containers, is present.
#[must_use]
pub fn is_missing(value: &Value) -> bool {
    value.is_null()
}
