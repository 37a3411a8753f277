//! Columnar row batches.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, FuzzerError, Result};
use crate::types::{DataType, Value};

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            data_type,
            values,
        }
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }
}

/// Ordered set of equally sized columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    columns: Vec<Column>,
    num_rows: usize,
}

impl RowBatch {
    pub fn try_new(columns: Vec<Column>) -> Result<Self> {
        let num_rows = columns.first().map_or(0, |c| c.values.len());
        if let Some(bad) = columns.iter().find(|c| c.values.len() != num_rows) {
            return Err(FuzzerError::MalformedInput {
                function: bad.name.clone(),
                reason: format!("column has {} rows, expected {num_rows}", bad.values.len()),
            });
        }
        Ok(Self { columns, num_rows })
    }

    /// Builds a batch from row-major data, typically an engine's output.
    pub fn from_rows(
        schema: &[(String, DataType)],
        rows: Vec<Vec<Value>>,
    ) -> std::result::Result<Self, EngineError> {
        let mut columns: Vec<Column> = schema
            .iter()
            .map(|(name, ty)| Column::new(name.clone(), ty.clone(), Vec::with_capacity(rows.len())))
            .collect();
        let num_rows = rows.len();
        for row in rows {
            if row.len() != columns.len() {
                return Err(EngineError::Runtime(format!(
                    "row has {} values but the schema has {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }
        Ok(Self { columns, num_rows })
    }

    pub fn empty(schema: &[(String, DataType)]) -> Self {
        Self {
            columns: schema
                .iter()
                .map(|(name, ty)| Column::new(name.clone(), ty.clone(), Vec::new()))
                .collect(),
            num_rows: 0,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn schema(&self) -> Vec<(String, DataType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type.clone()))
            .collect()
    }

    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| c.values[index].clone())
            .collect()
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.num_rows).map(|i| self.row(i)).collect()
    }

    pub fn estimated_size(&self) -> usize {
        self.columns
            .iter()
            .flat_map(|c| c.values.iter())
            .map(Value::estimated_size)
            .sum()
    }

    /// Concatenates batches sharing the same schema.
    pub fn concat(batches: &[RowBatch]) -> std::result::Result<RowBatch, EngineError> {
        let Some(first) = batches.first() else {
            return Ok(RowBatch::default());
        };
        let schema = first.schema();
        let mut rows = Vec::with_capacity(batches.iter().map(RowBatch::num_rows).sum());
        for batch in batches {
            if batch.schema() != schema {
                return Err(EngineError::Runtime(
                    "cannot concatenate batches with different schemas".to_string(),
                ));
            }
            rows.extend(batch.rows());
        }
        RowBatch::from_rows(&schema, rows)
    }
}

impl fmt::Display for RowBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.data_type))
            .collect();
        writeln!(f, "{}", header.join(" | "))?;
        for row in self.rows() {
            let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }
        Ok(())
    }
}

/// Returns `c0, c1, ..., c{n-1}`.
pub fn make_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("c{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatched_columns_rejected() {
        let result = RowBatch::try_new(vec![
            Column::new("c0", DataType::BigInt, vec![Value::Int(1)]),
            Column::new("c1", DataType::BigInt, vec![]),
        ]);
        assert!(matches!(result, Err(FuzzerError::MalformedInput { .. })));
    }

    #[test]
    fn test_concat() {
        let a = RowBatch::try_new(vec![Column::new("c0", DataType::BigInt, vec![Value::Int(1)])])
            .unwrap();
        let b = RowBatch::try_new(vec![Column::new(
            "c0",
            DataType::BigInt,
            vec![Value::Int(2), Value::Null],
        )])
        .unwrap();
        let merged = RowBatch::concat(&[a, b]).unwrap();
        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.column("c0").unwrap().null_count(), 1);
    }

    #[test]
    fn test_make_names() {
        assert_eq!(make_names(3), vec!["c0", "c1", "c2"]);
        assert!(make_names(0).is_empty());
    }
}
