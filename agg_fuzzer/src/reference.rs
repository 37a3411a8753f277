//! Reference query runner backed by SQLite.
//!
//! The logical plan is translated to SQL and executed on a fresh in-memory
//! database. Anything SQLite cannot express faithfully is reported as
//! [`ReferenceResult::Unsupported`] rather than risking a false mismatch.

use itertools::Itertools;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};

use crate::batch::RowBatch;
use crate::plan::{
    AggregateCall, AggregationStep, Frame, FrameBound, FrameOffset, PlanNode, SortKey, WindowCall,
};
use crate::types::{DataType, Value};

const INPUT_TABLE: &str = "t";

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceResult {
    Rows(RowBatch),
    /// The reference cannot run this query.
    Unsupported(String),
    /// The reference accepted the query but failed to run it.
    Failed(String),
}

pub trait ReferenceQueryRunner: Send {
    fn name(&self) -> &str;

    /// Scalar types the runner can store and return. Grouping and sorting
    /// keys are drawn from these.
    fn supported_scalar_types(&self) -> Vec<DataType>;

    fn execute(&self, plan: &PlanNode) -> ReferenceResult;
}

#[derive(Debug, Default, Clone)]
pub struct SqliteQueryRunner;

impl SqliteQueryRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ReferenceQueryRunner for SqliteQueryRunner {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn supported_scalar_types(&self) -> Vec<DataType> {
        vec![
            DataType::Boolean,
            DataType::TinyInt,
            DataType::SmallInt,
            DataType::Integer,
            DataType::BigInt,
            DataType::Real,
            DataType::Double,
            DataType::Varchar,
            DataType::Varbinary,
        ]
    }

    fn execute(&self, plan: &PlanNode) -> ReferenceResult {
        let Some(PlanNode::Values { batches }) = plan.nodes().last() else {
            return ReferenceResult::Unsupported("only VALUES inputs are supported".to_string());
        };
        let Some(schema) = batches.first().map(RowBatch::schema) else {
            return ReferenceResult::Unsupported("input has no batches".to_string());
        };
        let Some(output_schema) = plan.output_schema() else {
            return ReferenceResult::Unsupported("plan has no row output".to_string());
        };
        let supported = self.supported_scalar_types();
        if let Some((name, ty)) = schema
            .iter()
            .chain(&output_schema)
            .find(|(_, ty)| !supported.contains(ty))
        {
            return ReferenceResult::Unsupported(format!("column {name} has type {ty}"));
        }
        let sql = match to_sql(plan) {
            Ok(sql) => sql,
            Err(reason) => return ReferenceResult::Unsupported(reason),
        };
        tracing::debug!("reference query: {sql}");

        let rows = match run_query(&schema, batches, &sql) {
            Ok(rows) => rows,
            Err(e) => return ReferenceResult::Failed(format!("{e} (query: {sql})")),
        };
        let rows = match rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&output_schema)
                    .map(|(value, (_, ty))| from_sql_value(value, ty))
                    .collect::<Result<Vec<_>, String>>()
            })
            .collect::<Result<Vec<_>, String>>()
        {
            Ok(rows) => rows,
            Err(e) => return ReferenceResult::Failed(e),
        };
        match RowBatch::from_rows(&output_schema, rows) {
            Ok(batch) => ReferenceResult::Rows(batch),
            Err(e) => ReferenceResult::Failed(e.to_string()),
        }
    }
}

fn run_query(
    schema: &[(String, DataType)],
    batches: &[RowBatch],
    sql: &str,
) -> rusqlite::Result<Vec<Vec<SqlValue>>> {
    let mut conn = Connection::open_in_memory()?;
    let columns = schema
        .iter()
        .map(|(name, ty)| format!("{} {}", quote(name), sql_type(ty)))
        .join(", ");
    conn.execute(&format!("CREATE TABLE {INPUT_TABLE} ({columns})"), [])?;

    let tx = conn.transaction()?;
    {
        let placeholders = std::iter::repeat_n("?", schema.len()).join(", ");
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {INPUT_TABLE} VALUES ({placeholders})"
        ))?;
        for batch in batches {
            for row in batch.rows() {
                insert.execute(params_from_iter(row.iter().map(to_sql_value)))?;
            }
        }
    }
    tx.commit()?;

    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query([])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(row.get::<_, SqlValue>(i)?);
        }
        result.push(values);
    }
    Ok(result)
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(ty: &DataType) -> &'static str {
    match ty {
        DataType::Real | DataType::Double => "REAL",
        DataType::Varchar => "TEXT",
        DataType::Varbinary => "BLOB",
        _ => "INTEGER",
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Double(v) => SqlValue::Real(*v),
        Value::Varchar(s) => SqlValue::Text(s.clone()),
        Value::Varbinary(b) => SqlValue::Blob(b.clone()),
        _ => SqlValue::Null,
    }
}

fn from_sql_value(value: SqlValue, ty: &DataType) -> Result<Value, String> {
    let converted = match (value, ty) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Integer(v), DataType::Boolean) => Value::Boolean(v != 0),
        (SqlValue::Integer(v), DataType::Real) => Value::Double(v as f32 as f64),
        (SqlValue::Integer(v), DataType::Double) => Value::Double(v as f64),
        (SqlValue::Integer(v), _) if ty.is_integer() => Value::Int(v),
        (SqlValue::Real(v), DataType::Real) => Value::Double(v as f32 as f64),
        (SqlValue::Real(v), DataType::Double) => Value::Double(v),
        (SqlValue::Text(s), DataType::Varchar) => Value::Varchar(s),
        (SqlValue::Blob(b), DataType::Varbinary) => Value::Varbinary(b),
        (value, ty) => return Err(format!("cannot convert {value:?} to {ty}")),
    };
    Ok(converted)
}

fn sort_key_sql(key: &SortKey) -> String {
    format!(
        "{} {} NULLS {}",
        quote(&key.column),
        if key.ascending { "ASC" } else { "DESC" },
        if key.nulls_first { "FIRST" } else { "LAST" }
    )
}

fn order_by_sql(keys: &[SortKey]) -> String {
    keys.iter().map(sort_key_sql).join(", ")
}

/// The `FROM` target for a node's input. Sorting below an aggregation or a
/// window does not change the result, so it is dropped.
fn from_sql(source: &PlanNode) -> Result<String, String> {
    match source {
        PlanNode::Values { .. } => Ok(INPUT_TABLE.to_string()),
        PlanNode::OrderBy { source, .. } if matches!(**source, PlanNode::Values { .. }) => {
            Ok(INPUT_TABLE.to_string())
        }
        other => Ok(format!("({}) AS s", to_sql(other)?)),
    }
}

fn to_sql(plan: &PlanNode) -> Result<String, String> {
    match plan {
        PlanNode::Values { .. } => Ok(format!("SELECT * FROM {INPUT_TABLE}")),
        PlanNode::TableScan { .. } => Err("table scans are not supported".to_string()),
        PlanNode::OrderBy { keys, source } => Ok(format!(
            "SELECT * FROM {} ORDER BY {}",
            from_sql(source)?,
            order_by_sql(keys)
        )),
        PlanNode::Aggregation {
            step,
            grouping_keys,
            aggregates,
            source,
            ..
        } => {
            if *step != AggregationStep::Single {
                return Err(format!("{step} aggregation steps are not supported"));
            }
            let keys = grouping_keys.iter().map(|k| quote(k)).collect::<Vec<_>>();
            let projections = keys
                .iter()
                .cloned()
                .map(Ok)
                .chain(aggregates.iter().map(|call| {
                    Ok(format!("{} AS {}", aggregate_sql(call)?, quote(&call.output)))
                }))
                .collect::<Result<Vec<String>, String>>()?;
            let mut sql = format!(
                "SELECT {} FROM {}",
                projections.join(", "),
                from_sql(source)?
            );
            if !keys.is_empty() {
                sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
            }
            Ok(sql)
        }
        PlanNode::Window {
            partition_keys,
            sorting_keys,
            functions,
            source,
            ..
        } => {
            let mut over = Vec::new();
            if !partition_keys.is_empty() {
                over.push(format!(
                    "PARTITION BY {}",
                    partition_keys.iter().map(|k| quote(k)).join(", ")
                ));
            }
            if !sorting_keys.is_empty() {
                over.push(format!("ORDER BY {}", order_by_sql(sorting_keys)));
            }
            let calls = functions
                .iter()
                .map(|call| window_sql(call, &over.join(" ")))
                .collect::<Result<Vec<_>, String>>()?;
            Ok(format!("SELECT *, {} FROM {}", calls.join(", "), from_sql(source)?))
        }
    }
}

fn args_sql(args: &[String]) -> String {
    args.iter().map(|a| quote(a)).join(", ")
}

fn aggregate_sql(call: &AggregateCall) -> Result<String, String> {
    let distinct = if call.distinct { "DISTINCT " } else { "" };
    let order_by = if call.sorting_keys.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order_by_sql(&call.sorting_keys))
    };
    let args = args_sql(&call.args);
    let function = match call.function.as_str() {
        "count" if call.args.is_empty() => return Ok("count(*)".to_string()),
        "count_if" => {
            return Ok(format!("count({distinct}CASE WHEN {args} THEN 1 END{order_by})"));
        }
        "count" | "sum" | "avg" | "min" | "max" => call.function.as_str(),
        "bool_and" => "min",
        "bool_or" => "max",
        other => return Err(format!("aggregate {other} is not supported")),
    };
    Ok(format!("{function}({distinct}{args}{order_by})"))
}

fn frame_bound_sql(bound: &FrameBound) -> Result<String, String> {
    let offset = |offset: &FrameOffset| match offset {
        FrameOffset::Constant(v) => Ok(v.to_string()),
        FrameOffset::Column(name) => Err(format!("column frame offset {name} is not supported")),
    };
    Ok(match bound {
        FrameBound::UnboundedPreceding => "UNBOUNDED PRECEDING".to_string(),
        FrameBound::Preceding(o) => format!("{} PRECEDING", offset(o)?),
        FrameBound::CurrentRow => "CURRENT ROW".to_string(),
        FrameBound::Following(o) => format!("{} FOLLOWING", offset(o)?),
        FrameBound::UnboundedFollowing => "UNBOUNDED FOLLOWING".to_string(),
    })
}

fn frame_sql(frame: &Frame) -> Result<String, String> {
    Ok(format!(
        "{} BETWEEN {} AND {}",
        frame.kind,
        frame_bound_sql(&frame.start)?,
        frame_bound_sql(&frame.end)?
    ))
}

fn window_sql(call: &WindowCall, over: &str) -> Result<String, String> {
    let args = args_sql(&call.args);
    let function = match call.function.as_str() {
        "row_number" | "rank" | "dense_rank" => {
            return Ok(format!(
                "{}() OVER ({over}) AS {}",
                call.function,
                quote(&call.output)
            ))
        }
        "lag" | "lead" => {
            return Ok(format!(
                "{}({args}) OVER ({over}) AS {}",
                call.function,
                quote(&call.output)
            ))
        }
        "count" if call.args.is_empty() => "count(*)".to_string(),
        "count_if" => format!("count(CASE WHEN {args} THEN 1 END)"),
        "count" | "sum" | "avg" | "min" | "max" => format!("{}({args})", call.function),
        "bool_and" => format!("min({args})"),
        "bool_or" => format!("max({args})"),
        other => return Err(format!("window function {other} is not supported")),
    };
    Ok(format!(
        "{function} OVER ({over} {}) AS {}",
        frame_sql(&call.frame)?,
        quote(&call.output)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use crate::plan::FrameKind;

    fn input() -> Vec<RowBatch> {
        vec![RowBatch::try_new(vec![
            Column::new(
                "c0",
                DataType::BigInt,
                vec![Value::Int(1), Value::Int(2), Value::Null, Value::Int(4)],
            ),
            Column::new(
                "g0",
                DataType::Boolean,
                vec![
                    Value::Boolean(true),
                    Value::Boolean(false),
                    Value::Boolean(true),
                    Value::Boolean(true),
                ],
            ),
        ])
        .unwrap()]
    }

    fn call(function: &str) -> AggregateCall {
        AggregateCall {
            function: function.to_string(),
            args: vec!["c0".to_string()],
            arg_types: vec![DataType::BigInt],
            result_type: DataType::BigInt,
            distinct: false,
            sorting_keys: Vec::new(),
            output: "a0".to_string(),
        }
    }

    #[test]
    fn test_group_by() {
        let plan = PlanNode::values(input()).aggregation(
            AggregationStep::Single,
            &["g0".to_string()],
            &[call("sum")],
            false,
        );
        let ReferenceResult::Rows(batch) = SqliteQueryRunner::new().execute(&plan) else {
            panic!("expected rows");
        };
        let mut rows = batch.rows();
        rows.sort();
        assert_eq!(
            rows,
            vec![
                vec![Value::Boolean(false), Value::Int(2)],
                vec![Value::Boolean(true), Value::Int(5)],
            ]
        );
    }

    #[test]
    fn test_window() {
        let window = WindowCall {
            function: "count".to_string(),
            args: vec!["c0".to_string()],
            arg_types: vec![DataType::BigInt],
            result_type: DataType::BigInt,
            frame: Frame {
                kind: FrameKind::Rows,
                start: FrameBound::Preceding(FrameOffset::Constant(1)),
                end: FrameBound::CurrentRow,
            },
            output: "w0".to_string(),
        };
        let plan = PlanNode::values(input()).window(&[], &[SortKey::asc("c0")], &[window], false);
        let ReferenceResult::Rows(batch) = SqliteQueryRunner::new().execute(&plan) else {
            panic!("expected rows");
        };
        assert_eq!(batch.num_columns(), 3);
        let counts: Vec<Value> = batch.column("w0").unwrap().values.clone();
        assert_eq!(
            counts.iter().filter(|v| **v == Value::Int(2)).count(),
            2,
            "{counts:?}"
        );
    }

    #[test]
    fn test_unsupported() {
        let plan = PlanNode::values(input()).aggregation(
            AggregationStep::Single,
            &[],
            &[call("array_agg")],
            false,
        );
        assert!(matches!(
            SqliteQueryRunner::new().execute(&plan),
            ReferenceResult::Unsupported(_)
        ));

        let partial = PlanNode::values(input())
            .aggregation(AggregationStep::Partial, &[], &[call("sum")], false)
            .aggregation(AggregationStep::Final, &[], &[call("sum")], false);
        assert!(matches!(
            SqliteQueryRunner::new().execute(&partial),
            ReferenceResult::Unsupported(_)
        ));
    }

    #[test]
    fn test_overflow_fails() {
        let batch = RowBatch::try_new(vec![Column::new(
            "c0",
            DataType::BigInt,
            vec![Value::Int(i64::MAX), Value::Int(1)],
        )])
        .unwrap();
        let plan = PlanNode::values(vec![batch]).aggregation(
            AggregationStep::Single,
            &[],
            &[call("sum")],
            false,
        );
        assert!(matches!(
            SqliteQueryRunner::new().execute(&plan),
            ReferenceResult::Failed(_)
        ));
    }
}
