//! Window function evaluation over one sorted partition.

use std::cmp::Ordering;

use crate::engine::accumulator::Accumulator;
use crate::engine::compare_by_keys;
use crate::error::EngineError;
use crate::plan::{FrameBound, FrameKind, FrameOffset, WindowCall};
use crate::types::Value;

/// Column positions a window call needs, resolved against the input schema.
#[derive(Debug, Clone)]
pub struct BoundWindowCall {
    pub call: WindowCall,
    pub args: Vec<usize>,
    pub start_offset: Option<usize>,
    pub end_offset: Option<usize>,
}

/// Sort key positions with their direction flags.
pub type BoundSortKeys = Vec<(usize, bool, bool)>;

/// Computes one output value per row of `rows`, which must already be in
/// partition order.
pub fn evaluate_partition(
    rows: &[Vec<Value>],
    call: &BoundWindowCall,
    sorting_keys: &BoundSortKeys,
) -> Result<Vec<Value>, EngineError> {
    let n = rows.len();
    match call.call.function.as_str() {
        "row_number" => Ok((1..=n as i64).map(Value::Int).collect()),
        "rank" | "dense_rank" => {
            let dense = call.call.function == "dense_rank";
            let mut out = Vec::with_capacity(n);
            let mut rank = 0i64;
            for i in 0..n {
                let is_peer =
                    i > 0 && compare_by_keys(&rows[i - 1], &rows[i], sorting_keys).is_eq();
                if !is_peer {
                    rank = if dense { rank + 1 } else { i as i64 + 1 };
                }
                out.push(Value::Int(rank));
            }
            Ok(out)
        }
        "lag" | "lead" => {
            let arg = *call.args.first().ok_or_else(|| {
                EngineError::Runtime(format!("{} needs an argument", call.call.function))
            })?;
            let lag = call.call.function == "lag";
            Ok((0..n)
                .map(|i| {
                    let source = if lag { i.checked_sub(1) } else { Some(i + 1) };
                    source
                        .and_then(|j| rows.get(j))
                        .map_or(Value::Null, |row| row[arg].clone())
                })
                .collect())
        }
        function => {
            let frame = &call.call.frame;
            let positions = if frame.kind == FrameKind::Range
                && (frame.start.offset().is_some() || frame.end.offset().is_some())
            {
                order_positions(rows, sorting_keys)?
            } else {
                Vec::new()
            };
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let mut accumulator = Accumulator::new(function, &call.call.arg_types)?;
                if let Some((start, end)) = frame_range(rows, &positions, i, call, sorting_keys)? {
                    for row in &rows[start..=end] {
                        let args: Vec<Value> = call.args.iter().map(|&a| row[a].clone()).collect();
                        accumulator.add_input(&args)?;
                    }
                }
                out.push(accumulator.finalize(&call.call.result_type)?);
            }
            Ok(out)
        }
    }
}

fn offset_value(
    row: &[Value],
    offset: &FrameOffset,
    column: Option<usize>,
) -> Result<i64, EngineError> {
    let value = match (offset, column) {
        (FrameOffset::Constant(v), _) => *v,
        (FrameOffset::Column(name), Some(index)) => match &row[index] {
            Value::Int(v) => *v,
            Value::Null => {
                return Err(EngineError::User(format!("frame offset {name} is null")));
            }
            other => {
                return Err(EngineError::User(format!(
                    "frame offset {name} must be an integer, got {other}"
                )));
            }
        },
        (FrameOffset::Column(name), None) => {
            return Err(EngineError::Runtime(format!("unknown frame column {name}")));
        }
    };
    if value < 0 {
        return Err(EngineError::User(format!("frame offset must not be negative: {value}")));
    }
    Ok(value)
}

/// Inclusive frame of row `i`, or `None` when the frame is empty. `positions`
/// is only consulted for RANGE frames with offsets.
fn frame_range(
    rows: &[Vec<Value>],
    positions: &[i128],
    i: usize,
    call: &BoundWindowCall,
    sorting_keys: &BoundSortKeys,
) -> Result<Option<(usize, usize)>, EngineError> {
    let frame = &call.call.frame;
    let n = rows.len() as i128;
    let (start, end) = match frame.kind {
        FrameKind::Rows => {
            let start = rows_bound(rows, i, &frame.start, call.start_offset)?;
            let end = rows_bound(rows, i, &frame.end, call.end_offset)?;
            (start.max(0), end.min(n - 1))
        }
        FrameKind::Range => {
            let start = range_bound(
                rows,
                positions,
                i,
                &frame.start,
                call.start_offset,
                true,
                sorting_keys,
            )?;
            let end = range_bound(
                rows,
                positions,
                i,
                &frame.end,
                call.end_offset,
                false,
                sorting_keys,
            )?;
            (start, end)
        }
    };
    if start > end || start >= n || end < 0 {
        return Ok(None);
    }
    Ok(Some((start as usize, end as usize)))
}

fn rows_bound(
    rows: &[Vec<Value>],
    i: usize,
    bound: &FrameBound,
    column: Option<usize>,
) -> Result<i128, EngineError> {
    let i = i as i128;
    Ok(match bound {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::UnboundedFollowing => rows.len() as i128 - 1,
        FrameBound::CurrentRow => i,
        FrameBound::Preceding(offset) => {
            i - offset_value(&rows[i as usize], offset, column)? as i128
        }
        FrameBound::Following(offset) => {
            i + offset_value(&rows[i as usize], offset, column)? as i128
        }
    })
}

/// Maps the single RANGE sort key into a non-decreasing integer sequence:
/// descending keys are negated and nulls sit at the infinity matching their
/// position.
fn order_positions(
    rows: &[Vec<Value>],
    sorting_keys: &BoundSortKeys,
) -> Result<Vec<i128>, EngineError> {
    let [(column, ascending, nulls_first)] = sorting_keys.as_slice() else {
        return Err(EngineError::User(
            "RANGE frames with offsets need exactly one sorting key".to_string(),
        ));
    };
    rows.iter()
        .map(|row| match &row[*column] {
            Value::Null if *nulls_first => Ok(i128::MIN),
            Value::Null => Ok(i128::MAX),
            Value::Int(v) if *ascending => Ok(*v as i128),
            Value::Int(v) => Ok(-(*v as i128)),
            other => Err(EngineError::User(format!(
                "RANGE frame sorting key must be an integer, got {other}"
            ))),
        })
        .collect()
}

fn range_bound(
    rows: &[Vec<Value>],
    positions: &[i128],
    i: usize,
    bound: &FrameBound,
    column: Option<usize>,
    is_start: bool,
    sorting_keys: &BoundSortKeys,
) -> Result<i128, EngineError> {
    let n = rows.len();
    let target = match bound {
        FrameBound::UnboundedPreceding => return Ok(0),
        FrameBound::UnboundedFollowing => return Ok(n as i128 - 1),
        FrameBound::CurrentRow => {
            // Peers of the current row.
            let peer =
                |j: usize| compare_by_keys(&rows[j], &rows[i], sorting_keys) == Ordering::Equal;
            return Ok(if is_start {
                (0..=i).rev().take_while(|&j| peer(j)).last().unwrap_or(i) as i128
            } else {
                (i..n).take_while(|&j| peer(j)).last().unwrap_or(i) as i128
            });
        }
        FrameBound::Preceding(offset) => {
            positions[i].saturating_sub(offset_value(&rows[i], offset, column)? as i128)
        }
        FrameBound::Following(offset) => {
            positions[i].saturating_add(offset_value(&rows[i], offset, column)? as i128)
        }
    };
    Ok(if is_start {
        positions.partition_point(|&p| p < target) as i128
    } else {
        positions.partition_point(|&p| p <= target) as i128 - 1
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Frame;
    use crate::types::DataType;

    fn call(function: &str, frame: Frame) -> BoundWindowCall {
        BoundWindowCall {
            call: WindowCall {
                function: function.to_string(),
                args: vec!["c0".to_string()],
                arg_types: vec![DataType::BigInt],
                result_type: DataType::BigInt,
                frame,
                output: "w0".to_string(),
            },
            args: vec![0],
            start_offset: None,
            end_offset: None,
        }
    }

    fn rows(values: &[i64]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![Value::Int(*v)]).collect()
    }

    #[test]
    fn test_rows_frame_sum() {
        let frame = Frame {
            kind: FrameKind::Rows,
            start: FrameBound::Preceding(FrameOffset::Constant(1)),
            end: FrameBound::CurrentRow,
        };
        let out = evaluate_partition(
            &rows(&[1, 2, 3, 4]),
            &call("sum", frame),
            &vec![(0, true, true)],
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Value::Int(1), Value::Int(3), Value::Int(5), Value::Int(7)]
        );
    }

    #[test]
    fn test_range_frame_uses_values() {
        let frame = Frame {
            kind: FrameKind::Range,
            start: FrameBound::Preceding(FrameOffset::Constant(1)),
            end: FrameBound::CurrentRow,
        };
        let out = evaluate_partition(
            &rows(&[1, 1, 2, 5]),
            &call("count", frame),
            &vec![(0, true, true)],
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Value::Int(2), Value::Int(2), Value::Int(3), Value::Int(1)]
        );
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame {
            kind: FrameKind::Rows,
            start: FrameBound::Following(FrameOffset::Constant(2)),
            end: FrameBound::Following(FrameOffset::Constant(3)),
        };
        let out = evaluate_partition(
            &rows(&[1, 2, 3]),
            &call("sum", frame),
            &vec![(0, true, true)],
        )
        .unwrap();
        assert_eq!(out, vec![Value::Int(3), Value::Null, Value::Null]);
    }

    #[test]
    fn test_rank() {
        let mut rank = call("rank", Frame::default());
        rank.args.clear();
        let keys = vec![(0, true, true)];
        let out = evaluate_partition(&rows(&[1, 1, 2]), &rank, &keys).unwrap();
        assert_eq!(out, vec![Value::Int(1), Value::Int(1), Value::Int(3)]);
        rank.call.function = "dense_rank".to_string();
        let out = evaluate_partition(&rows(&[1, 1, 2]), &rank, &keys).unwrap();
        assert_eq!(out, vec![Value::Int(1), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_negative_column_offset() {
        let frame = Frame {
            kind: FrameKind::Rows,
            start: FrameBound::Preceding(FrameOffset::Column("k0".to_string())),
            end: FrameBound::CurrentRow,
        };
        let mut bound = call("sum", frame);
        bound.start_offset = Some(0);
        let err = evaluate_partition(&rows(&[-1]), &bound, &vec![(0, true, true)]).unwrap_err();
        assert!(err.is_user_error());
    }
}
