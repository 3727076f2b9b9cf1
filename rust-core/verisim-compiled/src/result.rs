// SPDX-License-Identifier: PMPL-1.0-or-later
//! Result shaping.
//!
//! [`shape_rows`] is the one routine that applies a plan's [`ResultShape`] to
//! the rows storage returned: cardinality checks, JSON array assembly. The
//! typed handlers below then decode the shaped rows into the template's
//! output type.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::command::{RawLayout, ResultShape};
use crate::error::{CompiledQueryError, Result};
use crate::storage::Row;

/// Rows after the result shape has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    One(Option<Row>),
    Many(Vec<Row>),
    Scalar(Row),
    Json(Option<String>),
}

/// Typed result handler stored in a compiled plan.
pub type Materializer<O> = fn(Materialized) -> Result<O>;

/// Apply a result shape to raw rows.
pub fn shape_rows(
    shape: ResultShape,
    mut rows: Vec<Row>,
    template: &'static str,
) -> Result<Materialized> {
    match shape {
        ResultShape::SingleRequired { unique } => {
            check_cardinality(&rows, true, unique, template)?;
            Ok(Materialized::One(first_row(rows)))
        }
        ResultShape::SingleOptional { unique } => {
            check_cardinality(&rows, false, unique, template)?;
            Ok(Materialized::One(first_row(rows)))
        }
        ResultShape::List => Ok(Materialized::Many(rows)),
        ResultShape::Scalar => {
            if rows.len() != 1 {
                return Err(CompiledQueryError::ShapeMismatch(format!(
                    "scalar result for {} returned {} rows",
                    template,
                    rows.len()
                )));
            }
            Ok(Materialized::Scalar(rows.remove(0)))
        }
        ResultShape::RawSerialized(RawLayout::Single { required, unique }) => {
            check_cardinality(&rows, required, unique, template)?;
            Ok(Materialized::Json(first_row(rows).map(Row::into_json)))
        }
        ResultShape::RawSerialized(RawLayout::Array) => {
            let mut out = String::with_capacity(rows.iter().map(|r| r.as_str().len() + 1).sum::<usize>() + 2);
            out.push('[');
            for (i, row) in rows.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(row.as_str());
            }
            out.push(']');
            Ok(Materialized::Json(Some(out)))
        }
    }
}

fn check_cardinality(
    rows: &[Row],
    required: bool,
    unique: bool,
    template: &'static str,
) -> Result<()> {
    if rows.is_empty() && required {
        warn!(template, "single-result compiled query matched no document");
        return Err(CompiledQueryError::NotFound(template));
    }
    if rows.len() > 1 && unique {
        warn!(template, count = rows.len(), "single-result compiled query matched several documents");
        return Err(CompiledQueryError::MultipleResults {
            template,
            count: rows.len(),
        });
    }
    Ok(())
}

fn first_row(rows: Vec<Row>) -> Option<Row> {
    rows.into_iter().next()
}

fn mismatch(expected: &str, found: &Materialized) -> CompiledQueryError {
    CompiledQueryError::ShapeMismatch(format!("expected {} rows, got {:?}", expected, found))
}

// ---------------------------------------------------------------------------
// Typed handlers
// ---------------------------------------------------------------------------

pub(crate) fn one<T: DeserializeOwned>(m: Materialized) -> Result<T> {
    match m {
        Materialized::One(Some(row)) => Ok(serde_json::from_str(row.as_str())?),
        other => Err(mismatch("exactly one", &other)),
    }
}

pub(crate) fn optional<T: DeserializeOwned>(m: Materialized) -> Result<Option<T>> {
    match m {
        Materialized::One(row) => row
            .map(|r| serde_json::from_str(r.as_str()))
            .transpose()
            .map_err(CompiledQueryError::from),
        other => Err(mismatch("zero or one", &other)),
    }
}

pub(crate) fn list<T: DeserializeOwned>(m: Materialized) -> Result<Vec<T>> {
    match m {
        Materialized::Many(rows) => rows
            .iter()
            .map(|r| serde_json::from_str(r.as_str()).map_err(CompiledQueryError::from))
            .collect(),
        other => Err(mismatch("a list of", &other)),
    }
}

pub(crate) fn scalar<T: DeserializeOwned>(m: Materialized) -> Result<T> {
    match m {
        Materialized::Scalar(row) => Ok(serde_json::from_str(row.as_str())?),
        other => Err(mismatch("scalar", &other)),
    }
}

pub(crate) fn json(m: Materialized) -> Result<String> {
    match m {
        Materialized::Json(Some(text)) => Ok(text),
        other => Err(mismatch("serialized", &other)),
    }
}

pub(crate) fn json_optional(m: Materialized) -> Result<Option<String>> {
    match m {
        Materialized::Json(text) => Ok(text),
        other => Err(mismatch("serialized", &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(texts: &[&str]) -> Vec<Row> {
        texts.iter().map(|t| Row::new(*t)).collect()
    }

    #[test]
    fn test_single_required_rejects_zero_and_many() {
        let shape = ResultShape::SingleRequired { unique: true };
        assert!(matches!(
            shape_rows(shape, vec![], "T"),
            Err(CompiledQueryError::NotFound("T"))
        ));
        assert!(matches!(
            shape_rows(shape, rows(&["1", "2"]), "T"),
            Err(CompiledQueryError::MultipleResults { count: 2, .. })
        ));
        assert_eq!(
            shape_rows(shape, rows(&["1"]), "T").unwrap(),
            Materialized::One(Some(Row::new("1")))
        );
    }

    #[test]
    fn test_first_tolerates_many() {
        let shape = ResultShape::SingleRequired { unique: false };
        let shaped = shape_rows(shape, rows(&["1", "2"]), "T").unwrap();
        assert_eq!(shaped, Materialized::One(Some(Row::new("1"))));
    }

    #[test]
    fn test_optional_tolerates_zero() {
        let shape = ResultShape::SingleOptional { unique: true };
        assert_eq!(shape_rows(shape, vec![], "T").unwrap(), Materialized::One(None));
        let decoded: Option<i64> = optional(Materialized::One(None)).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_json_array_joins_verbatim() {
        let shape = ResultShape::RawSerialized(RawLayout::Array);
        let shaped = shape_rows(shape, rows(&[r#"{"a":1}"#, r#"{"a": 2}"#]), "T").unwrap();
        assert_eq!(shaped, Materialized::Json(Some(r#"[{"a":1},{"a": 2}]"#.to_string())));
        let empty = shape_rows(shape, vec![], "T").unwrap();
        assert_eq!(json(empty).unwrap(), "[]");
    }

    #[test]
    fn test_scalar_requires_one_row() {
        assert!(shape_rows(ResultShape::Scalar, vec![], "T").is_err());
        let shaped = shape_rows(ResultShape::Scalar, rows(&["7"]), "T").unwrap();
        assert_eq!(scalar::<i64>(shaped).unwrap(), 7);
    }

    #[test]
    fn test_handler_rejects_wrong_shape() {
        let err = one::<i64>(Materialized::Many(vec![])).unwrap_err();
        assert!(matches!(err, CompiledQueryError::ShapeMismatch(_)));
    }
}
