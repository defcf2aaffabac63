//! Type-directed reconciliation of structured results, shell output and
//! expected data.

use crate::backends::{CqlValue, StructuredRows};
use crate::error::{Error, Result};
use crate::generator::{DataType, ExpectedDataset, Value};
use num_bigint::BigInt;
use uuid::Uuid;

/// Relative difference under which two floats are considered equal
pub const FLOAT_TOLERANCE: f64 = 0.01;

/// Result of comparing one value from each source
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonResult {
    Match,
    Mismatch { reason: String },
}

impl ComparisonResult {
    pub fn is_match(&self) -> bool {
        matches!(self, ComparisonResult::Match)
    }

    pub fn mismatch(reason: impl Into<String>) -> Self {
        ComparisonResult::Mismatch {
            reason: reason.into(),
        }
    }

    fn check(ok: bool, what: &str) -> Self {
        if ok {
            ComparisonResult::Match
        } else {
            Self::mismatch(what)
        }
    }
}

/// One `name, value` slot printed by the shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCell {
    pub name: String,
    pub value: String,
}

impl ShellCell {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub type ShellRow = Vec<ShellCell>;

fn floats_close(reference: f64, other: f64) -> bool {
    (reference == 0.0 && other == 0.0) || ((reference - other) / reference).abs() < FLOAT_TOLERANCE
}

fn compare_integers(structured: &CqlValue, shell: &str, expected: &Value) -> ComparisonResult {
    let Some(s) = structured.to_bigint() else {
        return ComparisonResult::mismatch("structured value is not an integer");
    };
    let Ok(sh) = shell.trim().parse::<BigInt>() else {
        return ComparisonResult::mismatch("shell value is not an integer");
    };
    let Value::Integer(e) = expected else {
        return ComparisonResult::mismatch("expected value is not an integer");
    };
    ComparisonResult::check(s == sh && &s == e, "integers differ")
}

fn compare_floats(structured: &CqlValue, shell: &str, expected: &Value) -> ComparisonResult {
    let Some(s) = structured.to_f64() else {
        return ComparisonResult::mismatch("structured value is not a number");
    };
    let Ok(sh) = shell.trim().parse::<f64>() else {
        return ComparisonResult::mismatch("shell value is not a number");
    };
    let Value::Float(e) = expected else {
        return ComparisonResult::mismatch("expected value is not a number");
    };
    ComparisonResult::check(
        floats_close(s, sh) && floats_close(s, *e),
        "numbers differ by more than the tolerance",
    )
}

fn compare_blobs(structured: &CqlValue, shell: &str, expected: &Value) -> ComparisonResult {
    let Some(s) = structured.to_bytes() else {
        return ComparisonResult::mismatch("structured value is not a blob");
    };
    let Ok(sh) = hex::decode(shell.trim()) else {
        return ComparisonResult::mismatch("shell value is not hex");
    };
    let Ok(e) = hex::decode(expected.to_string()) else {
        return ComparisonResult::mismatch("expected value is not hex");
    };
    ComparisonResult::check(s == sh && s == e, "blobs differ")
}

fn compare_booleans(structured: &CqlValue, shell: &str, expected: &Value) -> ComparisonResult {
    let s = structured.to_string();
    let e = expected.to_string();
    ComparisonResult::check(
        s.eq_ignore_ascii_case(shell.trim()) && s.eq_ignore_ascii_case(&e),
        "booleans differ",
    )
}

fn compare_uuids(structured: &CqlValue, shell: &str, expected: &Value) -> ComparisonResult {
    let s = match structured {
        CqlValue::Uuid(u) => Some(*u),
        other => Uuid::parse_str(other.to_string().trim()).ok(),
    };
    let sh = Uuid::parse_str(shell.trim()).ok();
    let e = match expected {
        Value::Uuid(u) => Some(*u),
        _ => None,
    };
    ComparisonResult::check(s.is_some() && s == sh && s == e, "identifiers differ")
}

/// Compare one value from each source according to its declared type
pub fn compare_value(
    data_type: DataType,
    structured: &CqlValue,
    shell: &str,
    expected: &Value,
) -> ComparisonResult {
    if data_type.is_text_like() {
        let s = structured.to_string();
        return ComparisonResult::check(s == shell && s == expected.to_string(), "text differs");
    }
    if data_type.is_integer_like() {
        return compare_integers(structured, shell, expected);
    }
    if data_type.is_float_like() {
        return compare_floats(structured, shell, expected);
    }
    match data_type {
        DataType::Blob => compare_blobs(structured, shell, expected),
        DataType::Boolean => compare_booleans(structured, shell, expected),
        DataType::Uuid => compare_uuids(structured, shell, expected),
        _ => ComparisonResult::mismatch(format!("no comparison for {data_type}")),
    }
}

/// Walk the structured rows in returned order and check every value against
/// the shell's rendering and the expected dataset.
///
/// Column 0 is the row key. Other columns are matched to expected columns by
/// the name the shell printed, falling back to its hex encoding for blob
/// comparators.
pub fn verify_results(
    structured: &StructuredRows,
    shell: &[ShellRow],
    expected: &ExpectedDataset,
) -> Result<()> {
    if structured.rows.len() != expected.len() {
        return Err(Error::RowCount {
            source_name: "structured transport",
            actual: structured.rows.len(),
            expected: expected.len(),
        });
    }
    if shell.len() != expected.len() {
        return Err(Error::RowCount {
            source_name: "shell",
            actual: shell.len(),
            expected: expected.len(),
        });
    }

    for (row_index, ((cells, shell_row), expected_row)) in structured
        .rows
        .iter()
        .zip(shell)
        .zip(&expected.rows)
        .enumerate()
    {
        for (col_index, structured_value) in cells.iter().enumerate() {
            let shell_cell = shell_row.get(col_index);
            let shell_value = shell_cell.map(|c| c.value.as_str()).unwrap_or_default();

            let (data_type, expected_value) = if col_index == 0 {
                (expected_row.key_type, &expected_row.key)
            } else {
                let name = shell_cell.map(|c| c.name.as_str()).unwrap_or_default();
                let column = expected_row
                    .column(name)
                    .or_else(|| expected_row.column(&hex::encode(name)))
                    .ok_or_else(|| Error::UnknownColumn {
                        row: row_index,
                        name: name.to_string(),
                    })?;
                (column.data_type, &column.value)
            };

            if let ComparisonResult::Mismatch { reason } =
                compare_value(data_type, structured_value, shell_value, expected_value)
            {
                tracing::debug!(row_index, col_index, %data_type, %reason, "value mismatch");
                return Err(Error::ResultMismatch {
                    row: row_index,
                    column: col_index,
                    structured: structured_value.to_string(),
                    shell: shell_value.to_string(),
                    expected: expected_value.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ColumnSpec;
    use crate::generator::{ExpectedColumn, ExpectedRow, IdentifierMemo};

    fn dataset(columns: &[(&str, Value, DataType)]) -> ExpectedDataset {
        let mut row = ExpectedRow::new(Value::Text("k".into()), DataType::Text);
        for (name, value, data_type) in columns {
            row.push(ExpectedColumn {
                name: name.to_string(),
                value: value.clone(),
                data_type: *data_type,
            });
        }
        ExpectedDataset { rows: vec![row] }
    }

    fn structured(values: Vec<CqlValue>) -> StructuredRows {
        let columns = (0..values.len())
            .map(|i| ColumnSpec {
                name: format!("c{i}"),
                type_id: 0,
            })
            .collect();
        StructuredRows::new(columns, vec![values])
    }

    #[test]
    fn test_integer_mismatch_names_all_three_values() {
        let expected = dataset(&[("n", Value::Integer(BigInt::from(42)), DataType::Int)]);
        let rows = structured(vec![CqlValue::Text("k".into()), CqlValue::Int(42)]);
        let shell = vec![vec![ShellCell::new("KEY", "k"), ShellCell::new("n", "41")]];

        let err = verify_results(&rows, &shell, &expected).unwrap_err();
        let Error::ResultMismatch {
            row,
            column,
            structured,
            shell,
            expected,
        } = &err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!((*row, *column), (0, 1));
        assert_eq!(
            (structured.as_str(), shell.as_str(), expected.as_str()),
            ("42", "41", "42")
        );
        let message = err.to_string();
        assert!(message.contains("'42'") && message.contains("'41'"));
    }

    #[test]
    fn test_blob_column_found_by_hex_name() {
        let name_hex = hex::encode("col_name0_1");
        let value_hex = hex::encode("value0_1");
        let expected = dataset(&[(&name_hex, Value::Blob(value_hex.clone()), DataType::Blob)]);
        let rows = structured(vec![
            CqlValue::Text("k".into()),
            CqlValue::Blob(b"value0_1".to_vec()),
        ]);
        let shell = vec![vec![
            ShellCell::new("KEY", "k"),
            ShellCell::new("col_name0_1", value_hex),
        ]];
        verify_results(&rows, &shell, &expected).unwrap();
    }

    #[test]
    fn test_unknown_column() {
        let expected = dataset(&[("a", Value::Text("x".into()), DataType::Text)]);
        let rows = structured(vec![CqlValue::Text("k".into()), CqlValue::Text("x".into())]);
        let shell = vec![vec![ShellCell::new("KEY", "k"), ShellCell::new("b", "x")]];
        assert!(matches!(
            verify_results(&rows, &shell, &expected),
            Err(Error::UnknownColumn { row: 0, name }) if name == "b"
        ));
    }

    #[test]
    fn test_key_is_checked() {
        let expected = dataset(&[]);
        let rows = structured(vec![CqlValue::Text("other".into())]);
        let shell = vec![vec![ShellCell::new("KEY", "other")]];
        assert!(matches!(
            verify_results(&rows, &shell, &expected),
            Err(Error::ResultMismatch { column: 0, .. })
        ));
    }

    #[test]
    fn test_row_counts_must_agree() {
        let expected = dataset(&[]);
        let rows = StructuredRows::empty();
        assert!(matches!(
            verify_results(&rows, &[], &expected),
            Err(Error::RowCount { actual: 0, expected: 1, .. })
        ));

        let rows = structured(vec![CqlValue::Text("k".into())]);
        assert!(matches!(
            verify_results(&rows, &[], &expected),
            Err(Error::RowCount { source_name: "shell", .. })
        ));
    }

    #[test]
    fn test_float_tolerance() {
        let expected = Value::Float(-2.0);
        assert!(compare_value(DataType::Double, &CqlValue::Double(-2.0), "-2.01", &expected).is_match());
        assert!(!compare_value(DataType::Double, &CqlValue::Double(-2.0), "-2.5", &expected).is_match());
        assert!(compare_value(DataType::Float, &CqlValue::Float(0.0), "0.0", &Value::Float(0.0)).is_match());
        assert!(!compare_value(DataType::Float, &CqlValue::Float(0.0), "0.5", &Value::Float(0.0)).is_match());
    }

    #[test]
    fn test_varint_beyond_64_bits() {
        let big: BigInt = BigInt::from(1) << 300;
        assert!(compare_value(
            DataType::Varint,
            &CqlValue::Varint(big.clone()),
            &big.to_string(),
            &Value::Integer(big.clone())
        )
        .is_match());
    }

    #[test]
    fn test_boolean_is_case_insensitive() {
        assert!(compare_value(DataType::Boolean, &CqlValue::Boolean(true), "True", &Value::Boolean(true)).is_match());
        assert!(!compare_value(DataType::Boolean, &CqlValue::Boolean(true), "False", &Value::Boolean(true)).is_match());
    }

    #[test]
    fn test_uuid_compared_by_value() {
        let memo = IdentifierMemo::new();
        let id = memo.get_or_mint(0, 0);
        let shell = id.to_string().to_uppercase();
        assert!(compare_value(DataType::Uuid, &CqlValue::Uuid(id), &shell, &Value::Uuid(id)).is_match());
        assert!(!compare_value(DataType::Uuid, &CqlValue::Uuid(id), "not-a-uuid", &Value::Uuid(id)).is_match());
    }
}
