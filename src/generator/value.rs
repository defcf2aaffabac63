//! Deterministic per-(row, column) values for every supported data type.

use crate::error::{Error, Result};
use num_bigint::BigInt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const VALUE_PREFIX: &str = "value";
pub const COLUMN_NAME_PREFIX: &str = "col_name";
pub const ROW_KEY_PREFIX: &str = "key_name";

/// Column validation types understood by the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Uuid,
    Varchar,
    Varint,
}

impl DataType {
    pub const ALL: [DataType; 13] = [
        DataType::Ascii,
        DataType::Bigint,
        DataType::Blob,
        DataType::Boolean,
        DataType::Counter,
        DataType::Decimal,
        DataType::Double,
        DataType::Float,
        DataType::Int,
        DataType::Text,
        DataType::Uuid,
        DataType::Varchar,
        DataType::Varint,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DataType::Ascii => "ascii",
            DataType::Bigint => "bigint",
            DataType::Blob => "blob",
            DataType::Boolean => "boolean",
            DataType::Counter => "counter",
            DataType::Decimal => "decimal",
            DataType::Double => "double",
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Text => "text",
            DataType::Uuid => "uuid",
            DataType::Varchar => "varchar",
            DataType::Varint => "varint",
        }
    }

    pub fn is_text_like(self) -> bool {
        matches!(self, DataType::Ascii | DataType::Text | DataType::Varchar)
    }

    pub fn is_integer_like(self) -> bool {
        matches!(
            self,
            DataType::Int | DataType::Bigint | DataType::Varint | DataType::Counter
        )
    }

    pub fn is_float_like(self) -> bool {
        matches!(self, DataType::Float | DataType::Double | DataType::Decimal)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        let found = match lowered.as_str() {
            // validator class name used by counter tables
            "countercolumntype" => Some(DataType::Counter),
            name => DataType::ALL.into_iter().find(|t| t.name() == name),
        };
        found.ok_or_else(|| Error::UnsupportedType(s.to_string()))
    }
}

/// A generated value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(BigInt),
    Float(f64),
    Boolean(bool),
    /// Hex encoded bytes
    Blob(String),
    Uuid(Uuid),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) | Value::Blob(s) => f.write_str(s),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
        }
    }
}

/// Identifiers minted for uuid columns, keyed by (row, column)
///
/// Random identifiers are not reproducible, so the first one minted for a
/// position is remembered for the lifetime of the memo.
#[derive(Debug, Default)]
pub struct IdentifierMemo {
    ids: Mutex<HashMap<(usize, usize), Uuid>>,
}

impl IdentifierMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_mint(&self, row: usize, col: usize) -> Uuid {
        *self.ids.lock().entry((row, col)).or_insert_with(Uuid::new_v4)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scaled(row: usize, col: usize, shift: u32) -> BigInt {
    BigInt::from(row) * BigInt::from(col) * (BigInt::from(1) << shift)
}

/// Generate the value stored at (row, col) for `data_type`
pub fn generate_value(
    row: usize,
    col: usize,
    data_type: DataType,
    prefix: &str,
    memo: &IdentifierMemo,
) -> Value {
    match data_type {
        DataType::Ascii | DataType::Text | DataType::Varchar => {
            Value::Text(format!("{prefix}{row}_{col}"))
        }
        DataType::Int | DataType::Counter => Value::Integer(BigInt::from(row as i64 - col as i64)),
        DataType::Bigint => Value::Integer(scaled(row, col, 24)),
        DataType::Varint => Value::Integer(scaled(row, col, 300)),
        DataType::Float | DataType::Double | DataType::Decimal => {
            Value::Float((row as i64 - col as i64) as f64)
        }
        DataType::Boolean => Value::Boolean((row + col) % 2 == 0),
        // the prefix is intentionally not applied, so blob names and values collide
        DataType::Blob => Value::Blob(hex::encode(format!("{VALUE_PREFIX}{row}_{col}"))),
        DataType::Uuid => Value::Uuid(memo.get_or_mint(row, col)),
    }
}

/// Generate the name of a dynamic column
pub fn generate_col_name(row: usize, col: usize, data_type: DataType, memo: &IdentifierMemo) -> String {
    generate_value(row, col, data_type, COLUMN_NAME_PREFIX, memo).to_string()
}

/// Generate the key of a row
pub fn generate_row_key(row: usize, key_type: DataType, memo: &IdentifierMemo) -> Value {
    generate_value(row, 0, key_type, ROW_KEY_PREFIX, memo)
}
