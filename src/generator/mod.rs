//! Expected data generation.
//!
//! Values are a pure function of (row, column, type) so the data a table
//! should contain can be rebuilt at any time instead of being stored.

pub mod dataset;
pub mod value;

pub use dataset::{build, ExpectedColumn, ExpectedDataset, ExpectedRow, NUM_DYNAMIC_COLUMNS, NUM_ROWS};
pub use value::{
    generate_col_name, generate_row_key, generate_value, DataType, IdentifierMemo, Value,
};
