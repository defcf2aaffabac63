use super::value::{
    generate_col_name, generate_row_key, generate_value, DataType, IdentifierMemo, Value,
    VALUE_PREFIX,
};
use indexmap::IndexMap;

/// Rows generated per table
pub const NUM_ROWS: usize = 5;
/// Columns generated per row of a dynamic table
pub const NUM_DYNAMIC_COLUMNS: usize = 10;
/// Only two distinct boolean values exist
pub const NUM_BOOLEAN_COLUMNS: usize = 2;

/// Column rewritten by the update delta
pub const UPDATED_COLUMN: usize = 1;
/// Column index used to generate the updated value
pub const UPDATE_SOURCE_COLUMN: usize = 2;
/// Column removed from every row by the delete delta
pub const DELETED_COLUMN: usize = 4;
/// Row removed by the delete delta
pub const DELETED_ROW: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedColumn {
    pub name: String,
    pub value: Value,
    pub data_type: DataType,
}

/// One expected row. Columns keep insertion order and are addressable by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedRow {
    pub key: Value,
    pub key_type: DataType,
    columns: IndexMap<String, ExpectedColumn>,
}

impl ExpectedRow {
    pub fn new(key: Value, key_type: DataType) -> Self {
        Self {
            key,
            key_type,
            columns: IndexMap::new(),
        }
    }

    pub fn push(&mut self, column: ExpectedColumn) {
        self.columns.insert(column.name.clone(), column);
    }

    /// Columns in insertion order
    pub fn columns(&self) -> impl Iterator<Item = &ExpectedColumn> {
        self.columns.values()
    }

    pub fn column_at(&self, index: usize) -> Option<&ExpectedColumn> {
        self.columns.get_index(index).map(|(_, c)| c)
    }

    pub fn column(&self, name: &str) -> Option<&ExpectedColumn> {
        self.columns.get(name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn column_at_mut(&mut self, index: usize) -> Option<&mut ExpectedColumn> {
        self.columns.get_index_mut(index).map(|(_, c)| c)
    }

    fn remove_at(&mut self, index: usize) -> Option<ExpectedColumn> {
        self.columns.shift_remove_index(index).map(|(_, c)| c)
    }
}

/// Expected content of one table
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedDataset {
    pub rows: Vec<ExpectedRow>,
}

impl ExpectedDataset {
    /// Build the rows initially inserted into a table.
    ///
    /// A non-empty `static_columns` list is used verbatim for every row;
    /// otherwise each row gets column names generated as `name_type` and
    /// values of `value_type`.
    pub fn inserted(
        key_type: DataType,
        name_type: DataType,
        value_type: DataType,
        static_columns: &[(String, DataType)],
        memo: &IdentifierMemo,
    ) -> Self {
        let rows = (0..NUM_ROWS)
            .map(|row_num| {
                let key = generate_row_key(row_num, key_type, memo);
                let layout: Vec<(String, DataType)> = if static_columns.is_empty() {
                    let count = if value_type == DataType::Boolean {
                        NUM_BOOLEAN_COLUMNS
                    } else {
                        NUM_DYNAMIC_COLUMNS
                    };
                    (0..count)
                        .map(|col| (generate_col_name(row_num, col, name_type, memo), value_type))
                        .collect()
                } else {
                    static_columns.to_vec()
                };

                let mut row = ExpectedRow::new(key, key_type);
                for (col_num, (name, data_type)) in layout.into_iter().enumerate() {
                    let value = generate_value(row_num, col_num, data_type, VALUE_PREFIX, memo);
                    row.push(ExpectedColumn {
                        name,
                        value,
                        data_type,
                    });
                }
                row
            })
            .collect();
        Self { rows }
    }

    /// Overwrite the second column of every row with a value generated from
    /// a different column index, as a later update would.
    pub fn apply_update(&mut self, memo: &IdentifierMemo) {
        for (row_num, row) in self.rows.iter_mut().enumerate() {
            if let Some(col) = row.column_at_mut(UPDATED_COLUMN) {
                col.value = generate_value(row_num, UPDATE_SOURCE_COLUMN, col.data_type, VALUE_PREFIX, memo);
            }
        }
    }

    /// Remove the fifth column of every row, then the second row.
    /// Rows with fewer than five columns keep their columns.
    pub fn apply_delete(&mut self) {
        for row in &mut self.rows {
            row.remove_at(DELETED_COLUMN);
        }
        if self.rows.len() > DELETED_ROW {
            self.rows.remove(DELETED_ROW);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build everything a table should contain after the requested mutations.
/// The update is applied before the delete.
pub fn build(
    key_type: DataType,
    name_type: DataType,
    value_type: DataType,
    static_columns: &[(String, DataType)],
    has_update: bool,
    has_delete: bool,
    memo: &IdentifierMemo,
) -> ExpectedDataset {
    let mut dataset = ExpectedDataset::inserted(key_type, name_type, value_type, static_columns, memo);
    if has_update {
        dataset.apply_update(memo);
    }
    if has_delete {
        dataset.apply_delete();
    }
    dataset
}
