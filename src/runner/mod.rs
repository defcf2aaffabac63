//! Drives one configuration through schema creation, population and
//! validation, recording every statement for reproduction.

pub mod churn;
pub mod sweep;

pub use sweep::{
    FailurePolicy, SweepConfig, SweepOutcome, SweepResult, SweepRunner, SweepSummary,
};

use crate::bridge::DualBridge;
use crate::config::{param, ConfigKind, Configuration, Layout, ParamValue, NON_OPTION_PARAMS};
use crate::error::{Error, Result};
use crate::generator::{build, DataType, ExpectedDataset, IdentifierMemo};
use std::fmt;

/// Consistency levels cycled through by inserts, one per row
pub const CONSISTENCY_LEVELS: [&str; 2] = ["ANY", "ONE"];

/// Where a configuration is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Built,
    SchemaCreated,
    Populated,
    Validated,
    Failed,
}

impl RunState {
    pub fn name(self) -> &'static str {
        match self {
            RunState::Built => "built",
            RunState::SchemaCreated => "schema-created",
            RunState::Populated => "populated",
            RunState::Validated => "validated",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quote a generated value as a string literal
fn quoted(value: impl fmt::Display) -> String {
    format!("'{value}'")
}

/// `name=value AND ...` for every parameter in `params` except `skip`
fn options_string<'a>(
    params: impl IntoIterator<Item = (&'a String, &'a ParamValue)>,
    skip: &[&str],
) -> String {
    params
        .into_iter()
        .filter(|(name, _)| !skip.contains(&name.as_str()))
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `CREATE COLUMNFAMILY` for a table configuration
pub fn create_table_statement(config: &Configuration) -> Result<String> {
    let key_type = config.param(param::KEY_VALIDATION)?;
    let extra: String = config
        .static_columns()
        .iter()
        .map(|(name, data_type)| format!(", {name} {data_type}"))
        .collect();
    Ok(format!(
        "CREATE COLUMNFAMILY {} (KEY {key_type} PRIMARY KEY{extra}) WITH {};",
        config.object_name(),
        options_string(config.params(), &NON_OPTION_PARAMS),
    ))
}

/// Statements that write `dataset` into `table`
pub fn insert_statements(kind: ConfigKind, table: &str, dataset: &ExpectedDataset) -> Vec<String> {
    dataset
        .rows
        .iter()
        .enumerate()
        .map(|(row_num, row)| {
            if kind == ConfigKind::CounterTable {
                let increments = row
                    .columns()
                    .map(|c| format!("{0} = {0} + {1}", quoted(&c.name), c.value))
                    .collect::<Vec<_>>()
                    .join(", ");
                return format!(
                    "UPDATE {table} USING CONSISTENCY ONE SET {increments} WHERE KEY = {};",
                    quoted(&row.key)
                );
            }
            let names = row.columns().map(|c| quoted(&c.name)).collect::<Vec<_>>();
            let values = row.columns().map(|c| quoted(&c.value)).collect::<Vec<_>>();
            let consistency = CONSISTENCY_LEVELS[row_num % CONSISTENCY_LEVELS.len()];
            format!(
                "INSERT INTO {table} (KEY, {}) VALUES ({}, {}) USING CONSISTENCY {consistency};",
                names.join(", "),
                quoted(&row.key),
                values.join(", "),
            )
        })
        .collect()
}

/// Type generated column names are rendered as. Counter tables have no
/// comparator, so their names are text.
pub fn column_name_type(kind: ConfigKind, value_type: DataType) -> DataType {
    match kind {
        ConfigKind::CounterTable => DataType::Text,
        _ => value_type,
    }
}

/// `SELECT` of every row key in `dataset`
pub fn select_statement(table: &str, dataset: &ExpectedDataset) -> String {
    let keys = dataset
        .rows
        .iter()
        .map(|row| quoted(&row.key))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT * FROM {table} WHERE KEY IN ({keys});")
}

/// Runs one table configuration against a bridge
pub struct ConfigurationRunner<'a> {
    config: Configuration,
    bridge: &'a mut DualBridge,
    memo: &'a IdentifierMemo,
    state: RunState,
}

impl<'a> ConfigurationRunner<'a> {
    pub fn new(config: Configuration, bridge: &'a mut DualBridge, memo: &'a IdentifierMemo) -> Self {
        Self {
            config,
            bridge,
            memo,
            state: RunState::Built,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn into_config(self) -> Configuration {
        self.config
    }

    fn require(&self, action: &'static str, state: RunState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::InvalidState {
                action,
                state: self.state.name(),
            })
        }
    }

    /// Move to `next` on success and to `Failed` otherwise
    fn advance<T>(&mut self, result: Result<T>, next: RunState) -> Result<T> {
        match &result {
            Ok(_) => self.state = next,
            Err(e) => {
                tracing::debug!(config = %self.config, error = %e, "configuration failed");
                self.state = RunState::Failed;
            }
        }
        result
    }

    fn data_types(&self) -> Result<(DataType, DataType)> {
        Ok((
            self.config.data_type(param::KEY_VALIDATION)?,
            self.config.data_type(param::DEFAULT_VALIDATION)?,
        ))
    }

    fn expected(&self) -> Result<ExpectedDataset> {
        let (key_type, value_type) = self.data_types()?;
        Ok(build(
            key_type,
            column_name_type(self.config.kind(), value_type),
            value_type,
            &self.config.static_columns(),
            false,
            false,
            self.memo,
        ))
    }

    /// Create the keyspace if needed, then the table
    pub async fn setup(&mut self) -> Result<()> {
        self.require("set up", RunState::Built)?;
        let result = self.create_schema().await;
        self.advance(result, RunState::SchemaCreated)
    }

    async fn create_schema(&mut self) -> Result<()> {
        let keyspace = self
            .config
            .keyspace_config_mut()
            .ok_or(Error::InvalidConfiguration(ConfigKind::Keyspace.classname()))?;
        let name = keyspace.object_name();
        let options = options_string(keyspace.params(), &[]);
        let issued = self.bridge.create_keyspace(&name, &options).await?;
        for statement in issued {
            keyspace.record(statement);
        }

        let statement = create_table_statement(&self.config)?;
        let table = self.config.object_name();
        self.config.record(statement.clone());
        self.bridge.create_table(&statement, &table).await?;
        Ok(())
    }

    /// Write the generated rows
    pub async fn insert(&mut self) -> Result<()> {
        self.require("insert", RunState::SchemaCreated)?;
        let result = self.write_rows().await;
        self.advance(result, RunState::Populated)
    }

    async fn write_rows(&mut self) -> Result<()> {
        let dataset = self.expected()?;
        let table = self.config.object_name();
        for statement in insert_statements(self.config.kind(), &table, &dataset) {
            self.config.record(statement.clone());
            self.bridge.execute(&statement).await?;
        }
        Ok(())
    }

    /// Read every row back through both transports and verify it
    pub async fn validate(&mut self) -> Result<()> {
        self.require("validate", RunState::Populated)?;
        let result = self.check_rows().await;
        self.advance(result, RunState::Validated)
    }

    async fn check_rows(&mut self) -> Result<()> {
        let dataset = self.expected()?;
        let query = select_statement(&self.config.object_name(), &dataset);
        self.config.record(query.clone());
        match self.config.layout() {
            Layout::Static => self.bridge.select_static(&query, &dataset).await,
            Layout::Dynamic => self.bridge.select_dynamic(&query, &dataset).await,
        }
    }

    pub async fn run_everything(&mut self) -> Result<()> {
        self.setup().await?;
        self.insert().await?;
        self.validate().await
    }
}
