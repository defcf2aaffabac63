//! Schema configurations and their parameter spaces.
//!
//! A configuration is either a keyspace or a table. Each kind declares the
//! legal values of every tunable parameter; the Cartesian product of those
//! values, filtered by the kind's validity rules, is the set of schemas the
//! sweep exercises.

pub mod token;

use crate::error::{Error, Result};
use crate::generator::DataType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Longest keyspace or table name the transports accept
pub const MAX_NAME_LEN: usize = 32;

/// Types exercised as table comparators and validators
pub const TABLE_DATA_TYPES: [DataType; 4] = [
    DataType::Ascii,
    DataType::Blob,
    DataType::Text,
    DataType::Varchar,
];

/// Each static column type is declared this many times so some survive a delete
pub const STATIC_COLUMN_COPIES: usize = 4;

/// Parameter names
pub mod param {
    pub const STRATEGY_CLASS: &str = "strategy_class";
    pub const REPLICATION_FACTOR: &str = "strategy_options:replication_factor";
    pub const DISPOSITION: &str = "disposition";
    pub const COMMENT: &str = "comment";
    pub const READ_REPAIR_CHANCE: &str = "read_repair_chance";
    pub const GC_GRACE_SECONDS: &str = "gc_grace_seconds";
    pub const MIN_COMPACTION_THRESHOLD: &str = "min_compaction_threshold";
    pub const MAX_COMPACTION_THRESHOLD: &str = "max_compaction_threshold";
    pub const REPLICATE_ON_WRITE: &str = "replicate_on_write";
    pub const COMPARATOR: &str = "comparator";
    pub const DEFAULT_VALIDATION: &str = "default_validation";
    pub const KEY_VALIDATION: &str = "key_validation_class";
}

/// Parameters that shape the table but are not table options
pub const NON_OPTION_PARAMS: [&str; 2] = [param::KEY_VALIDATION, param::DISPOSITION];

/// A legal parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:?}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

/// Parameter name to its legal values, in enumeration order
pub type ParameterSpace = IndexMap<&'static str, Vec<ParamValue>>;

/// Chosen parameter values; sorted so serialization is stable
pub type Params = BTreeMap<String, ParamValue>;

/// Row layout of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Fixed, pre-declared typed columns
    Static,
    /// Column names generated per row
    Dynamic,
}

/// The closed set of configuration kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKind {
    #[serde(rename = "KeyspaceConfiguration")]
    Keyspace,
    #[serde(rename = "StandardTableConfiguration")]
    StandardTable,
    #[serde(rename = "CounterTableConfiguration")]
    CounterTable,
}

fn values<T: Into<ParamValue> + Copy>(items: &[T]) -> Vec<ParamValue> {
    items.iter().map(|v| (*v).into()).collect()
}

fn type_values(types: &[DataType]) -> Vec<ParamValue> {
    types.iter().map(|t| ParamValue::from(t.name())).collect()
}

impl ConfigKind {
    pub const TABLE_KINDS: [ConfigKind; 2] = [ConfigKind::StandardTable, ConfigKind::CounterTable];

    pub fn classname(self) -> &'static str {
        match self {
            ConfigKind::Keyspace => "KeyspaceConfiguration",
            ConfigKind::StandardTable => "StandardTableConfiguration",
            ConfigKind::CounterTable => "CounterTableConfiguration",
        }
    }

    pub fn is_table(self) -> bool {
        !matches!(self, ConfigKind::Keyspace)
    }

    /// Parameters shared by every table kind
    fn table_parameters() -> ParameterSpace {
        let mut out = ParameterSpace::new();
        out.insert(param::DISPOSITION, values(&["static", "dynamic"]));
        out.insert(param::COMMENT, values(&["'a comment'", "''"]));
        out.insert(param::READ_REPAIR_CHANCE, values(&[0.2, 0.0, 1.0]));
        out.insert(param::GC_GRACE_SECONDS, values(&[1000i64, 864000]));
        out.insert(param::MIN_COMPACTION_THRESHOLD, values(&[2i64, 4]));
        out.insert(param::MAX_COMPACTION_THRESHOLD, values(&[16i64, 32]));
        out.insert(param::REPLICATE_ON_WRITE, values(&["false", "true"]));
        out
    }

    /// All parameters of this kind with their legal values
    pub fn available_parameters(self) -> ParameterSpace {
        let mut out = ParameterSpace::new();
        match self {
            ConfigKind::Keyspace => {
                out.insert(param::STRATEGY_CLASS, values(&["SimpleStrategy"]));
                out.insert(param::REPLICATION_FACTOR, values(&["1", "3"]));
            }
            ConfigKind::StandardTable => {
                out.insert(param::COMPARATOR, type_values(&TABLE_DATA_TYPES));
                out.insert(param::DEFAULT_VALIDATION, type_values(&TABLE_DATA_TYPES));
                out.insert(param::KEY_VALIDATION, type_values(&[DataType::Text]));
                out.extend(Self::table_parameters());
            }
            ConfigKind::CounterTable => {
                out.insert(param::DEFAULT_VALIDATION, values(&["CounterColumnType"]));
                out.insert(param::KEY_VALIDATION, type_values(&TABLE_DATA_TYPES));
                out.extend(Self::table_parameters());
            }
        }
        out
    }

    /// Every combination of parameter values, valid or not
    pub fn parameter_permutations(self) -> Vec<Params> {
        let mut out = vec![Params::new()];
        for (name, choices) in self.available_parameters() {
            out = out
                .into_iter()
                .flat_map(|partial| {
                    choices.iter().map(move |value| {
                        let mut next = partial.clone();
                        next.insert(name.to_string(), value.clone());
                        next
                    })
                })
                .collect();
        }
        out
    }

    /// Constraints that cannot be expressed as independent value ranges
    pub fn is_valid(self, params: &Params) -> bool {
        match self {
            ConfigKind::Keyspace | ConfigKind::CounterTable => true,
            ConfigKind::StandardTable => standard_table_is_valid(params),
        }
    }
}

fn standard_table_is_valid(params: &Params) -> bool {
    let text = |name: &str| params.get(name).and_then(ParamValue::as_str);
    let comparator = text(param::COMPARATOR);
    let validation = text(param::DEFAULT_VALIDATION);

    // comparators only apply to dynamic tables
    if text(param::DISPOSITION) == Some("static") && comparator != Some("varchar") {
        return false;
    }

    match validation {
        Some(
            "bigint" | "boolean" | "decimal" | "double" | "blob" | "ascii" | "float" | "int"
            | "uuid" | "varint",
        ) if comparator != validation => false,
        Some("text" | "varchar") if !matches!(comparator, Some("text" | "varchar")) => false,
        _ => true,
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.classname())
    }
}

impl FromStr for ConfigKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyspace" => Ok(ConfigKind::Keyspace),
            "standard" => Ok(ConfigKind::StandardTable),
            "counter" => Ok(ConfigKind::CounterTable),
            other => ConfigKind::TABLE_KINDS
                .into_iter()
                .chain([ConfigKind::Keyspace])
                .find(|k| k.classname().eq_ignore_ascii_case(other))
                .ok_or_else(|| format!("unknown configuration kind: {s}")),
        }
    }
}

/// A keyspace or table configuration and the statements run for it so far
#[derive(Debug, Clone)]
pub struct Configuration {
    kind: ConfigKind,
    params: Params,
    name: Option<String>,
    keyspace: Option<Box<Configuration>>,
    log: Vec<String>,
}

impl Configuration {
    /// Create a keyspace configuration
    pub fn keyspace(params: Params) -> Result<Self> {
        Self::new(ConfigKind::Keyspace, params, None)
    }

    /// Create a table configuration owned by `keyspace`
    pub fn table(kind: ConfigKind, keyspace: Configuration, params: Params) -> Result<Self> {
        if !kind.is_table() || keyspace.kind != ConfigKind::Keyspace {
            return Err(Error::InvalidConfiguration(kind.classname()));
        }
        Self::new(kind, params, Some(Box::new(keyspace)))
    }

    fn new(kind: ConfigKind, params: Params, keyspace: Option<Box<Configuration>>) -> Result<Self> {
        let space = kind.available_parameters();
        for (name, value) in &params {
            let legal = space
                .get(name.as_str())
                .is_some_and(|choices| choices.contains(value));
            if !legal {
                return Err(Error::InvalidParameter {
                    kind: kind.classname(),
                    name: name.clone(),
                    value: value.to_string(),
                });
            }
        }
        Ok(Self {
            kind,
            params,
            name: None,
            keyspace,
            log: Vec::new(),
        })
    }

    /// Use a fixed object name instead of the content hash
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind(&self) -> ConfigKind {
        self.kind
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The owning keyspace of a table configuration
    pub fn keyspace_config(&self) -> Option<&Configuration> {
        self.keyspace.as_deref()
    }

    pub fn keyspace_config_mut(&mut self) -> Option<&mut Configuration> {
        self.keyspace.as_deref_mut()
    }

    pub fn is_valid(&self) -> bool {
        self.kind.is_valid(&self.params)
    }

    pub fn param(&self, name: &str) -> Result<&ParamValue> {
        self.params.get(name).ok_or_else(|| Error::MissingParameter {
            kind: self.kind.classname(),
            name: name.to_string(),
        })
    }

    /// A type-valued parameter, such as the key validation class
    pub fn data_type(&self, name: &str) -> Result<DataType> {
        self.param(name)?.to_string().parse()
    }

    /// Columns declared up front; empty for dynamic tables
    pub fn static_columns(&self) -> Vec<(String, DataType)> {
        let is_static = self.kind == ConfigKind::StandardTable
            && self.params.get(param::DISPOSITION).and_then(ParamValue::as_str) == Some("static");
        if !is_static {
            return Vec::new();
        }
        (0..STATIC_COLUMN_COPIES)
            .flat_map(|i| TABLE_DATA_TYPES.iter().map(move |t| (format!("col_{i}_{t}"), *t)))
            .collect()
    }

    pub fn layout(&self) -> Layout {
        if self.static_columns().is_empty() {
            Layout::Dynamic
        } else {
            Layout::Static
        }
    }

    /// Hex digest of the kind and parameters
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.classname().as_bytes());
        for (name, value) in &self.params {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// The keyspace or table name used on the server
    pub fn object_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let prefix = if self.kind.is_table() { "cf_" } else { "ks_" };
        let mut name = format!("{prefix}{}", self.content_hash());
        name.truncate(MAX_NAME_LEN);
        name
    }

    /// Append an executed statement to the reproduction log
    pub fn record(&mut self, statement: impl Into<String>) {
        self.log.push(statement.into());
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Every statement needed to reproduce this configuration, owner first
    pub fn log_string(&self) -> String {
        match &self.keyspace {
            Some(keyspace) if !keyspace.log.is_empty() => {
                format!("{}\n{}", keyspace.log_string(), self.log.join("\n"))
            }
            _ => self.log.join("\n"),
        }
    }

    /// Drop the reproduction log after a successful run
    pub fn clear_log(&mut self) {
        self.log = Vec::new();
        if let Some(keyspace) = self.keyspace.as_deref_mut() {
            keyspace.clear_log();
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.kind)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

/// Every valid table configuration of the given kinds, across every keyspace permutation
pub fn all_configurations(table_kinds: &[ConfigKind]) -> Result<Vec<Configuration>> {
    let mut out = Vec::new();
    for keyspace_params in ConfigKind::Keyspace.parameter_permutations() {
        let keyspace = Configuration::keyspace(keyspace_params)?;
        for kind in table_kinds {
            for params in kind.parameter_permutations() {
                if kind.is_valid(&params) {
                    out.push(Configuration::table(*kind, keyspace.clone(), params)?);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard(overrides: &[(&str, &str)]) -> Params {
        let mut params: Params = ConfigKind::StandardTable
            .available_parameters()
            .into_iter()
            .map(|(name, choices)| (name.to_string(), choices[0].clone()))
            .collect();
        for (name, value) in overrides {
            params.insert(name.to_string(), ParamValue::from(*value));
        }
        params
    }

    fn keyspace() -> Configuration {
        Configuration::keyspace(ConfigKind::Keyspace.parameter_permutations().remove(0)).unwrap()
    }

    #[test]
    fn test_permutations_use_only_available_values() {
        for kind in [ConfigKind::Keyspace, ConfigKind::StandardTable, ConfigKind::CounterTable] {
            let space = kind.available_parameters();
            let expected: usize = space.values().map(Vec::len).product();
            let perms = kind.parameter_permutations();
            assert_eq!(perms.len(), expected, "{kind}");
            for perm in &perms {
                assert_eq!(perm.len(), space.len());
                for (name, value) in perm {
                    assert!(space[name.as_str()].contains(value), "{kind}: {name}={value}");
                }
            }
        }
    }

    #[test]
    fn test_keyspace_permutations() {
        let perms = ConfigKind::Keyspace.parameter_permutations();
        assert_eq!(perms.len(), 2);
        assert_eq!(perms[1][param::REPLICATION_FACTOR], ParamValue::from("3"));
    }

    #[test]
    fn test_static_requires_varchar_comparator() {
        let params = standard(&[
            (param::DISPOSITION, "static"),
            (param::COMPARATOR, "text"),
            (param::DEFAULT_VALIDATION, "text"),
        ]);
        assert!(!ConfigKind::StandardTable.is_valid(&params));

        let params = standard(&[
            (param::DISPOSITION, "static"),
            (param::COMPARATOR, "varchar"),
            (param::DEFAULT_VALIDATION, "text"),
        ]);
        assert!(ConfigKind::StandardTable.is_valid(&params));
    }

    #[test]
    fn test_fixed_validation_requires_matching_comparator() {
        let params = standard(&[
            (param::DISPOSITION, "dynamic"),
            (param::COMPARATOR, "ascii"),
            (param::DEFAULT_VALIDATION, "blob"),
        ]);
        assert!(!ConfigKind::StandardTable.is_valid(&params));

        let params = standard(&[
            (param::DISPOSITION, "dynamic"),
            (param::COMPARATOR, "blob"),
            (param::DEFAULT_VALIDATION, "blob"),
        ]);
        assert!(ConfigKind::StandardTable.is_valid(&params));
    }

    #[test]
    fn test_text_validation_accepts_text_comparators() {
        for comparator in ["text", "varchar"] {
            let params = standard(&[
                (param::DISPOSITION, "dynamic"),
                (param::COMPARATOR, comparator),
                (param::DEFAULT_VALIDATION, "varchar"),
            ]);
            assert!(ConfigKind::StandardTable.is_valid(&params));
        }
        let params = standard(&[
            (param::DISPOSITION, "dynamic"),
            (param::COMPARATOR, "ascii"),
            (param::DEFAULT_VALIDATION, "text"),
        ]);
        assert!(!ConfigKind::StandardTable.is_valid(&params));
    }

    #[test]
    fn test_counter_space() {
        let space = ConfigKind::CounterTable.available_parameters();
        assert_eq!(
            space[param::DEFAULT_VALIDATION],
            vec![ParamValue::from("CounterColumnType")]
        );
        assert_eq!(space[param::KEY_VALIDATION].len(), TABLE_DATA_TYPES.len());
        assert!(!space.contains_key(param::COMPARATOR));
    }

    #[test]
    fn test_rejects_unknown_parameter_and_value() {
        let mut params = standard(&[]);
        params.insert("bloom_filter".into(), ParamValue::from("x"));
        assert!(matches!(
            Configuration::table(ConfigKind::StandardTable, keyspace(), params),
            Err(Error::InvalidParameter { .. })
        ));

        let params = standard(&[(param::COMMENT, "'other'")]);
        assert!(matches!(
            Configuration::table(ConfigKind::StandardTable, keyspace(), params),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_table_requires_keyspace_owner() {
        let owner = Configuration::table(ConfigKind::StandardTable, keyspace(), standard(&[])).unwrap();
        assert!(Configuration::table(ConfigKind::StandardTable, owner, standard(&[])).is_err());
    }

    #[test]
    fn test_static_columns() {
        let params = standard(&[(param::DISPOSITION, "static"), (param::COMPARATOR, "varchar")]);
        let config = Configuration::table(ConfigKind::StandardTable, keyspace(), params).unwrap();
        let cols = config.static_columns();
        assert_eq!(cols.len(), 16);
        assert_eq!(cols[0], ("col_0_ascii".to_string(), DataType::Ascii));
        assert_eq!(cols[5], ("col_1_blob".to_string(), DataType::Blob));
        assert_eq!(config.layout(), Layout::Static);

        let dynamic = Configuration::table(
            ConfigKind::StandardTable,
            keyspace(),
            standard(&[(param::DISPOSITION, "dynamic")]),
        )
        .unwrap();
        assert!(dynamic.static_columns().is_empty());
        assert_eq!(dynamic.layout(), Layout::Dynamic);
    }

    #[test]
    fn test_object_names() {
        let config = Configuration::table(ConfigKind::StandardTable, keyspace(), standard(&[])).unwrap();
        let name = config.object_name();
        assert!(name.starts_with("cf_"));
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert_eq!(name, config.clone().object_name());
        assert!(keyspace().object_name().starts_with("ks_"));
        assert_eq!(config.with_name("users").object_name(), "users");
    }

    #[test]
    fn test_log_string_includes_owner() {
        let mut config = Configuration::table(ConfigKind::StandardTable, keyspace(), standard(&[])).unwrap();
        config
            .keyspace_config_mut()
            .unwrap()
            .record("CREATE KEYSPACE ks WITH x=1");
        config.record("CREATE COLUMNFAMILY cf (KEY text PRIMARY KEY)");
        assert_eq!(
            config.log_string(),
            "CREATE KEYSPACE ks WITH x=1\nCREATE COLUMNFAMILY cf (KEY text PRIMARY KEY)"
        );
        config.clear_log();
        config.record("SELECT * FROM cf");
        assert_eq!(config.log_string(), "SELECT * FROM cf");
        config.clear_log();
        assert!(config.log().is_empty());
        assert!(config.keyspace_config().unwrap().log().is_empty());
    }

    #[test]
    fn test_all_configurations_are_valid() {
        let all = all_configurations(&[ConfigKind::StandardTable]).unwrap();
        assert!(!all.is_empty());
        assert!(all.iter().all(Configuration::is_valid));
        assert!(all.iter().all(|c| c.keyspace_config().is_some()));
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("standard".parse::<ConfigKind>().unwrap(), ConfigKind::StandardTable);
        assert_eq!(
            "CounterTableConfiguration".parse::<ConfigKind>().unwrap(),
            ConfigKind::CounterTable
        );
        assert!("super".parse::<ConfigKind>().is_err());
    }
}
