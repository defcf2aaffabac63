use crate::backends::BackendError;
use std::time::Duration;

/// Errors raised while enumerating, running or verifying a configuration
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter '{name}' = {value} for {kind}")]
    InvalidParameter {
        kind: &'static str,
        name: String,
        value: String,
    },

    #[error("{kind} is missing parameter '{name}'")]
    MissingParameter { kind: &'static str, name: String },

    #[error("configuration is not valid for {0}")]
    InvalidConfiguration(&'static str),

    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    #[error(transparent)]
    Transport(#[from] BackendError),

    #[error("transient failure persisted after {attempts} attempts: {source}")]
    TransientExhausted {
        attempts: usize,
        #[source]
        source: BackendError,
    },

    #[error("statement rejected: {statement}: {source}")]
    BadStatement {
        statement: String,
        #[source]
        source: BackendError,
    },

    #[error("statement contains the shell delimiter '|': {0}")]
    UnsupportedStatement(String),

    #[error("shell timed out {attempts} times on: {statement}")]
    ShellTimeout { attempts: usize, statement: String },

    #[error("shell reported an error: {0}")]
    ShellError(String),

    #[error("could not extract values from shell output (expected {expected} per slot, found {found}): {line}")]
    ShellOutputShape {
        expected: usize,
        found: usize,
        line: String,
    },

    #[error(
        "a value from the structured and shell transports did not match at row {row}, column {column}. structured: '{structured}' shell: '{shell}' expected: '{expected}'"
    )]
    ResultMismatch {
        row: usize,
        column: usize,
        structured: String,
        shell: String,
        expected: String,
    },

    #[error("row {row} has no expected column named '{name}'")]
    UnknownColumn { row: usize, name: String },

    #[error("{source_name} returned {actual} rows, expected {expected}")]
    RowCount {
        source_name: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("invalid reproduction token: {0}")]
    Token(String),

    #[error("cannot {action} in state {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error("schema disagreement on node {node}: counted {actual} tables, expected {expected}")]
    SchemaDisagreement {
        node: usize,
        actual: usize,
        expected: usize,
    },

    #[error("cluster controller failed: {0}")]
    Cluster(String),

    #[error("timed out after {0:?} waiting for log pattern")]
    LogWaitTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
