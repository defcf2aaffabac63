pub mod native;
pub mod shell;
pub mod thrift;

use async_trait::async_trait;
use num_bigint::BigInt;
use regex::Regex;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A typed cell returned by the structured transport
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Null,
    Ascii(String),
    Text(String),
    BigInt(i64),
    Counter(i64),
    Int(i32),
    Varint(BigInt),
    Float(f32),
    Double(f64),
    Decimal { unscaled: BigInt, scale: i32 },
    Boolean(bool),
    Blob(Vec<u8>),
    Uuid(Uuid),
    Timestamp(i64),
    /// A type this client does not decode, kept as raw bytes
    Other { type_id: u16, raw: Vec<u8> },
}

impl CqlValue {
    /// Integer view of the value, parsing text when needed
    pub fn to_bigint(&self) -> Option<BigInt> {
        match self {
            CqlValue::BigInt(v) | CqlValue::Counter(v) | CqlValue::Timestamp(v) => {
                Some(BigInt::from(*v))
            }
            CqlValue::Int(v) => Some(BigInt::from(*v)),
            CqlValue::Varint(v) => Some(v.clone()),
            CqlValue::Ascii(s) | CqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Floating point view of the value, parsing text when needed
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            CqlValue::Float(v) => Some(f64::from(*v)),
            CqlValue::Double(v) => Some(*v),
            CqlValue::Decimal { unscaled, scale } => {
                format!("{unscaled}e{}", -scale).parse().ok()
            }
            CqlValue::Ascii(s) | CqlValue::Text(s) => s.trim().parse().ok(),
            other => other.to_bigint().and_then(|v| v.to_string().parse().ok()),
        }
    }

    /// Raw bytes of a blob; text values are taken as their UTF-8 bytes
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            CqlValue::Blob(b) => Some(b.clone()),
            CqlValue::Ascii(s) | CqlValue::Text(s) => Some(s.as_bytes().to_vec()),
            CqlValue::Other { raw, .. } => Some(raw.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for CqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlValue::Null => Ok(()),
            CqlValue::Ascii(s) | CqlValue::Text(s) => f.write_str(s),
            CqlValue::BigInt(v) | CqlValue::Counter(v) | CqlValue::Timestamp(v) => {
                write!(f, "{v}")
            }
            CqlValue::Int(v) => write!(f, "{v}"),
            CqlValue::Varint(v) => write!(f, "{v}"),
            CqlValue::Float(v) => write!(f, "{v:?}"),
            CqlValue::Double(v) => write!(f, "{v:?}"),
            CqlValue::Decimal { .. } => match self.to_f64() {
                Some(v) => write!(f, "{v:?}"),
                None => f.write_str("NaN"),
            },
            CqlValue::Boolean(v) => write!(f, "{v}"),
            CqlValue::Blob(b) => f.write_str(&hex::encode(b)),
            CqlValue::Uuid(u) => write!(f, "{u}"),
            CqlValue::Other { raw, .. } => f.write_str(&hex::encode(raw)),
        }
    }
}

/// Column metadata of a structured result
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub type_id: u16,
}

/// Rows returned by the structured transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredRows {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<CqlValue>>,
}

impl StructuredRows {
    /// Result of a statement that returns no rows
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<ColumnSpec>, rows: Vec<Vec<CqlValue>>) -> Self {
        Self { columns, rows }
    }
}

/// A session on the structured query transport
#[async_trait]
pub trait StructuredSession: Send {
    /// Execute one statement and return its rows
    async fn execute(&mut self, statement: &str) -> Result<StructuredRows, BackendError>;

    /// Close the session
    async fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// Opens independent structured sessions, one per call
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Number of nodes sessions can be opened against
    fn node_count(&self) -> usize;

    /// Open a new session to the given node
    async fn connect(&self, node: usize) -> Result<Box<dyn StructuredSession>, BackendError>;
}

/// Outcome of waiting on an interactive shell
#[derive(Debug, Clone, PartialEq)]
pub struct ShellMatch {
    /// Index of the pattern that matched first in the output
    pub index: usize,
    /// Output received before the match
    pub before: String,
}

/// A line-oriented interactive shell
#[async_trait]
pub trait InteractiveShell: Send {
    /// Send one line of input
    async fn send_line(&mut self, line: &str) -> Result<(), BackendError>;

    /// Wait until one of `patterns` appears in the output
    async fn expect(
        &mut self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<ShellMatch, BackendError>;

    /// Drop any output received but not yet matched
    async fn discard_pending(&mut self);
}

/// Server error codes of the native protocol
pub mod error_code {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const BAD_CREDENTIALS: i32 = 0x0100;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub const TRUNCATE_ERROR: i32 = 0x1003;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const SYNTAX_ERROR: i32 = 0x2000;
    pub const UNAUTHORIZED: i32 = 0x2100;
    pub const INVALID: i32 = 0x2200;
    pub const CONFIG_ERROR: i32 = 0x2300;
    pub const ALREADY_EXISTS: i32 = 0x2400;
    pub const UNPREPARED: i32 = 0x2500;
}

/// Errors that can occur in transports
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error 0x{code:04x}: {message}")]
    Server { code: i32, message: String },

    /// The server could not serve the request right now
    #[error("operational error: {0}")]
    Operational(String),

    #[error("connection closed")]
    Closed,

    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("backend not available: {0}")]
    NotAvailable(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Whether the server reported that the object being created already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::Server { code, .. } if *code == error_code::ALREADY_EXISTS)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                BackendError::Closed
            }
            _ => BackendError::Io(e.to_string()),
        }
    }
}

/// Retry classification of a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The operation may succeed if retried
    Transient,
    /// Retrying will not help
    Fatal,
}

/// Classify a transport error for the retry loops
pub fn classify(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::Server { code, .. } => match *code {
            error_code::UNAVAILABLE
            | error_code::OVERLOADED
            | error_code::IS_BOOTSTRAPPING
            | error_code::TRUNCATE_ERROR
            | error_code::WRITE_TIMEOUT
            | error_code::READ_TIMEOUT => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        },
        BackendError::Timeout(_) | BackendError::Operational(_) => ErrorClass::Transient,
        BackendError::Connect(_)
        | BackendError::Io(_)
        | BackendError::Protocol(_)
        | BackendError::Closed
        | BackendError::Spawn(_)
        | BackendError::NotAvailable(_) => ErrorClass::Fatal,
    }
}
