//! Thrift client for the structured transport.
//!
//! The sweep's statements are CQL2, which servers only accept through
//! `execute_cql_query` on their Thrift interface. Messages use the strict
//! binary protocol inside a framed transport:
//! - 4 bytes: frame length (big-endian)
//! - 4 bytes: protocol version | message type
//! - string: method name
//! - 4 bytes: sequence id
//! - the argument or result struct

use super::native::{decode_cell, type_id};
use super::{
    error_code, BackendError, ColumnSpec, CqlValue, SessionFactory, StructuredRows,
    StructuredSession,
};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

/// Largest frame accepted from the server (256 MB)
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Nesting accepted when decoding values
const MAX_DEPTH: usize = 64;

/// `Compression.NONE` argument of `execute_cql_query`
pub const COMPRESSION_NONE: i32 = 2;

pub mod message_type {
    pub const CALL: u8 = 1;
    pub const REPLY: u8 = 2;
    pub const EXCEPTION: u8 = 3;
}

/// Wire type ids
pub mod ttype {
    pub const STOP: u8 = 0;
    pub const BOOL: u8 = 2;
    pub const BYTE: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const I16: u8 = 6;
    pub const I32: u8 = 8;
    pub const I64: u8 = 10;
    pub const STRING: u8 = 11;
    pub const STRUCT: u8 = 12;
    pub const MAP: u8 = 13;
    pub const SET: u8 = 14;
    pub const LIST: u8 = 15;
}

mod cql_result_type {
    pub const ROWS: i32 = 1;
    pub const VOID: i32 = 2;
    pub const INT: i32 = 3;
}

/// A decoded Thrift value. Strings travel as `Binary`.
#[derive(Debug, Clone, PartialEq)]
pub enum TValue {
    Bool(bool),
    Byte(i8),
    Double(f64),
    I16(i16),
    I32(i32),
    I64(i64),
    Binary(Bytes),
    Struct(Vec<(i16, TValue)>),
    Map {
        key: u8,
        value: u8,
        entries: Vec<(TValue, TValue)>,
    },
    Set { elem: u8, items: Vec<TValue> },
    List { elem: u8, items: Vec<TValue> },
}

fn truncated(what: &str) -> BackendError {
    BackendError::Protocol(format!("truncated {what}"))
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<(), BackendError> {
    if buf.remaining() < len {
        Err(truncated(what))
    } else {
        Ok(())
    }
}

fn get_size(buf: &mut Bytes, what: &str) -> Result<usize, BackendError> {
    need(buf, 4, what)?;
    let size = buf.get_i32();
    usize::try_from(size).map_err(|_| BackendError::Protocol(format!("negative {what} size {size}")))
}

impl TValue {
    pub fn string(s: &str) -> Self {
        TValue::Binary(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn type_id(&self) -> u8 {
        match self {
            TValue::Bool(_) => ttype::BOOL,
            TValue::Byte(_) => ttype::BYTE,
            TValue::Double(_) => ttype::DOUBLE,
            TValue::I16(_) => ttype::I16,
            TValue::I32(_) => ttype::I32,
            TValue::I64(_) => ttype::I64,
            TValue::Binary(_) => ttype::STRING,
            TValue::Struct(_) => ttype::STRUCT,
            TValue::Map { .. } => ttype::MAP,
            TValue::Set { .. } => ttype::SET,
            TValue::List { .. } => ttype::LIST,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            TValue::Bool(v) => buf.put_u8(u8::from(*v)),
            TValue::Byte(v) => buf.put_i8(*v),
            TValue::Double(v) => buf.put_f64(*v),
            TValue::I16(v) => buf.put_i16(*v),
            TValue::I32(v) => buf.put_i32(*v),
            TValue::I64(v) => buf.put_i64(*v),
            TValue::Binary(b) => {
                buf.put_i32(b.len() as i32);
                buf.put_slice(b);
            }
            TValue::Struct(fields) => {
                for (id, value) in fields {
                    buf.put_u8(value.type_id());
                    buf.put_i16(*id);
                    value.encode(buf);
                }
                buf.put_u8(ttype::STOP);
            }
            TValue::Map {
                key,
                value,
                entries,
            } => {
                buf.put_u8(*key);
                buf.put_u8(*value);
                buf.put_i32(entries.len() as i32);
                for (k, v) in entries {
                    k.encode(buf);
                    v.encode(buf);
                }
            }
            TValue::Set { elem, items } | TValue::List { elem, items } => {
                buf.put_u8(*elem);
                buf.put_i32(items.len() as i32);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    pub fn decode(ttype: u8, buf: &mut Bytes) -> Result<Self, BackendError> {
        Self::decode_nested(ttype, buf, 0)
    }

    fn decode_nested(kind: u8, buf: &mut Bytes, depth: usize) -> Result<Self, BackendError> {
        if depth > MAX_DEPTH {
            return Err(BackendError::Protocol("value nested too deeply".to_string()));
        }
        let value = match kind {
            ttype::BOOL => {
                need(buf, 1, "bool")?;
                TValue::Bool(buf.get_u8() != 0)
            }
            ttype::BYTE => {
                need(buf, 1, "byte")?;
                TValue::Byte(buf.get_i8())
            }
            ttype::DOUBLE => {
                need(buf, 8, "double")?;
                TValue::Double(buf.get_f64())
            }
            ttype::I16 => {
                need(buf, 2, "i16")?;
                TValue::I16(buf.get_i16())
            }
            ttype::I32 => {
                need(buf, 4, "i32")?;
                TValue::I32(buf.get_i32())
            }
            ttype::I64 => {
                need(buf, 8, "i64")?;
                TValue::I64(buf.get_i64())
            }
            ttype::STRING => {
                let len = get_size(buf, "string")?;
                need(buf, len, "string")?;
                TValue::Binary(buf.split_to(len))
            }
            ttype::STRUCT => {
                let mut fields = Vec::new();
                loop {
                    need(buf, 1, "field header")?;
                    let field_type = buf.get_u8();
                    if field_type == ttype::STOP {
                        break;
                    }
                    need(buf, 2, "field id")?;
                    let id = buf.get_i16();
                    fields.push((id, Self::decode_nested(field_type, buf, depth + 1)?));
                }
                TValue::Struct(fields)
            }
            ttype::MAP => {
                need(buf, 2, "map header")?;
                let key = buf.get_u8();
                let value = buf.get_u8();
                let size = get_size(buf, "map")?;
                let mut entries = Vec::with_capacity(size.min(buf.remaining()));
                for _ in 0..size {
                    let k = Self::decode_nested(key, buf, depth + 1)?;
                    let v = Self::decode_nested(value, buf, depth + 1)?;
                    entries.push((k, v));
                }
                TValue::Map {
                    key,
                    value,
                    entries,
                }
            }
            ttype::SET | ttype::LIST => {
                need(buf, 1, "list header")?;
                let elem = buf.get_u8();
                let size = get_size(buf, "list")?;
                let mut items = Vec::with_capacity(size.min(buf.remaining()));
                for _ in 0..size {
                    items.push(Self::decode_nested(elem, buf, depth + 1)?);
                }
                if kind == ttype::SET {
                    TValue::Set { elem, items }
                } else {
                    TValue::List { elem, items }
                }
            }
            other => {
                return Err(BackendError::Protocol(format!("unknown type id {other}")));
            }
        };
        Ok(value)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            TValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[(i16, TValue)]> {
        match self {
            TValue::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TValue]> {
        match self {
            TValue::List { items, .. } | TValue::Set { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(TValue, TValue)]> {
        match self {
            TValue::Map { entries, .. } => Some(entries),
            _ => None,
        }
    }
}

/// Field `id` of a decoded struct
pub fn field(fields: &[(i16, TValue)], id: i16) -> Option<&TValue> {
    fields.iter().find(|(i, _)| *i == id).map(|(_, v)| v)
}

fn field_string(fields: &[(i16, TValue)], id: i16) -> Option<String> {
    field(fields, id)
        .and_then(TValue::as_binary)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

/// A framed message in either direction
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: u8,
    pub name: String,
    pub seq: i32,
    pub body: Vec<(i16, TValue)>,
}

/// Encode a framed message, length prefix included
pub fn encode_message(kind: u8, name: &str, seq: i32, body: &[(i16, TValue)]) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u32(VERSION_1 | u32::from(kind));
    TValue::string(name).encode(&mut payload);
    payload.put_i32(seq);
    TValue::Struct(body.to_vec()).encode(&mut payload);

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    frame
}

/// Decode the payload of one frame
pub fn decode_message(mut payload: Bytes) -> Result<Message, BackendError> {
    need(&payload, 4, "message header")?;
    let word = payload.get_u32();
    if word & VERSION_MASK != VERSION_1 {
        return Err(BackendError::Protocol(format!(
            "unsupported message header 0x{word:08x}"
        )));
    }
    let kind = (word & 0xff) as u8;
    let name = TValue::decode(ttype::STRING, &mut payload)?;
    let name = String::from_utf8_lossy(name.as_binary().map(|b| &b[..]).unwrap_or_default()).into_owned();
    need(&payload, 4, "sequence id")?;
    let seq = payload.get_i32();
    let TValue::Struct(body) = TValue::decode(ttype::STRUCT, &mut payload)? else {
        return Err(BackendError::Protocol("message body is not a struct".to_string()));
    };
    Ok(Message {
        kind,
        name,
        seq,
        body,
    })
}

/// Read the payload of one frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, BackendError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BackendError::Protocol(format!(
            "frame of {len} bytes exceeds maximum of {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

fn already_exists(why: &str) -> bool {
    let why = why.to_ascii_lowercase();
    why.contains("already exist") || why.contains("existing")
}

/// The declared exception carried by a result struct, if any
pub fn declared_error(result: &[(i16, TValue)]) -> Option<BackendError> {
    result.iter().find_map(|(id, value)| match id {
        1 => {
            let why = value
                .as_struct()
                .and_then(|ire| field_string(ire, 1))
                .unwrap_or_default();
            let code = if already_exists(&why) {
                error_code::ALREADY_EXISTS
            } else {
                error_code::INVALID
            };
            Some(BackendError::Server { code, message: why })
        }
        2 => Some(BackendError::Operational("unavailable".to_string())),
        3 => Some(BackendError::Operational("timed out".to_string())),
        4 => Some(BackendError::Operational("schema disagreement".to_string())),
        _ => None,
    })
}

impl Message {
    /// The result struct of a reply to call `seq` of `method`
    pub fn into_result(self, method: &str, seq: i32) -> Result<Vec<(i16, TValue)>, BackendError> {
        if self.kind == message_type::EXCEPTION {
            let message = field_string(&self.body, 1).unwrap_or_default();
            return Err(BackendError::Protocol(format!("{method} failed: {message}")));
        }
        if self.kind != message_type::REPLY {
            return Err(BackendError::Protocol(format!(
                "unexpected message type {} in response to {method}",
                self.kind
            )));
        }
        if self.name != method || self.seq != seq {
            return Err(BackendError::Protocol(format!(
                "reply to {}#{} while waiting for {method}#{seq}",
                self.name, self.seq
            )));
        }
        match declared_error(&self.body) {
            Some(e) => Err(e),
            None => Ok(self.body),
        }
    }
}

/// Native type id for a server-side marshal class name
pub fn marshal_type_id(class: &str) -> u16 {
    let short = class.rsplit('.').next().unwrap_or(class);
    match short {
        "AsciiType" => type_id::ASCII,
        "UTF8Type" => type_id::VARCHAR,
        "LongType" => type_id::BIGINT,
        "BytesType" => type_id::BLOB,
        "BooleanType" => type_id::BOOLEAN,
        "CounterColumnType" => type_id::COUNTER,
        "DecimalType" => type_id::DECIMAL,
        "DoubleType" => type_id::DOUBLE,
        "FloatType" => type_id::FLOAT,
        "Int32Type" => type_id::INT,
        "DateType" | "TimestampType" => type_id::TIMESTAMP,
        "UUIDType" | "LexicalUUIDType" => type_id::UUID,
        "TimeUUIDType" => type_id::TIMEUUID,
        "IntegerType" => type_id::VARINT,
        _ => type_id::CUSTOM,
    }
}

/// Column types of a rows result
struct Metadata {
    name_types: HashMap<Bytes, u16>,
    value_types: HashMap<Bytes, u16>,
    default_name_type: u16,
    default_value_type: u16,
}

impl Metadata {
    fn types(schema: &[(i16, TValue)], id: i16) -> HashMap<Bytes, u16> {
        field(schema, id)
            .and_then(TValue::as_map)
            .unwrap_or_default()
            .iter()
            .filter_map(|(k, v)| {
                let class = String::from_utf8_lossy(v.as_binary()?);
                Some((k.as_binary()?.clone(), marshal_type_id(&class)))
            })
            .collect()
    }

    fn from_schema(schema: &[(i16, TValue)]) -> Self {
        let default = |id| {
            field_string(schema, id)
                .map(|class| marshal_type_id(&class))
                .unwrap_or(type_id::BLOB)
        };
        Self {
            name_types: Self::types(schema, 1),
            value_types: Self::types(schema, 2),
            default_name_type: default(3),
            default_value_type: default(4),
        }
    }

    fn name_type(&self, name: &Bytes) -> u16 {
        self.name_types.get(name).copied().unwrap_or(self.default_name_type)
    }

    fn value_type(&self, name: &Bytes) -> u16 {
        self.value_types.get(name).copied().unwrap_or(self.default_value_type)
    }
}

fn malformed(what: &str) -> BackendError {
    BackendError::Protocol(format!("malformed {what}"))
}

fn decode_rows(result: &[(i16, TValue)]) -> Result<StructuredRows, BackendError> {
    let schema = field(result, 4).and_then(TValue::as_struct).unwrap_or_default();
    let metadata = Metadata::from_schema(schema);
    let rows = field(result, 2).and_then(TValue::as_list).unwrap_or_default();

    let mut columns = None;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row.as_struct().ok_or_else(|| malformed("row"))?;
        let cells = field(row, 2).and_then(TValue::as_list).unwrap_or_default();
        let mut specs = Vec::with_capacity(cells.len());
        let mut values = Vec::with_capacity(cells.len());
        for cell in cells {
            let cell = cell.as_struct().ok_or_else(|| malformed("column"))?;
            let name = field(cell, 1)
                .and_then(TValue::as_binary)
                .ok_or_else(|| malformed("column name"))?;
            let value_type = metadata.value_type(name);
            let value = match field(cell, 2).and_then(TValue::as_binary) {
                Some(raw) => decode_cell(value_type, raw)?,
                None => CqlValue::Null,
            };
            specs.push(ColumnSpec {
                name: decode_cell(metadata.name_type(name), name)?.to_string(),
                type_id: value_type,
            });
            values.push(value);
        }
        // dynamic rows differ in their names; the first row names the columns
        columns.get_or_insert(specs);
        out.push(values);
    }
    Ok(StructuredRows::new(columns.unwrap_or_default(), out))
}

/// Decode the `CqlResult` of a successful `execute_cql_query`
pub fn decode_cql_result(result: &[(i16, TValue)]) -> Result<StructuredRows, BackendError> {
    let Some(success) = field(result, 0).and_then(TValue::as_struct) else {
        return Err(malformed("execute_cql_query reply"));
    };
    match field(success, 1).and_then(TValue::as_i32) {
        Some(cql_result_type::ROWS) => decode_rows(success),
        Some(cql_result_type::VOID) | Some(cql_result_type::INT) => Ok(StructuredRows::empty()),
        other => Err(BackendError::Protocol(format!("unknown result type {other:?}"))),
    }
}

pub fn execute_cql_query_args(statement: &str) -> Vec<(i16, TValue)> {
    vec![
        (1, TValue::string(statement)),
        (2, TValue::I32(COMPRESSION_NONE)),
    ]
}

pub fn set_cql_version_args(version: &str) -> Vec<(i16, TValue)> {
    vec![(1, TValue::string(version))]
}

/// A structured session over one Thrift connection
pub struct ThriftSession {
    stream: TcpStream,
    seq: i32,
    timeout: Duration,
}

impl ThriftSession {
    /// Connect and, when asked, select the CQL version
    pub async fn connect(
        addr: SocketAddr,
        cql_version: Option<&str>,
        io_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BackendError::Timeout(io_timeout))?
            .map_err(|e| BackendError::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream,
            seq: 0,
            timeout: io_timeout,
        };
        if let Some(version) = cql_version {
            session
                .call("set_cql_version", &set_cql_version_args(version))
                .await?;
        }
        tracing::debug!(%addr, ?cql_version, "thrift session ready");
        Ok(session)
    }

    async fn exchange(
        &mut self,
        method: &str,
        args: &[(i16, TValue)],
    ) -> Result<Vec<(i16, TValue)>, BackendError> {
        self.seq = self.seq.wrapping_add(1);
        let frame = encode_message(message_type::CALL, method, self.seq, args);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        let payload = read_frame(&mut self.stream).await?;
        decode_message(payload)?.into_result(method, self.seq)
    }

    async fn call(
        &mut self,
        method: &str,
        args: &[(i16, TValue)],
    ) -> Result<Vec<(i16, TValue)>, BackendError> {
        let io_timeout = self.timeout;
        timeout(io_timeout, self.exchange(method, args))
            .await
            .map_err(|_| BackendError::Timeout(io_timeout))?
    }
}

#[async_trait]
impl StructuredSession for ThriftSession {
    async fn execute(&mut self, statement: &str) -> Result<StructuredRows, BackendError> {
        let result = self
            .call("execute_cql_query", &execute_cql_query_args(statement))
            .await?;
        decode_cql_result(&result)
    }

    async fn close(mut self: Box<Self>) -> Result<(), BackendError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Opens Thrift sessions against a fixed list of node addresses
pub struct ThriftConnector {
    addresses: Vec<SocketAddr>,
    cql_version: Option<String>,
    timeout: Duration,
}

impl ThriftConnector {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self {
            addresses,
            cql_version: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// CQL version requested after connecting; the server default otherwise
    pub fn with_cql_version(mut self, version: Option<String>) -> Self {
        self.cql_version = version;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn open(&self, node: usize) -> Result<ThriftSession, BackendError> {
        let addr = self.addresses.get(node).ok_or_else(|| {
            BackendError::NotAvailable(format!(
                "node {node} out of range ({} nodes)",
                self.addresses.len()
            ))
        })?;
        ThriftSession::connect(*addr, self.cql_version.as_deref(), self.timeout).await
    }
}

#[async_trait]
impl SessionFactory for ThriftConnector {
    fn node_count(&self) -> usize {
        self.addresses.len()
    }

    async fn connect(&self, node: usize) -> Result<Box<dyn StructuredSession>, BackendError> {
        Ok(Box::new(self.open(node).await?))
    }
}
