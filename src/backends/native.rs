//! Minimal native protocol (v4) client, used for CQL3 statements such as
//! those of the schema churn scenario.
//!
//! Frames have a 9-byte header:
//! - 1 byte: version (0x04 for requests, 0x84 for responses)
//! - 1 byte: flags
//! - 2 bytes: stream id (big-endian)
//! - 1 byte: opcode
//! - 4 bytes: body length (big-endian)
//!
//! Only what is needed to send a statement and read tabular results is
//! implemented: STARTUP, QUERY, and the RESULT/ERROR responses.

use super::{BackendError, ColumnSpec, CqlValue, SessionFactory, StructuredRows, StructuredSession};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_bigint::BigInt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u8 = 0x04;
const RESPONSE_FLAG: u8 = 0x80;
pub const HEADER_LEN: usize = 9;

/// Largest body accepted from the server (256 MB)
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

pub const DEFAULT_CQL_VERSION: &str = "3.0.0";

pub mod opcode {
    pub const ERROR: u8 = 0x00;
    pub const STARTUP: u8 = 0x01;
    pub const READY: u8 = 0x02;
    pub const AUTHENTICATE: u8 = 0x03;
    pub const QUERY: u8 = 0x07;
    pub const RESULT: u8 = 0x08;
}

mod result_kind {
    pub const VOID: i32 = 0x0001;
    pub const ROWS: i32 = 0x0002;
    pub const SET_KEYSPACE: i32 = 0x0003;
    pub const PREPARED: i32 = 0x0004;
    pub const SCHEMA_CHANGE: i32 = 0x0005;
}

mod rows_flag {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    pub const HAS_MORE_PAGES: i32 = 0x0002;
    pub const NO_METADATA: i32 = 0x0004;
}

/// Column type ids of the native protocol
pub mod type_id {
    pub const CUSTOM: u16 = 0x0000;
    pub const ASCII: u16 = 0x0001;
    pub const BIGINT: u16 = 0x0002;
    pub const BLOB: u16 = 0x0003;
    pub const BOOLEAN: u16 = 0x0004;
    pub const COUNTER: u16 = 0x0005;
    pub const DECIMAL: u16 = 0x0006;
    pub const DOUBLE: u16 = 0x0007;
    pub const FLOAT: u16 = 0x0008;
    pub const INT: u16 = 0x0009;
    pub const TEXT: u16 = 0x000A;
    pub const TIMESTAMP: u16 = 0x000B;
    pub const UUID: u16 = 0x000C;
    pub const VARCHAR: u16 = 0x000D;
    pub const VARINT: u16 = 0x000E;
    pub const TIMEUUID: u16 = 0x000F;
    pub const LIST: u16 = 0x0020;
    pub const MAP: u16 = 0x0021;
    pub const SET: u16 = 0x0022;
    pub const UDT: u16 = 0x0030;
    pub const TUPLE: u16 = 0x0031;
}

/// Consistency level carried by a QUERY frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

impl Consistency {
    pub fn code(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::LocalOne => 0x000A,
        }
    }
}

impl std::str::FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "any" => Ok(Consistency::Any),
            "one" => Ok(Consistency::One),
            "two" => Ok(Consistency::Two),
            "three" => Ok(Consistency::Three),
            "quorum" => Ok(Consistency::Quorum),
            "all" => Ok(Consistency::All),
            "local_quorum" => Ok(Consistency::LocalQuorum),
            "each_quorum" => Ok(Consistency::EachQuorum),
            "local_one" => Ok(Consistency::LocalOne),
            other => Err(format!("unknown consistency level '{other}'")),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: u8,
    pub length: u32,
}

impl FrameHeader {
    pub fn request(stream: i16, opcode: u8, length: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            stream,
            opcode,
            length: length as u32,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_i16(self.stream);
        buf.put_u8(self.opcode);
        buf.put_u32(self.length);
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &raw[..];
        Self {
            version: buf.get_u8(),
            flags: buf.get_u8(),
            stream: buf.get_i16(),
            opcode: buf.get_u8(),
            length: buf.get_u32(),
        }
    }
}

/// Encode a full request frame
pub fn encode_frame(stream: i16, opcode: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    FrameHeader::request(stream, opcode, body.len()).encode(&mut buf);
    buf.put_slice(body);
    buf
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Body of a STARTUP request
pub fn startup_body(cql_version: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16(1);
    put_string(&mut buf, "CQL_VERSION");
    put_string(&mut buf, cql_version);
    buf
}

/// Body of a QUERY request without bound values
pub fn query_body(statement: &str, consistency: Consistency) -> BytesMut {
    let mut buf = BytesMut::with_capacity(statement.len() + 7);
    put_long_string(&mut buf, statement);
    buf.put_u16(consistency.code());
    buf.put_u8(0);
    buf
}

fn truncated(what: &str) -> BackendError {
    BackendError::Protocol(format!("truncated {what}"))
}

fn get_u16(buf: &mut Bytes) -> Result<u16, BackendError> {
    if buf.remaining() < 2 {
        return Err(truncated("short"));
    }
    Ok(buf.get_u16())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, BackendError> {
    if buf.remaining() < 4 {
        return Err(truncated("int"));
    }
    Ok(buf.get_i32())
}

fn get_string(buf: &mut Bytes) -> Result<String, BackendError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated("string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| BackendError::Protocol(e.to_string()))
}

fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, BackendError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(truncated("bytes"));
    }
    Ok(Some(buf.split_to(len)))
}

/// Decode the body of an ERROR response
pub fn decode_error(mut body: Bytes) -> BackendError {
    let code = match get_i32(&mut body) {
        Ok(code) => code,
        Err(e) => return e,
    };
    let message = get_string(&mut body).unwrap_or_default();
    BackendError::Server { code, message }
}

/// Read a type option, returning the outer type id
fn get_type_option(buf: &mut Bytes) -> Result<u16, BackendError> {
    let id = get_u16(buf)?;
    match id {
        type_id::CUSTOM => {
            get_string(buf)?;
        }
        type_id::LIST | type_id::SET => {
            get_type_option(buf)?;
        }
        type_id::MAP => {
            get_type_option(buf)?;
            get_type_option(buf)?;
        }
        type_id::UDT => {
            get_string(buf)?;
            get_string(buf)?;
            let fields = get_u16(buf)?;
            for _ in 0..fields {
                get_string(buf)?;
                get_type_option(buf)?;
            }
        }
        type_id::TUPLE => {
            let fields = get_u16(buf)?;
            for _ in 0..fields {
                get_type_option(buf)?;
            }
        }
        _ => {}
    }
    Ok(id)
}

fn fixed<const N: usize>(raw: &[u8], what: &str) -> Result<[u8; N], BackendError> {
    raw.try_into()
        .map_err(|_| BackendError::Protocol(format!("{what} cell has {} bytes", raw.len())))
}

fn utf8(raw: &[u8]) -> Result<String, BackendError> {
    String::from_utf8(raw.to_vec()).map_err(|e| BackendError::Protocol(e.to_string()))
}

/// Decode a single non-null cell
pub fn decode_cell(type_id: u16, raw: &[u8]) -> Result<CqlValue, BackendError> {
    let value = match type_id {
        type_id::ASCII => CqlValue::Ascii(utf8(raw)?),
        type_id::TEXT | type_id::VARCHAR => CqlValue::Text(utf8(raw)?),
        type_id::BIGINT => CqlValue::BigInt(i64::from_be_bytes(fixed(raw, "bigint")?)),
        type_id::COUNTER => CqlValue::Counter(i64::from_be_bytes(fixed(raw, "counter")?)),
        type_id::TIMESTAMP => CqlValue::Timestamp(i64::from_be_bytes(fixed(raw, "timestamp")?)),
        type_id::INT => CqlValue::Int(i32::from_be_bytes(fixed(raw, "int")?)),
        type_id::DOUBLE => CqlValue::Double(f64::from_be_bytes(fixed(raw, "double")?)),
        type_id::FLOAT => CqlValue::Float(f32::from_be_bytes(fixed(raw, "float")?)),
        type_id::BOOLEAN => {
            let [b] = fixed::<1>(raw, "boolean")?;
            CqlValue::Boolean(b != 0)
        }
        type_id::BLOB => CqlValue::Blob(raw.to_vec()),
        type_id::UUID | type_id::TIMEUUID => CqlValue::Uuid(Uuid::from_bytes(fixed(raw, "uuid")?)),
        type_id::VARINT => CqlValue::Varint(BigInt::from_signed_bytes_be(raw)),
        type_id::DECIMAL => {
            if raw.len() < 4 {
                return Err(truncated("decimal"));
            }
            let scale = i32::from_be_bytes(fixed(&raw[..4], "decimal scale")?);
            CqlValue::Decimal {
                unscaled: BigInt::from_signed_bytes_be(&raw[4..]),
                scale,
            }
        }
        other => CqlValue::Other {
            type_id: other,
            raw: raw.to_vec(),
        },
    };
    Ok(value)
}

fn decode_rows(body: &mut Bytes) -> Result<StructuredRows, BackendError> {
    let flags = get_i32(body)?;
    let column_count = get_i32(body)?;
    if column_count < 0 {
        return Err(BackendError::Protocol(format!(
            "negative column count {column_count}"
        )));
    }
    if flags & rows_flag::HAS_MORE_PAGES != 0 {
        get_bytes(body)?;
    }
    if flags & rows_flag::NO_METADATA != 0 {
        return Err(BackendError::Protocol(
            "rows result without metadata".to_string(),
        ));
    }
    let global = flags & rows_flag::GLOBAL_TABLES_SPEC != 0;
    if global {
        get_string(body)?;
        get_string(body)?;
    }

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        if !global {
            get_string(body)?;
            get_string(body)?;
        }
        let name = get_string(body)?;
        let type_id = get_type_option(body)?;
        columns.push(ColumnSpec { name, type_id });
    }

    let row_count = get_i32(body)?;
    let mut rows = Vec::with_capacity(row_count.max(0) as usize);
    for _ in 0..row_count {
        let mut row = Vec::with_capacity(columns.len());
        for column in &columns {
            let cell = match get_bytes(body)? {
                Some(raw) => decode_cell(column.type_id, &raw)?,
                None => CqlValue::Null,
            };
            row.push(cell);
        }
        rows.push(row);
    }

    Ok(StructuredRows::new(columns, rows))
}

/// Decode the body of a RESULT response
pub fn decode_result(mut body: Bytes) -> Result<StructuredRows, BackendError> {
    match get_i32(&mut body)? {
        result_kind::VOID | result_kind::SET_KEYSPACE | result_kind::SCHEMA_CHANGE => {
            Ok(StructuredRows::empty())
        }
        result_kind::ROWS => decode_rows(&mut body),
        result_kind::PREPARED => Err(BackendError::Protocol(
            "unexpected PREPARED result".to_string(),
        )),
        other => Err(BackendError::Protocol(format!(
            "unknown result kind {other}"
        ))),
    }
}

/// A structured session over one TCP connection
pub struct NativeSession {
    stream: TcpStream,
    next_stream: i16,
    consistency: Consistency,
    timeout: Duration,
}

impl NativeSession {
    /// Connect and perform the STARTUP handshake
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
            next_stream: 0,
            consistency: Consistency::One,
            timeout: io_timeout,
        };

        let body = startup_body(cql_version.unwrap_or(DEFAULT_CQL_VERSION));
        let (header, body) = session.round_trip(opcode::STARTUP, &body).await?;
        match header.opcode {
            opcode::READY => {
                tracing::debug!(%addr, "native session ready");
                Ok(session)
            }
            opcode::AUTHENTICATE => Err(BackendError::NotAvailable(
                "server requires authentication".to_string(),
            )),
            opcode::ERROR => Err(decode_error(body)),
            other => Err(BackendError::Protocol(format!(
                "unexpected opcode 0x{other:02x} in response to STARTUP"
            ))),
        }
    }

    /// Set the consistency level used for QUERY frames
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    async fn write_frame(&mut self, op: u8, body: &[u8]) -> Result<i16, BackendError> {
        let stream_id = self.next_stream;
        self.next_stream = self.next_stream.wrapping_add(1) & 0x7fff;
        let frame = encode_frame(stream_id, op, body);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(stream_id)
    }

    async fn read_frame(&mut self) -> Result<(FrameHeader, Bytes), BackendError> {
        let mut raw = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut raw).await?;
        let header = FrameHeader::decode(&raw);
        if header.version != (PROTOCOL_VERSION | RESPONSE_FLAG) {
            return Err(BackendError::Protocol(format!(
                "unexpected response version 0x{:02x}",
                header.version
            )));
        }
        let len = header.length as usize;
        if len > MAX_BODY_LEN {
            return Err(BackendError::Protocol(format!(
                "body of {len} bytes exceeds maximum of {MAX_BODY_LEN}"
            )));
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok((header, Bytes::from(body)))
    }

    async fn exchange(&mut self, op: u8, body: &[u8]) -> Result<(FrameHeader, Bytes), BackendError> {
        let stream_id = self.write_frame(op, body).await?;
        loop {
            let (header, body) = self.read_frame().await?;
            // negative stream ids are server events
            if header.stream == stream_id {
                return Ok((header, body));
            }
            tracing::trace!(stream = header.stream, "skipping unrelated frame");
        }
    }

    async fn round_trip(
        &mut self,
        op: u8,
        body: &[u8],
    ) -> Result<(FrameHeader, Bytes), BackendError> {
        let io_timeout = self.timeout;
        timeout(io_timeout, self.exchange(op, body))
            .await
            .map_err(|_| BackendError::Timeout(io_timeout))?
    }
}

#[async_trait]
impl StructuredSession for NativeSession {
    async fn execute(&mut self, statement: &str) -> Result<StructuredRows, BackendError> {
        let body = query_body(statement, self.consistency);
        let (header, body) = self.round_trip(opcode::QUERY, &body).await?;
        match header.opcode {
            opcode::RESULT => decode_result(body),
            opcode::ERROR => Err(decode_error(body)),
            other => Err(BackendError::Protocol(format!(
                "unexpected opcode 0x{other:02x} in response to QUERY"
            ))),
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), BackendError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Opens native sessions against a fixed list of node addresses
pub struct NativeConnector {
    addresses: Vec<SocketAddr>,
    cql_version: Option<String>,
    consistency: Consistency,
    timeout: Duration,
}

impl NativeConnector {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self {
            addresses,
            cql_version: None,
            consistency: Consistency::One,
            timeout: Duration::from_secs(60),
        }
    }

    /// Consistency level of every session's QUERY frames
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Set the CQL version announced in STARTUP
    pub fn with_cql_version(mut self, version: Option<String>) -> Self {
        self.cql_version = version;
        self
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open a concrete session to the given node
    pub async fn open(&self, node: usize) -> Result<NativeSession, BackendError> {
        let addr = self.addresses.get(node).ok_or_else(|| {
            BackendError::NotAvailable(format!(
                "node {node} out of range ({} nodes)",
                self.addresses.len()
            ))
        })?;
        let session = NativeSession::connect(*addr, self.cql_version.as_deref(), self.timeout).await?;
        Ok(session.with_consistency(self.consistency))
    }
}

#[async_trait]
impl SessionFactory for NativeConnector {
    fn node_count(&self) -> usize {
        self.addresses.len()
    }

    async fn connect(&self, node: usize) -> Result<Box<dyn StructuredSession>, BackendError> {
        Ok(Box::new(self.open(node).await?))
    }
}
