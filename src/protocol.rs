//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 프레이밍(3 bytes length + 1 byte sequence), 일반 응답 패킷(OK, ERR, EOF),
//! 텍스트 결과셋, 그리고 binlog 구독에 필요한 명령어 패킷을 다룹니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use regex::Regex;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::codec::{Decoder, Encoder};

/// 패킷 헤더 크기 (3 bytes length + 1 byte sequence)
pub const PACKET_HEADER_SIZE: usize = 4;

/// 단일 패킷 페이로드 최대 크기. 이 크기의 패킷은 다음 패킷으로 이어짐
pub const MAX_PAYLOAD_SIZE: usize = 0xFF_FFFF;

pub const OK_HEADER: u8 = 0x00;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// 텍스트 결과셋의 NULL 표시
const NULL_VALUE: u8 = 0xFB;

pub const COM_QUERY: u8 = 0x03;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;

/// 연결당 하나씩 존재하는 시퀀스 카운터
///
/// 코덱과 연결이 같은 카운터를 공유합니다. 새 명령어를 보내기 직전에는
/// 반드시 [`SequenceId::reset`]으로 0으로 되돌려야 합니다.
#[derive(Debug, Clone, Default)]
pub struct SequenceId(Arc<AtomicU8>);

impl SequenceId {
    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, value: u8) {
        self.0.store(value, Ordering::SeqCst);
    }

    fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// MySQL 패킷 코덱
///
/// 읽기 시 받은 시퀀스 + 1을 카운터에 기록하고, 쓰기 시 카운터 값을 헤더에
/// 싣고 증가시킵니다. 0xFFFFFF 길이의 페이로드는 이어지는 패킷과 합칩니다.
#[derive(Debug)]
pub struct PacketCodec {
    sequence: SequenceId,
    partial: BytesMut,
}

impl PacketCodec {
    pub fn new(sequence: SequenceId) -> Self {
        PacketCodec {
            sequence,
            partial: BytesMut::new(),
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = CdcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            if src.len() < PACKET_HEADER_SIZE {
                return Ok(None);
            }

            let length = u32::from_le_bytes([src[0], src[1], src[2], 0]) as usize;
            if src.len() < PACKET_HEADER_SIZE + length {
                src.reserve(PACKET_HEADER_SIZE + length - src.len());
                return Ok(None);
            }

            let sequence = src[3];
            src.advance(PACKET_HEADER_SIZE);
            let payload = src.split_to(length);
            self.sequence.set(sequence.wrapping_add(1));

            if length == MAX_PAYLOAD_SIZE {
                self.partial.extend_from_slice(&payload);
                continue;
            }

            if self.partial.is_empty() {
                return Ok(Some(payload.freeze()));
            }

            self.partial.extend_from_slice(&payload);
            return Ok(Some(self.partial.split().freeze()));
        }
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = CdcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        let mut remaining = &item[..];
        loop {
            let chunk = remaining.len().min(MAX_PAYLOAD_SIZE);
            dst.reserve(PACKET_HEADER_SIZE + chunk);
            dst.put_uint_le(chunk as u64, 3);
            dst.put_u8(self.sequence.next());
            dst.put_slice(&remaining[..chunk]);
            remaining = &remaining[chunk..];

            // 최대 크기와 정확히 같으면 빈 패킷이라도 하나 더 보내야 함
            if chunk < MAX_PAYLOAD_SIZE {
                return Ok(());
            }
        }
    }
}

fn protocol_err(what: &'static str) -> impl Fn(io::Error) -> CdcError {
    move |e| CdcError::ProtocolError(format!("Failed to read {}: {}", what, e))
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let protocol_version = cursor.read_u8().map_err(protocol_err("protocol version"))?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor
            .read_u32::<LittleEndian>()
            .map_err(protocol_err("thread ID"))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        cursor
            .read_exact(&mut scramble)
            .map_err(protocol_err("scramble part 1"))?;

        // Filler (1 byte, always 0x00)
        cursor.read_u8().map_err(protocol_err("filler"))?;

        let capabilities_lower = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_err("capabilities"))?;
        let server_collation = cursor.read_u8().map_err(protocol_err("collation"))?;
        let server_status = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_err("status"))?;
        let capabilities_upper = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_err("capabilities upper"))?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8().map_err(protocol_err("auth data length"))?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        cursor
            .read_exact(&mut reserved)
            .map_err(protocol_err("reserved"))?;

        // Auth plugin data part 2 (at least 13 bytes, 마지막은 null byte)
        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        cursor
            .read_exact(&mut scramble_part2)
            .map_err(protocol_err("scramble part 2"))?;
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]);

        let auth_plugin_name = read_string_until_null_or_end(&mut cursor);

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// OK 패킷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = cursor.read_u8().map_err(protocol_err("OK header"))?;
        if header != OK_HEADER {
            return Err(CdcError::ProtocolError(format!(
                "Not an OK packet: 0x{:02x}",
                header
            )));
        }

        let affected_rows = read_lenenc_int(&mut cursor)?;
        let last_insert_id = read_lenenc_int(&mut cursor)?;
        let status_flags = cursor.read_u16::<LittleEndian>().unwrap_or(0);
        let warnings = cursor.read_u16::<LittleEndian>().unwrap_or(0);

        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = cursor.read_u8().map_err(protocol_err("ERR header"))?;
        if header != ERR_HEADER {
            return Err(CdcError::ProtocolError(format!(
                "Not an ERR packet: 0x{:02x}",
                header
            )));
        }

        let code = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_err("error code"))?;

        let mut sql_state = String::new();
        if data.get(cursor.position() as usize) == Some(&b'#') {
            cursor.set_position(cursor.position() + 1);
            let mut state = [0u8; 5];
            cursor
                .read_exact(&mut state)
                .map_err(protocol_err("SQL state"))?;
            sql_state = String::from_utf8_lossy(&state).to_string();
        }

        let message = String::from_utf8_lossy(&data[cursor.position() as usize..]).to_string();

        Ok(ErrPacket {
            code,
            sql_state,
            message,
        })
    }

    pub fn into_error(self) -> CdcError {
        CdcError::ServerError {
            code: self.code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&ERR_HEADER)
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&OK_HEADER)
}

/// EOF 패킷 확인 (0xFE, 패킷 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&EOF_HEADER) && data.len() < 9
}

/// 텍스트 프로토콜 결과셋
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// 첫 행 첫 컬럼 값
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// Column definition 패킷에서 컬럼명만 추출
pub fn parse_column_definition(data: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(data);
    // catalog, schema, table, org_table
    for _ in 0..4 {
        read_lenenc_bytes(&mut cursor)?;
    }
    let name = read_lenenc_bytes(&mut cursor)?;
    Ok(String::from_utf8_lossy(&name).to_string())
}

/// 텍스트 결과셋 행 파싱
pub fn parse_text_row(data: &[u8], column_count: usize) -> Result<Vec<Option<String>>> {
    let mut cursor = Cursor::new(data);
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        if data.get(cursor.position() as usize) == Some(&NULL_VALUE) {
            cursor.set_position(cursor.position() + 1);
            row.push(None);
            continue;
        }
        let value = read_lenenc_bytes(&mut cursor)?;
        row.push(Some(String::from_utf8_lossy(&value).to_string()));
    }
    Ok(row)
}

/// Length-encoded integer 읽기
pub fn read_lenenc_int<R: Read>(reader: &mut R) -> Result<u64> {
    let first = reader
        .read_u8()
        .map_err(protocol_err("length-encoded integer"))?;
    match first {
        0..=0xfa => Ok(first as u64),
        0xfc => reader
            .read_u16::<LittleEndian>()
            .map(u64::from)
            .map_err(protocol_err("length-encoded integer")),
        0xfd => reader
            .read_u24::<LittleEndian>()
            .map(u64::from)
            .map_err(protocol_err("length-encoded integer")),
        0xfe => reader
            .read_u64::<LittleEndian>()
            .map_err(protocol_err("length-encoded integer")),
        _ => Err(CdcError::ProtocolError(format!(
            "Invalid length-encoded integer prefix: 0x{:02x}",
            first
        ))),
    }
}

/// Length-encoded string 읽기
pub fn read_lenenc_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let length = read_lenenc_int(reader)? as usize;
    let mut bytes = vec![0u8; length];
    reader
        .read_exact(&mut bytes)
        .map_err(protocol_err("length-encoded string"))?;
    Ok(bytes)
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8().map_err(protocol_err("string byte"))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| CdcError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// null 또는 패킷 끝까지 읽기 (일부 서버는 플러그인명 뒤 null을 생략함)
fn read_string_until_null_or_end<R: Read>(reader: &mut R) -> String {
    let mut bytes = Vec::new();
    while let Ok(byte) = reader.read_u8() {
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8_lossy(&bytes).to_string()
}

/// COM_QUERY 명령어 생성
pub fn create_query_command(sql: &str) -> Bytes {
    let mut buffer = BytesMut::with_capacity(sql.len() + 1);
    buffer.put_u8(COM_QUERY);
    buffer.put_slice(sql.as_bytes());
    buffer.freeze()
}

/// COM_REGISTER_SLAVE 명령어 생성
pub fn create_register_slave_command(
    server_id: u32,
    hostname: &str,
    username: &str,
    password: &str,
    port: u16,
) -> Result<Bytes> {
    let mut buffer = Vec::new();

    buffer.write_u8(COM_REGISTER_SLAVE)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    write_short_string(&mut buffer, hostname)?;
    write_short_string(&mut buffer, username)?;
    write_short_string(&mut buffer, password)?;
    buffer.write_u16::<LittleEndian>(port)?;

    // Replication rank (ignored)
    buffer.write_u32::<LittleEndian>(0)?;

    // Master ID (0 = 서버가 결정)
    buffer.write_u32::<LittleEndian>(0)?;

    Ok(Bytes::from(buffer))
}

/// COM_BINLOG_DUMP 명령어 생성
pub fn create_binlog_dump_command(
    server_id: u32,
    binlog_filename: &str,
    binlog_position: u64,
) -> Result<Bytes> {
    let position = u32::try_from(binlog_position).map_err(|_| {
        CdcError::UnsupportedOperation(format!(
            "Binlog position {} does not fit COM_BINLOG_DUMP",
            binlog_position
        ))
    })?;

    let mut buffer = Vec::new();

    buffer.write_u8(COM_BINLOG_DUMP)?;

    // Binlog position (4 bytes, little-endian)
    buffer.write_u32::<LittleEndian>(position)?;

    // Flags (2 bytes) - 0이면 최신 이벤트 이후에도 연결 유지
    buffer.write_u16::<LittleEndian>(0)?;

    buffer.write_u32::<LittleEndian>(server_id)?;

    // Binlog filename (패킷 끝까지)
    buffer.write_all(binlog_filename.as_bytes())?;

    Ok(Bytes::from(buffer))
}

fn write_short_string(buffer: &mut Vec<u8>, value: &str) -> Result<()> {
    let length = u8::try_from(value.len()).map_err(|_| {
        CdcError::ProtocolError(format!("Value too long for 1-byte length: {}", value.len()))
    })?;
    buffer.write_u8(length)?;
    buffer.write_all(value.as_bytes())?;
    Ok(())
}

/// MySQL 서버 버전 (major.minor.patch)
///
/// 파싱할 수 없는 버전 문자열은 0.0.0으로 취급합니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        ServerVersion {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(version: &str) -> Self {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^\s*(\d+)\.(\d+)\.(\d+)").expect("version pattern is valid")
        });

        pattern
            .captures(version)
            .and_then(|caps| {
                Some(ServerVersion {
                    major: caps[1].parse().ok()?,
                    minor: caps[2].parse().ok()?,
                    patch: caps[3].parse().ok()?,
                })
            })
            .unwrap_or_default()
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        *self >= ServerVersion::new(major, minor, patch)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
