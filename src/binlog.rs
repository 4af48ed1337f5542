//! Binlog 이벤트 디코더 및 테이블 메타데이터 레지스트리
//!
//! COM_BINLOG_DUMP 이후 서버가 보내는 패킷을 이벤트로 변환합니다.
//! 각 패킷:
//!   - Status (1 byte, 0x00 = 이벤트, 0xff = 에러)
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - Checksum (0 또는 4 bytes)

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::protocol::{ErrPacket, ERR_HEADER, OK_HEADER};
use crate::queue::EventBatch;
use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const EVENT_HEADER_SIZE: usize = 19;

/// Binlog 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<(EventHeader, usize)> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::BinlogParseError(
                "이벤트 헤더가 너무 짧습니다".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let header = read_header(&mut cursor).map_err(|e| parse_error("header", e))?;
        Ok((header, cursor.position() as usize))
    }

    /// 테이블 맵 이벤트 파싱 (19)
    pub fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
        read_table_map(&mut Cursor::new(data)).map_err(|e| parse_error("table map", e))
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
        if data.len() < 13 {
            return Err(CdcError::BinlogParseError(
                "QUERY 이벤트가 너무 짧습니다".to_string(),
            ));
        }
        read_query(data).map_err(|e| parse_error("query", e))
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "ROTATE 이벤트가 너무 짧습니다".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let position = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| parse_error("rotate", e))?;
        let filename = String::from_utf8_lossy(&data[8..]).to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }

    /// XID 이벤트 파싱 (16)
    pub fn parse_xid_event(data: &[u8]) -> Result<u64> {
        Cursor::new(data)
            .read_u64::<LittleEndian>()
            .map_err(|e| parse_error("xid", e))
    }

    /// GTID 이벤트 파싱 (33, 34)
    pub fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
        read_gtid(&mut Cursor::new(data)).map_err(|e| parse_error("gtid", e))
    }

    /// ROWS 이벤트의 테이블 ID (앞 6 bytes)
    pub fn parse_rows_table_id(data: &[u8]) -> Result<u64> {
        Cursor::new(data)
            .read_u48::<LittleEndian>()
            .map_err(|e| parse_error("rows", e))
    }
}

fn parse_error(what: &str, err: io::Error) -> CdcError {
    CdcError::BinlogParseError(format!("{} 이벤트 파싱 실패: {}", what, err))
}

fn read_header(cursor: &mut Cursor<&[u8]>) -> io::Result<EventHeader> {
    let timestamp = cursor.read_u32::<LittleEndian>()?;
    let type_code = cursor.read_u8()?;
    let server_id = cursor.read_u32::<LittleEndian>()?;
    let event_length = cursor.read_u32::<LittleEndian>()?;
    let next_pos = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    Ok(EventHeader {
        timestamp,
        type_code,
        event_type: EventType::from_u8(type_code),
        server_id,
        event_length,
        next_pos,
        flags,
    })
}

fn read_table_map(cursor: &mut Cursor<&[u8]>) -> io::Result<TableMapData> {
    let table_id = cursor.read_u48::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;

    // 데이터베이스명 (길이 + 이름 + 0x00)
    let database = read_short_string(cursor)?;
    cursor.read_u8()?;

    // 테이블명 (길이 + 이름 + 0x00)
    let table = read_short_string(cursor)?;
    cursor.read_u8()?;

    let column_count = read_lcb(cursor)? as usize;
    let mut column_types = vec![0u8; column_count];
    cursor.read_exact(&mut column_types)?;

    let metadata_length = read_lcb(cursor)? as usize;
    let mut column_meta = vec![0u8; metadata_length];
    cursor.read_exact(&mut column_meta)?;

    let mut nullable_bitmap = vec![0u8; (column_count + 7) / 8];
    cursor.read_exact(&mut nullable_bitmap)?;

    Ok(TableMapData {
        table_id,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    })
}

fn read_query(data: &[u8]) -> io::Result<QueryEventData> {
    let mut cursor = Cursor::new(data);

    let thread_id = cursor.read_u32::<LittleEndian>()?;
    let exec_time = cursor.read_u32::<LittleEndian>()?;
    let db_len = cursor.read_u8()? as usize;
    let error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as u64;

    // status variables skip
    cursor.set_position(cursor.position() + status_len);

    let mut db_bytes = vec![0u8; db_len];
    cursor.read_exact(&mut db_bytes)?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();

    // null terminator
    cursor.read_u8()?;

    let query = String::from_utf8_lossy(&data[cursor.position() as usize..]).to_string();

    Ok(QueryEventData {
        thread_id,
        exec_time,
        error_code,
        database,
        query,
    })
}

fn read_gtid(cursor: &mut Cursor<&[u8]>) -> io::Result<GtidEventData> {
    let flags = cursor.read_u8()?;
    let mut uuid_bytes = [0u8; 16];
    cursor.read_exact(&mut uuid_bytes)?;
    let sequence = cursor.read_u64::<LittleEndian>()?;

    Ok(GtidEventData {
        gtid: format!("{}:{}", Uuid::from_bytes(uuid_bytes).hyphenated(), sequence),
        committed: flags != 0,
    })
}

fn read_short_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// LCB (Length-Coded Binary) 읽기
fn read_lcb(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => cursor.read_u64::<LittleEndian>(),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid length-coded prefix 0x{:02x}", byte),
        )),
    }
}

/// 테이블 ID → 테이블 맵 캐시
#[derive(Debug, Clone, Default)]
pub struct TableMapCache {
    tables: Arc<RwLock<HashMap<u64, TableMapData>>>,
}

impl TableMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: TableMapData) {
        self.tables.write().insert(table.table_id, table);
    }

    pub fn get(&self, table_id: u64) -> Option<TableMapData> {
        self.tables.read().get(&table_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

/// `host:port` 별 테이블 맵 캐시 레지스트리
///
/// 클라이언트가 소유하며, 디코더를 설치할 때 해당 엔드포인트의 캐시를 넘겨줍니다.
/// 재연결 후에도 같은 캐시를 사용합니다.
#[derive(Debug, Default)]
pub struct TableMetadataRegistry {
    caches: Mutex<HashMap<String, TableMapCache>>,
}

impl TableMetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 엔드포인트의 캐시를 가져오거나 새로 생성
    pub fn cache_for(&self, key: &str) -> TableMapCache {
        self.caches
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.caches.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.caches.lock().contains_key(key)
    }
}

/// 스트리밍 상태에서 설치되는 이벤트 디코더
pub struct BinlogEventDecoder {
    file_name: String,
    checksum_length: usize,
    table_cache: TableMapCache,
    decode_with_tx: bool,
    pending_tx: Option<EventBatch>,
}

impl BinlogEventDecoder {
    pub fn new(
        file_name: impl Into<String>,
        checksum_length: usize,
        table_cache: TableMapCache,
        decode_with_tx: bool,
    ) -> Self {
        BinlogEventDecoder {
            file_name: file_name.into(),
            checksum_length,
            table_cache,
            decode_with_tx,
            pending_tx: None,
        }
    }

    /// 현재 binlog 파일명 (ROTATE 이벤트로 갱신됨)
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// 패킷 하나를 디코딩
    ///
    /// 전달할 배치가 완성되면 `Some` 을 반환합니다.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Option<EventBatch>> {
        match payload.first() {
            Some(&OK_HEADER) => {}
            Some(&ERR_HEADER) => return Err(ErrPacket::parse(payload)?.into_error()),
            Some(other) => {
                return Err(CdcError::ProtocolError(format!(
                    "binlog 스트림에 예상하지 못한 상태 바이트 0x{:02x}",
                    other
                )))
            }
            None => {
                return Err(CdcError::ProtocolError(
                    "비어 있는 binlog 패킷".to_string(),
                ))
            }
        }

        let data = &payload[1..];
        let (header, header_len) = BinlogParser::parse_header(data)?;

        let event_length = header.event_length as usize;
        if event_length > data.len() || event_length < header_len + self.checksum_length {
            return Err(CdcError::BinlogParseError(format!(
                "이벤트 길이 {} 가 패킷 길이 {} 와 맞지 않습니다",
                event_length,
                data.len()
            )));
        }
        let body = &data[header_len..event_length - self.checksum_length];

        let event_data = match header.event_type {
            EventType::RotateEvent => {
                let rotate = BinlogParser::parse_rotate_event(body)?;
                debug!(
                    "Binlog rotated to {}:{}",
                    rotate.next_binlog_name, rotate.position
                );
                self.file_name = rotate.next_binlog_name;
                return Ok(None);
            }
            EventType::FormatDescriptionEvent | EventType::HeartbeatEvent => return Ok(None),
            EventType::TableMapEvent => {
                let table_map = BinlogParser::parse_table_map_event(body)?;
                debug!(
                    "Table map {} -> {}.{}",
                    table_map.table_id, table_map.database, table_map.table
                );
                self.table_cache.insert(table_map);
                return Ok(None);
            }
            EventType::QueryEvent => BinlogEventData::Query(BinlogParser::parse_query_event(body)?),
            EventType::XidEvent => BinlogEventData::Xid {
                xid: BinlogParser::parse_xid_event(body)?,
            },
            EventType::GtidEvent | EventType::AnonymousGtidEvent => {
                BinlogEventData::Gtid(BinlogParser::parse_gtid_event(body)?)
            }
            event_type if event_type.is_rows_event() => {
                let table_id = BinlogParser::parse_rows_table_id(body)?;
                let (database, table) = match self.table_cache.get(table_id) {
                    Some(map) => (map.database, map.table),
                    None => {
                        warn!("No table map for table id {}", table_id);
                        (String::new(), String::new())
                    }
                };
                BinlogEventData::Rows(RowsEventData {
                    table_id,
                    database,
                    table,
                    body: body.to_vec(),
                })
            }
            _ => BinlogEventData::Placeholder,
        };

        let event = BinlogEvent {
            file_name: self.file_name.clone(),
            position: u64::from(header.next_pos),
            timestamp: header.timestamp,
            server_id: header.server_id,
            event_type: header.event_type,
            data: event_data,
        };

        Ok(self.batch(event))
    }

    fn batch(&mut self, event: BinlogEvent) -> Option<EventBatch> {
        if !self.decode_with_tx {
            return Some(vec![event]);
        }

        let (begins, ends) = match &event.data {
            BinlogEventData::Query(query) => {
                let statement = query.query.trim();
                (
                    statement.eq_ignore_ascii_case("BEGIN"),
                    statement.eq_ignore_ascii_case("COMMIT"),
                )
            }
            BinlogEventData::Xid { .. } => (false, true),
            _ => (false, false),
        };

        if begins {
            let unfinished = self.pending_tx.replace(vec![event]);
            if unfinished.is_some() {
                warn!("BEGIN received inside an open transaction, flushing it");
            }
            return unfinished;
        }

        match self.pending_tx.as_mut() {
            Some(tx) => {
                tx.push(event);
                if ends {
                    self.pending_tx.take()
                } else {
                    None
                }
            }
            None => Some(vec![event]),
        }
    }
}
