//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::offset::BinlogPosition;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN, COMMIT)
    QueryEvent = 2,
    /// 서버 종료
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트 (각 파일의 첫 이벤트)
    FormatDescriptionEvent = 15,
    /// XID 이벤트 (트랜잭션 커밋)
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    /// 하트비트 (연결 유지용, 파일에 기록되지 않음)
    HeartbeatEvent = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 36,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            36 => EventType::RowsQueryEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_rows_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::UpdateRowsEventV1
                | EventType::DeleteRowsEventV1
                | EventType::WriteRowsEvent
                | EventType::UpdateRowsEvent
                | EventType::DeleteRowsEvent
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 원본 이벤트 타입 코드
    pub type_code: u8,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더와 체크섬 포함)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

/// 테이블 맵 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<u8>,
    /// 컬럼 메타데이터 (원본 바이트)
    pub column_meta: Vec<u8>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub database: String,
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEventData {
    /// GTID 문자열 (format: uuid:sequence-number)
    pub gtid: String,
    /// 커밋 플래그
    pub committed: bool,
}

/// 행 변경 이벤트
///
/// 행 본문의 해석은 하위 파이프라인이 담당하므로 원본 바이트를 그대로 전달합니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsEventData {
    pub table_id: u64,
    /// 테이블 맵 캐시에서 찾은 데이터베이스명 (없으면 빈 문자열)
    pub database: String,
    pub table: String,
    pub body: Vec<u8>,
}

/// 디코딩된 이벤트 본문
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogEventData {
    Query(QueryEventData),
    Xid { xid: u64 },
    Gtid(GtidEventData),
    Rows(RowsEventData),
    /// 해석하지 않는 이벤트 (위치 추적용)
    Placeholder,
}

/// 파이프라인으로 전달되는 Binlog 이벤트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트가 속한 binlog 파일명
    pub file_name: String,
    /// 다음 이벤트 위치 (재시작 지점)
    pub position: u64,
    pub timestamp: u32,
    pub server_id: u32,
    pub event_type: EventType,
    pub data: BinlogEventData,
}

impl BinlogEvent {
    pub fn binlog_position(&self) -> BinlogPosition {
        BinlogPosition::new(self.file_name.clone(), self.position)
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::from(self.timestamp), 0).single()
    }
}
