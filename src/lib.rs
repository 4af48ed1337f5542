//! MySQL Binlog CDC (Change Data Capture) 수집 클라이언트
//!
//! MySQL 복제 프로토콜로 바이너리 로그를 구독하여 변경 이벤트를 전달합니다.
//! 주요 기능:
//! - 패킷 코덱 및 핸드셰이크 (native / caching_sha2 / sha256 인증)
//! - 체크섬 협상, replica 등록, binlog dump
//! - backpressure 가 있는 이벤트 큐
//! - 연결 끊김 시 마지막 위치부터 자동 재구독

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod connection;
pub mod error;
pub mod events;
pub mod offset;
pub mod protocol;
pub mod queue;
pub mod reconnect;

pub use binlog_client::{BinlogClient, ClientOptions, ClientState};
pub use connection::{ConnectionConfig, MySqlConnection};
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, BinlogEventData, EventType};
pub use offset::BinlogPosition;
pub use protocol::{ResultSet, ServerVersion};
