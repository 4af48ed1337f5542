//! CDC 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("협상 실패: {0}")]
    NegotiationFailure(String),

    #[error("서버 에러 {code} ({sql_state}): {message}")]
    ServerError {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("지원하지 않는 작업: {0}")]
    UnsupportedOperation(String),

    #[error("암호화 에러: {0}")]
    EncryptionError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl CdcError {
    /// 재연결로 회복될 수 있는 에러인지 여부
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CdcError::UnsupportedOperation(_) | CdcError::EncryptionError(_)
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
