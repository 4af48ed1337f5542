//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }
}

/// 같은 파일이거나 두 파일의 시퀀스 번호가 서로 다를 때만 비교 가능합니다.
impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.filename == other.filename {
            return Some(self.position.cmp(&other.position));
        }

        match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) if a != b => Some(a.cmp(&b)),
            _ => None,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");

        let no_seq = BinlogPosition::new("binlog", 4);
        assert_eq!(no_seq.file_sequence(), None);
    }

    #[test]
    fn test_binlog_position_order() {
        let a = BinlogPosition::new("mysql-bin.000001", 9000);
        let b = BinlogPosition::new("mysql-bin.000002", 4);
        let c = BinlogPosition::new("mysql-bin.000002", 120);

        assert!(a < b);
        assert!(b < c);
        assert!(c > a);

        let unrelated = BinlogPosition::new("other", 1);
        assert_eq!(a.partial_cmp(&unrelated), None);
    }
}
