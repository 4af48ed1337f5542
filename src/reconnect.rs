//! 재연결 상태 관리
//!
//! 재시도 횟수와 마지막으로 전달된 Binlog 위치를 보관합니다.
//! 연결이 바뀌어도 유지되어 재구독 시작 지점으로 사용됩니다.

use crate::offset::BinlogPosition;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// 재연결 상태
#[derive(Debug)]
pub struct ReconnectState {
    attempts: AtomicU32,
    max_attempts: u32,
    last_position: Mutex<Option<BinlogPosition>>,
}

impl ReconnectState {
    pub fn new(max_attempts: u32) -> Self {
        ReconnectState {
            attempts: AtomicU32::new(0),
            max_attempts,
            last_position: Mutex::new(None),
        }
    }

    /// 시도 횟수를 증가시키고 증가된 값을 반환
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts() > self.max_attempts
    }

    /// 재시작 지점 기록
    ///
    /// 위치 0(서버가 만든 가상 이벤트)은 무시하며, 위치는 앞으로만 이동합니다.
    /// 비교할 수 없는 파일명(시퀀스 없음)은 새 위치로 받아들입니다.
    pub fn track(&self, position: BinlogPosition) {
        if position.position == 0 {
            return;
        }

        let mut last = self.last_position.lock();
        let advance = match last.as_ref() {
            None => true,
            Some(current) => match position.partial_cmp(current) {
                Some(order) => order.is_gt(),
                None => position.filename != current.filename,
            },
        };

        if advance {
            debug!("Tracking binlog position {}", position);
            *last = Some(position);
        }
    }

    /// 구독 시작 지점으로 위치를 덮어씀
    pub fn start_from(&self, position: BinlogPosition) {
        *self.last_position.lock() = Some(position);
    }

    pub fn last_position(&self) -> Option<BinlogPosition> {
        self.last_position.lock().clone()
    }
}
