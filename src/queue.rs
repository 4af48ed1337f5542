//! 이벤트 큐
//!
//! 네트워크 수신 태스크(생산자)와 호출자(소비자)를 분리하는 고정 크기 FIFO 입니다.
//! 큐가 가득 차면 생산자는 대기하며, 이 대기가 곧 수신 경로의 backpressure 입니다.

use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use crate::reconnect::ReconnectState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// 이벤트 배치 (도착 순서를 유지하는 비어 있지 않은 이벤트 목록)
pub type EventBatch = Vec<BinlogEvent>;

/// 재연결 후에도 유지되는 이벤트 큐
pub struct EventQueue {
    sender: mpsc::Sender<EventBatch>,
    receiver: Mutex<mpsc::Receiver<EventBatch>>,
    poll_timeout: Duration,
    reconnect_state: Arc<ReconnectState>,
}

impl EventQueue {
    pub fn new(
        capacity: usize,
        poll_timeout: Duration,
        reconnect_state: Arc<ReconnectState>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        EventQueue {
            sender,
            receiver: Mutex::new(receiver),
            poll_timeout,
            reconnect_state,
        }
    }

    /// 수신 태스크에 넘겨줄 생산자 핸들
    pub fn producer(&self) -> EventProducer {
        EventProducer {
            sender: self.sender.clone(),
            reconnect_state: Arc::clone(&self.reconnect_state),
        }
    }

    /// 다음 배치를 최대 `poll_timeout` 동안 기다림
    ///
    /// 시간 안에 배치가 없으면 빈 Vec 을 반환합니다.
    pub async fn poll(&self) -> EventBatch {
        let wait = async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };

        match tokio::time::timeout(self.poll_timeout, wait).await {
            Ok(Some(batch)) => batch,
            Ok(None) | Err(_) => Vec::new(),
        }
    }

    /// 큐에 쌓인 배치 수
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

/// 이벤트 큐 생산자
#[derive(Clone)]
pub struct EventProducer {
    sender: mpsc::Sender<EventBatch>,
    reconnect_state: Arc<ReconnectState>,
}

impl EventProducer {
    /// 마지막 이벤트 위치를 재시작 지점으로 기록한 뒤 큐에 넣음
    ///
    /// 큐가 가득 차 있으면 자리가 날 때까지 대기합니다.
    pub async fn push(&self, batch: EventBatch) -> Result<()> {
        let Some(last) = batch.last() else {
            return Ok(());
        };

        self.reconnect_state.track(last.binlog_position());
        self.sender
            .send(batch)
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }
}
