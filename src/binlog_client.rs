//! MySQL Binlog 클라이언트
//!
//! 연결, 세션 명령어, binlog 구독, 이벤트 폴링을 하나로 묶은 진입점입니다.
//! 구독 이후 연결이 끊기면 백그라운드 감시 태스크가 마지막 위치부터 재구독합니다.

use crate::binlog::{BinlogEventDecoder, TableMetadataRegistry};
use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use crate::offset::BinlogPosition;
use crate::protocol::{ResultSet, ServerVersion};
use crate::queue::EventQueue;
use crate::reconnect::ReconnectState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SET_CHECKSUM_SQL: &str = "SET @MASTER_BINLOG_CHECKSUM=@@GLOBAL.BINLOG_CHECKSUM";
const SELECT_CHECKSUM_SQL: &str = "SELECT @@GLOBAL.BINLOG_CHECKSUM";

/// 클라이언트 동작 설정
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// 명령어 응답 대기 시간 (연결, 인증 포함)
    pub command_timeout: Duration,
    /// `poll()` 한 번의 최대 대기 시간
    pub poll_timeout: Duration,
    /// 이벤트 큐에 담을 수 있는 배치 수
    pub queue_capacity: usize,
    pub max_reconnect_attempts: u32,
    /// 재연결 시도 전 대기 시간
    pub reconnect_backoff: Duration,
    /// 트랜잭션 단위로 배치를 묶을지 여부
    pub decode_with_tx: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            command_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(100),
            queue_capacity: 2500,
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
            decode_with_tx: false,
        }
    }
}

/// 클라이언트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Disconnected,
    Connected,
    ChecksumNegotiated,
    Registered,
    Streaming,
    /// 연결이 끊겨 재구독 중
    Reconnecting,
    /// 재연결 횟수를 모두 소진했거나 복구할 수 없는 에러로 멈춤
    Stopped,
    /// `close_channel()`로 닫힘
    Closed,
}

/// 체크섬 알고리즘 이름을 이벤트 끝 체크섬 길이로 변환
pub fn checksum_length(algorithm: &str) -> Result<usize> {
    match algorithm.trim().to_ascii_uppercase().as_str() {
        "NONE" => Ok(0),
        "CRC32" => Ok(4),
        other => Err(CdcError::UnsupportedOperation(format!(
            "지원하지 않는 binlog 체크섬 알고리즘: {}",
            other
        ))),
    }
}

struct ClientInner {
    config: ConnectionConfig,
    options: ClientOptions,
    connection: Mutex<Option<Arc<MySqlConnection>>>,
    state: Mutex<ClientState>,
    server_version: Mutex<Option<ServerVersion>>,
    running: AtomicBool,
    subscribed: AtomicBool,
    closed: AtomicBool,
    queue: EventQueue,
    reconnect: Arc<ReconnectState>,
    registry: TableMetadataRegistry,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// 닫힌 뒤에는 `connect()` 외에는 상태를 바꾸지 않음
    fn transition(&self, next: ClientState) {
        let mut state = self.state.lock();
        if *state != ClientState::Closed {
            debug!("Client state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn connection(&self) -> Result<Arc<MySqlConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CdcError::ChannelClosed);
        }
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| CdcError::ConnectionError("연결되지 않았습니다".to_string()))
    }

    async fn open_connection(&self) -> Result<Arc<MySqlConnection>> {
        let connection = Arc::new(
            MySqlConnection::connect(&self.config, self.options.command_timeout).await?,
        );
        *self.server_version.lock() = Some(connection.server_version());

        let stale = self.connection.lock().replace(Arc::clone(&connection));
        if let Some(stale) = stale {
            stale.close().await;
        }
        Ok(connection)
    }

    /// CONNECTED → CHECKSUM_NEGOTIATED
    async fn negotiate_checksum(&self, connection: &MySqlConnection) -> Result<usize> {
        let version = connection.server_version();
        if !self.config.checksum_enabled || !version.at_least(5, 6, 0) {
            debug!("Skipping checksum negotiation for MySQL {}", version);
            return Ok(0);
        }

        connection.execute(SET_CHECKSUM_SQL).await?;
        let result = connection.execute_query(SELECT_CHECKSUM_SQL).await?;
        let algorithm = result.first_value().unwrap_or_default();
        let length = checksum_length(algorithm)?;
        info!("Binlog checksum {} ({} bytes)", algorithm, length);
        Ok(length)
    }

    /// 체크섬 협상 → replica 등록 → dump 요청
    async fn subscribe_on(
        &self,
        connection: &MySqlConnection,
        binlog_filename: &str,
        binlog_position: u64,
    ) -> Result<()> {
        let checksum_length = self.negotiate_checksum(connection).await?;
        self.transition(ClientState::ChecksumNegotiated);

        connection
            .register_replica(
                self.config.server_id,
                &self.config.username,
                &self.config.password,
            )
            .await?;
        self.transition(ClientState::Registered);

        let table_cache = self.registry.cache_for(&self.config.endpoint());
        let decoder = BinlogEventDecoder::new(
            binlog_filename,
            checksum_length,
            table_cache,
            self.options.decode_with_tx,
        );
        connection
            .start_binlog_dump(
                decoder,
                self.queue.producer(),
                self.config.server_id,
                binlog_filename,
                binlog_position,
            )
            .await?;
        self.transition(ClientState::Streaming);
        Ok(())
    }

    /// 새 연결을 열고 주어진 위치부터 다시 구독
    async fn resubscribe(&self, position: &BinlogPosition) -> Result<oneshot::Receiver<CdcError>> {
        let connection = self.open_connection().await?;
        if !self.running.load(Ordering::SeqCst) {
            connection.close().await;
            return Err(CdcError::ChannelClosed);
        }
        self.transition(ClientState::Connected);

        self.subscribe_on(&connection, &position.filename, position.position)
            .await?;
        connection.take_disconnect_signal().ok_or_else(|| {
            CdcError::ProtocolError("연결 종료 신호를 이미 가져갔습니다".to_string())
        })
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.transition(ClientState::Stopped);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
    }
}

/// 연결이 끊길 때마다 재구독을 시도하는 감시 태스크
async fn supervise(inner: Weak<ClientInner>, mut signal: oneshot::Receiver<CdcError>) {
    loop {
        // close() 로 닫히면 송신측이 이유 없이 drop 됨
        let Ok(reason) = signal.await else {
            return;
        };
        let Some(client) = inner.upgrade() else {
            return;
        };
        if !client.running.load(Ordering::SeqCst) || client.state() != ClientState::Streaming {
            return;
        }

        warn!("Binlog stream disconnected: {}", reason);
        match reconnect(&client).await {
            Some(next) => signal = next,
            None => return,
        }
    }
}

async fn reconnect(client: &ClientInner) -> Option<oneshot::Receiver<CdcError>> {
    let max_attempts = client.reconnect.max_attempts();

    loop {
        if !client.running.load(Ordering::SeqCst) {
            return None;
        }
        client.transition(ClientState::Reconnecting);

        let stale = client.connection.lock().take();
        if let Some(stale) = stale {
            stale.close().await;
        }

        let attempt = client.reconnect.record_attempt();
        if attempt > max_attempts {
            error!(
                "Giving up binlog stream after {} reconnect attempts",
                max_attempts
            );
            client.stop();
            return None;
        }

        tokio::time::sleep(client.options.reconnect_backoff).await;

        let Some(position) = client.reconnect.last_position() else {
            error!("No binlog position to resume from");
            client.stop();
            return None;
        };

        info!(
            "Reconnect attempt {}/{} from {}",
            attempt, max_attempts, position
        );
        match client.resubscribe(&position).await {
            Ok(signal) => {
                client.reconnect.reset();
                info!("Resumed binlog stream at {}", position);
                return Some(signal);
            }
            Err(e) if e.is_retryable() => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
            }
            Err(e) => {
                error!("Reconnect aborted: {}", e);
                client.stop();
                return None;
            }
        }
    }
}

/// Binlog 클라이언트
#[derive(Clone)]
pub struct BinlogClient {
    inner: Arc<ClientInner>,
}

impl BinlogClient {
    pub fn new(config: ConnectionConfig, options: ClientOptions) -> Self {
        let reconnect = Arc::new(ReconnectState::new(options.max_reconnect_attempts));
        let queue = EventQueue::new(
            options.queue_capacity,
            options.poll_timeout,
            Arc::clone(&reconnect),
        );

        BinlogClient {
            inner: Arc::new(ClientInner {
                config,
                options,
                connection: Mutex::new(None),
                state: Mutex::new(ClientState::Disconnected),
                server_version: Mutex::new(None),
                running: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                queue,
                reconnect,
                registry: TableMetadataRegistry::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// 서버에 연결하고 인증
    ///
    /// 구독 중(재연결 포함)에는 스트리밍 연결을 바꿔치지 않도록 거부합니다.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(CdcError::UnsupportedOperation(
                "binlog 구독 중에는 다시 연결할 수 없습니다".to_string(),
            ));
        }
        self.inner.open_connection().await?;
        self.inner.closed.store(false, Ordering::SeqCst);
        *self.inner.state.lock() = ClientState::Connected;
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<bool> {
        self.inner.connection()?.execute(sql).await
    }

    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        self.inner.connection()?.execute_update(sql).await
    }

    pub async fn execute_query(&self, sql: &str) -> Result<ResultSet> {
        self.inner.connection()?.execute_query(sql).await
    }

    /// 주어진 위치부터 binlog 구독 시작
    ///
    /// 구독 단계의 실패는 그대로 반환합니다. 구독 이후의 연결 끊김은
    /// 감시 태스크가 처리합니다. 이미 구독 중이면 상태를 건드리지 않고 거부합니다.
    pub async fn subscribe(&self, binlog_filename: &str, binlog_position: u64) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CdcError::UnsupportedOperation(
                "이미 binlog 를 구독 중입니다".to_string(),
            ));
        }

        let connection = match self.inner.connection() {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(
            "Subscribing to binlog from {}:{}",
            binlog_filename, binlog_position
        );

        self.inner
            .reconnect
            .start_from(BinlogPosition::new(binlog_filename, binlog_position));
        self.inner.reconnect.reset();

        if let Err(e) = self
            .inner
            .subscribe_on(&connection, binlog_filename, binlog_position)
            .await
        {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.inner.subscribed.store(true, Ordering::SeqCst);

        if let Some(signal) = connection.take_disconnect_signal() {
            let supervisor = tokio::spawn(supervise(Arc::downgrade(&self.inner), signal));
            let previous = self.inner.supervisor.lock().replace(supervisor);
            if let Some(previous) = previous {
                previous.abort();
            }
        }
        Ok(())
    }

    /// 다음 이벤트 배치를 최대 `poll_timeout` 동안 기다림
    ///
    /// 구독 전에는 바로 빈 배치를, `close_channel()` 이후에는 `ChannelClosed` 를 반환합니다.
    pub async fn poll(&self) -> Result<Vec<BinlogEvent>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CdcError::ChannelClosed);
        }
        if !self.inner.subscribed.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self.inner.queue.poll().await)
    }

    /// 연결을 닫고 스트리밍 중단
    ///
    /// 실제로 연결을 해제했으면 true, 이미 닫혀 있었으면 false 를 반환합니다.
    pub async fn close_channel(&self) -> bool {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.state.lock() = ClientState::Closed;

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }

        self.inner.registry.remove(&self.inner.config.endpoint());

        let connection = self.inner.connection.lock().take();
        match connection {
            Some(connection) => connection.close().await,
            None => false,
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// 스트리밍이 진행 중이거나 재연결 중이면 true
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 재구독 시작 지점
    pub fn last_position(&self) -> Option<BinlogPosition> {
        self.inner.reconnect.last_position()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.attempts()
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        *self.inner.server_version.lock()
    }

    /// 큐에 쌓여 아직 poll 되지 않은 배치 수
    pub fn queued_batches(&self) -> usize {
        self.inner.queue.len()
    }
}
