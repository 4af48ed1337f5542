//! MySQL 데이터베이스 연결 관리
//!
//! 소켓 하나와 그 소켓을 읽는 수신 태스크 하나로 구성됩니다.
//! 수신 태스크는 현재 설치된 핸들러(명령 응답 또는 binlog 디코더)로 패킷을 넘깁니다.

use crate::auth::{self, AuthPlugin, RsaTransformation};
use crate::binlog::BinlogEventDecoder;
use crate::error::{CdcError, Result};
use crate::protocol::{
    self, ErrPacket, GreetingPacket, OkPacket, PacketCodec, ResultSet, SequenceId, ServerVersion,
    AUTH_MORE_DATA_HEADER, EOF_HEADER, ERR_HEADER, OK_HEADER,
};
use crate::queue::{EventBatch, EventProducer};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 복제 클라이언트로 등록할 server id (서버의 다른 replica와 겹치면 안 됨)
    pub server_id: u32,
    /// false면 체크섬 협상을 건너뜀
    pub checksum_enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            server_id: 1,
            checksum_enabled: true,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// 테이블 메타데이터 레지스트리 키 (`host:port`)
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

type PacketStream = Framed<TcpStream, PacketCodec>;
type PendingSlot = Option<oneshot::Sender<Result<CommandResponse>>>;

/// 단일 명령어에 대한 응답
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Ok(OkPacket),
    ResultSet(ResultSet),
}

#[derive(Debug, Default)]
enum ReadState {
    #[default]
    Start,
    Columns {
        expected: usize,
        result: ResultSet,
    },
    Rows {
        result: ResultSet,
    },
}

/// 명령 응답 핸들러
///
/// OK / ERR / 텍스트 결과셋(컬럼 정의, EOF, 행, EOF)을 조립합니다.
#[derive(Debug, Default)]
pub struct CommandResponseHandler {
    state: ReadState,
}

impl CommandResponseHandler {
    /// 패킷 하나를 처리하고 응답이 완성되면 반환
    pub fn handle(&mut self, packet: &[u8]) -> Option<Result<CommandResponse>> {
        let state = std::mem::take(&mut self.state);
        match state {
            ReadState::Start => match packet.first() {
                Some(&OK_HEADER) => Some(OkPacket::parse(packet).map(CommandResponse::Ok)),
                Some(&ERR_HEADER) => Some(Err(server_error(packet))),
                Some(_) => {
                    let expected = match protocol::read_lenenc_int(&mut Cursor::new(packet)) {
                        Ok(count) => count as usize,
                        Err(e) => return Some(Err(e)),
                    };
                    self.state = ReadState::Columns {
                        expected,
                        result: ResultSet::default(),
                    };
                    None
                }
                None => Some(Err(CdcError::ProtocolError(
                    "비어 있는 응답 패킷".to_string(),
                ))),
            },
            ReadState::Columns {
                expected,
                mut result,
            } => {
                if protocol::is_error_packet(packet) {
                    return Some(Err(server_error(packet)));
                }
                if result.columns.len() == expected && protocol::is_eof_packet(packet) {
                    self.state = ReadState::Rows { result };
                    return None;
                }
                match protocol::parse_column_definition(packet) {
                    Ok(column) => result.columns.push(column),
                    Err(e) => return Some(Err(e)),
                }
                self.state = ReadState::Columns { expected, result };
                None
            }
            ReadState::Rows { mut result } => {
                if protocol::is_eof_packet(packet) {
                    return Some(Ok(CommandResponse::ResultSet(result)));
                }
                if protocol::is_error_packet(packet) {
                    return Some(Err(server_error(packet)));
                }
                match protocol::parse_text_row(packet, result.columns.len()) {
                    Ok(row) => result.rows.push(row),
                    Err(e) => return Some(Err(e)),
                }
                self.state = ReadState::Rows { result };
                None
            }
        }
    }
}

fn server_error(packet: &[u8]) -> CdcError {
    match ErrPacket::parse(packet) {
        Ok(err) => err.into_error(),
        Err(e) => e,
    }
}

/// 수신 태스크에 설치되는 핸들러
enum PacketHandler {
    Command(CommandResponseHandler),
    Binlog {
        decoder: BinlogEventDecoder,
        producer: EventProducer,
    },
}

/// 수신 태스크와 호출자가 공유하는 상태
struct SharedState {
    handler: Mutex<PacketHandler>,
    pending: Mutex<PendingSlot>,
}

impl SharedState {
    fn is_streaming(&self) -> bool {
        matches!(*self.handler.lock(), PacketHandler::Binlog { .. })
    }

    fn fail_pending(&self, err: CdcError) {
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.send(Err(err));
        }
    }
}

enum Dispatch {
    Nothing,
    Response(Result<CommandResponse>),
    Batch(EventProducer, EventBatch),
}

/// MySQL 연결
pub struct MySqlConnection {
    sink: tokio::sync::Mutex<SplitSink<PacketStream, Bytes>>,
    sequence: SequenceId,
    shared: Arc<SharedState>,
    command_lock: tokio::sync::Mutex<()>,
    command_timeout: Duration,
    server_version: ServerVersion,
    local_addr: SocketAddr,
    reader: JoinHandle<()>,
    disconnect: Mutex<Option<oneshot::Receiver<CdcError>>>,
    closed: AtomicBool,
}

impl MySqlConnection {
    /// 소켓을 열고 인증까지 마친 연결 반환
    ///
    /// 연결과 인증은 각각 `command_timeout` 안에 끝나야 합니다.
    pub async fn connect(config: &ConnectionConfig, command_timeout: Duration) -> Result<Self> {
        let endpoint = config.endpoint();
        info!("Connecting to {}", endpoint);

        let stream = timeout(
            command_timeout,
            TcpStream::connect((config.hostname.as_str(), config.port)),
        )
        .await
        .map_err(|_| CdcError::Timeout)?
        .map_err(|e| CdcError::ConnectionError(format!("{} 연결 실패: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;

        let sequence = SequenceId::default();
        let mut framed = Framed::new(stream, PacketCodec::new(sequence.clone()));

        let server_version = timeout(command_timeout, negotiate(&mut framed, config))
            .await
            .map_err(|_| CdcError::Timeout)??;
        info!("Authenticated to MySQL {} at {}", server_version, endpoint);

        let (sink, stream) = framed.split();
        let shared = Arc::new(SharedState {
            handler: Mutex::new(PacketHandler::Command(CommandResponseHandler::default())),
            pending: Mutex::new(None),
        });

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let reason = read_loop(stream, &reader_shared).await;
            warn!("Connection reader stopped: {}", reason);
            reader_shared.fail_pending(CdcError::ConnectionError(reason.to_string()));
            let _ = disconnect_tx.send(reason);
        });

        Ok(MySqlConnection {
            sink: tokio::sync::Mutex::new(sink),
            sequence,
            shared,
            command_lock: tokio::sync::Mutex::new(()),
            command_timeout,
            server_version,
            local_addr,
            reader,
            disconnect: Mutex::new(Some(disconnect_rx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn server_version(&self) -> ServerVersion {
        self.server_version
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 연결이 예기치 않게 끊어지면 끊긴 이유를 받는 신호
    ///
    /// 한 번만 가져갈 수 있습니다. `close()`로 닫힌 경우에는 이유 없이 끝납니다.
    pub fn take_disconnect_signal(&self) -> Option<oneshot::Receiver<CdcError>> {
        self.disconnect.lock().take()
    }

    /// 명령어를 실행하고 성공 여부 반환
    pub async fn execute(&self, sql: &str) -> Result<bool> {
        debug!("Execute: {}", sql);
        self.send_command(protocol::create_query_command(sql))
            .await
            .map(|_| true)
    }

    /// 명령어를 실행하고 영향받은 행 수 반환
    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        debug!("Execute update: {}", sql);
        match self.send_command(protocol::create_query_command(sql)).await? {
            CommandResponse::Ok(ok) => Ok(ok.affected_rows),
            CommandResponse::ResultSet(_) => Err(CdcError::ProtocolError(
                "Could not get MySQL OK packet".to_string(),
            )),
        }
    }

    /// 쿼리를 실행하고 결과셋 반환
    pub async fn execute_query(&self, sql: &str) -> Result<ResultSet> {
        debug!("Execute query: {}", sql);
        match self.send_command(protocol::create_query_command(sql)).await? {
            CommandResponse::ResultSet(result) => Ok(result),
            CommandResponse::Ok(_) => Err(CdcError::ProtocolError(
                "unexpected response type: expected result set".to_string(),
            )),
        }
    }

    /// COM_REGISTER_SLAVE 전송
    pub async fn register_replica(&self, server_id: u32, username: &str, password: &str) -> Result<()> {
        let command = protocol::create_register_slave_command(
            server_id,
            &self.local_addr.ip().to_string(),
            username,
            password,
            self.local_addr.port(),
        )?;

        match self.send_command(command).await? {
            CommandResponse::Ok(_) => {
                info!("Registered as replica with server id {}", server_id);
                Ok(())
            }
            CommandResponse::ResultSet(_) => Err(CdcError::ProtocolError(
                "Could not get MySQL OK packet".to_string(),
            )),
        }
    }

    /// binlog 디코더를 설치하고 COM_BINLOG_DUMP 전송
    ///
    /// 이후 이 연결로 들어오는 모든 패킷은 이벤트로 처리됩니다.
    pub async fn start_binlog_dump(
        &self,
        decoder: BinlogEventDecoder,
        producer: EventProducer,
        server_id: u32,
        binlog_filename: &str,
        binlog_position: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        let command =
            protocol::create_binlog_dump_command(server_id, binlog_filename, binlog_position)?;

        let _guard = self.command_lock.lock().await;
        *self.shared.handler.lock() = PacketHandler::Binlog { decoder, producer };
        self.sequence.reset();
        self.write(command).await?;

        info!(
            "Sent COM_BINLOG_DUMP: file={}, position={}",
            binlog_filename, binlog_position
        );
        Ok(())
    }

    /// 연결 종료
    ///
    /// 이미 닫힌 연결이면 아무것도 하지 않고 false 를 반환합니다.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.reader.abort();
        self.shared.fail_pending(CdcError::ChannelClosed);
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("Error while closing socket: {}", e);
        }

        info!("Closed connection from {}", self.local_addr);
        true
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CdcError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    async fn write(&self, packet: Bytes) -> Result<()> {
        self.sink.lock().await.send(packet).await
    }

    /// 시퀀스를 0으로 되돌리고 명령어를 보낸 뒤 응답을 기다림
    ///
    /// `command_timeout` 안에 응답이 없으면 연결을 닫고 `Timeout` 을 반환합니다.
    async fn send_command(&self, command: Bytes) -> Result<CommandResponse> {
        self.ensure_open()?;
        let _guard = self.command_lock.lock().await;

        if self.shared.is_streaming() {
            return Err(CdcError::UnsupportedOperation(
                "binlog 스트리밍 중인 연결에서는 명령어를 실행할 수 없습니다".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.is_some() {
                return Err(CdcError::ProtocolError(
                    "이미 응답을 기다리는 명령어가 있습니다".to_string(),
                ));
            }
            *pending = Some(tx);
        }

        self.sequence.reset();
        if let Err(e) = self.write(command).await {
            self.shared.pending.lock().take();
            return Err(e);
        }

        match timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdcError::ConnectionError(
                "응답을 받기 전에 연결이 끊어졌습니다".to_string(),
            )),
            Err(_) => {
                // 늦게 도착한 응답을 다음 명령어의 응답과 구분할 수 없으므로 연결을 버림
                self.shared.pending.lock().take();
                warn!(
                    "Command timed out after {:?}, closing connection",
                    self.command_timeout
                );
                self.close().await;
                Err(CdcError::Timeout)
            }
        }
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// 수신 루프. 루프가 끝난 이유를 반환합니다.
async fn read_loop(mut stream: SplitStream<PacketStream>, shared: &SharedState) -> CdcError {
    while let Some(frame) = stream.next().await {
        let packet = match frame {
            Ok(packet) => packet,
            Err(e) => return e,
        };

        let dispatch = {
            let mut handler = shared.handler.lock();
            match &mut *handler {
                PacketHandler::Command(handler) => match handler.handle(&packet) {
                    Some(result) => Dispatch::Response(result),
                    None => Dispatch::Nothing,
                },
                PacketHandler::Binlog { decoder, producer } => match decoder.decode(&packet) {
                    Ok(Some(batch)) => Dispatch::Batch(producer.clone(), batch),
                    Ok(None) => Dispatch::Nothing,
                    Err(e) => return e,
                },
            }
        };

        match dispatch {
            Dispatch::Nothing => {}
            Dispatch::Response(result) => match shared.pending.lock().take() {
                Some(pending) => {
                    let _ = pending.send(result);
                }
                None => warn!("Dropping response with no pending command"),
            },
            Dispatch::Batch(producer, batch) => {
                if let Err(e) = producer.push(batch).await {
                    return e;
                }
            }
        }
    }

    CdcError::ConnectionError("서버가 연결을 닫았습니다".to_string())
}

async fn read_packet(framed: &mut PacketStream) -> Result<Bytes> {
    match framed.next().await {
        Some(packet) => packet,
        None => Err(CdcError::ConnectionError(
            "인증 중 서버가 연결을 닫았습니다".to_string(),
        )),
    }
}

/// Greeting 수신부터 인증 완료까지 진행하고 서버 버전 반환
async fn negotiate(framed: &mut PacketStream, config: &ConnectionConfig) -> Result<ServerVersion> {
    let packet = read_packet(framed).await?;
    if protocol::is_error_packet(&packet) {
        let err = ErrPacket::parse(&packet)?;
        return Err(CdcError::NegotiationFailure(format!(
            "{} ({})",
            err.message, err.code
        )));
    }

    let greeting = GreetingPacket::parse(&packet)?;
    let server_version = ServerVersion::parse(&greeting.server_version);
    info!(
        "MySQL Server version: {}, Thread ID: {}",
        greeting.server_version, greeting.thread_id
    );

    let mut plugin = AuthPlugin::from_name(&greeting.auth_plugin_name).unwrap_or_else(|_| {
        debug!(
            "Unknown auth plugin '{}', falling back to mysql_native_password",
            greeting.auth_plugin_name
        );
        AuthPlugin::NativePassword
    });
    let mut seed = greeting.scramble.clone();

    let response = auth::create_handshake_response(
        &config.username,
        &config.password,
        plugin,
        &seed,
        greeting.server_collation,
    )?;
    framed.send(Bytes::from(response)).await?;

    loop {
        let packet = read_packet(framed).await?;
        match packet.first() {
            Some(&OK_HEADER) => return Ok(server_version),
            Some(&ERR_HEADER) => {
                let err = ErrPacket::parse(&packet)?;
                return Err(CdcError::NegotiationFailure(format!(
                    "{} ({})",
                    err.message, err.code
                )));
            }
            Some(&EOF_HEADER) => {
                let (name, new_seed) = parse_auth_switch(&packet[1..]);
                plugin = AuthPlugin::from_name(&name)?;
                seed = new_seed;
                debug!("Switching auth plugin to {}", plugin.name());
                let response = auth::create_auth_response(plugin, &config.password, &seed);
                framed.send(Bytes::from(response)).await?;
            }
            Some(&AUTH_MORE_DATA_HEADER) => {
                let response = match (plugin, &packet[1..]) {
                    (AuthPlugin::CachingSha2Password, [auth::FAST_AUTH_SUCCESS]) => {
                        debug!("caching_sha2_password fast authentication succeeded");
                        continue;
                    }
                    (AuthPlugin::CachingSha2Password, [auth::PERFORM_FULL_AUTHENTICATION]) => {
                        debug!("caching_sha2_password requires full authentication");
                        vec![auth::CACHING_SHA2_REQUEST_PUBLIC_KEY]
                    }
                    (AuthPlugin::NativePassword, _) => {
                        return Err(CdcError::ProtocolError(
                            "mysql_native_password 인증 중 예상하지 못한 AuthMoreData".to_string(),
                        ))
                    }
                    (_, public_key) => {
                        let transformation = RsaTransformation::for_plugin(
                            plugin,
                            server_version.at_least(8, 0, 5),
                        );
                        debug!("Encrypting password with {}", transformation.name());
                        auth::encrypt_with_public_key(
                            config.password.as_bytes(),
                            &seed,
                            &String::from_utf8_lossy(public_key),
                            transformation,
                        )?
                    }
                };
                framed.send(Bytes::from(response)).await?;
            }
            Some(other) => {
                return Err(CdcError::ProtocolError(format!(
                    "인증 중 예상하지 못한 패킷 0x{:02x}",
                    other
                )))
            }
            None => {
                return Err(CdcError::ProtocolError(
                    "인증 중 비어 있는 패킷".to_string(),
                ))
            }
        }
    }
}

/// AuthSwitchRequest 본문: 플러그인명 + 0x00 + seed (+ 0x00)
fn parse_auth_switch(data: &[u8]) -> (String, Vec<u8>) {
    let name_end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let name = String::from_utf8_lossy(&data[..name_end]).to_string();

    let mut seed = data.get(name_end + 1..).unwrap_or_default().to_vec();
    if seed.last() == Some(&0) {
        seed.pop();
    }
    (name, seed)
}
