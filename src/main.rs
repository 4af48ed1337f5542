/// MySQL Binlog 클라이언트 사용 예제
///
/// 환경 변수로 접속 정보를 받아 binlog를 구독하고 이벤트를 로그로 출력합니다.
use mysql_binlog_client::binlog_client::{BinlogClient, ClientOptions};
use mysql_binlog_client::connection::ConnectionConfig;
use mysql_binlog_client::events::BinlogEventData;
use std::env;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    // 연결 설정
    let config = ConnectionConfig {
        hostname: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("DB_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        username: env::var("DB_USER").unwrap_or_else(|_| "testuser".to_string()),
        password: env::var("DB_PASSWORD").unwrap_or_else(|_| "testpass".to_string()),
        server_id: env::var("SERVER_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1001),
        checksum_enabled: true,
    };
    let binlog_file = env::var("BINLOG_FILE").unwrap_or_else(|_| "mysql-bin.000001".to_string());
    let binlog_position: u64 = env::var("BINLOG_POSITION")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);

    let client = BinlogClient::new(config, ClientOptions::default());
    client.connect().await?;
    info!("Connected to MySQL {:?}", client.server_version());

    client.subscribe(&binlog_file, binlog_position).await?;
    info!("Listening for binlog events from {}:{}", binlog_file, binlog_position);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            batch = client.poll() => {
                for event in batch? {
                    match &event.data {
                        BinlogEventData::Query(query) => {
                            info!("{} [{}] {}", event.binlog_position(), query.database, query.query)
                        }
                        BinlogEventData::Rows(rows) => info!(
                            "{} {:?} {}.{} ({} bytes)",
                            event.binlog_position(),
                            event.event_type,
                            rows.database,
                            rows.table,
                            rows.body.len()
                        ),
                        other => info!("{} {:?}", event.binlog_position(), other),
                    }
                }

                if !client.is_running() {
                    warn!("Binlog stream stopped in state {:?}", client.state());
                    break;
                }
            }
        }
    }

    client.close_channel().await;
    info!("Last position: {:?}", client.last_position());
    Ok(())
}
