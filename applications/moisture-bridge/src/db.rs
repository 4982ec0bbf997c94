use crate::config::DatabaseSettings;
use crate::error::StorageError;
use crate::mapping::Reading;
use crate::state::{ConnectionState, StateCell};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Bounds one insert, including the wait for the connection. Also bounds
/// how long reconnect waits for a running insert to let go.
pub const INSERT_TIMEOUT: Duration = Duration::from_secs(5);

pub const TABLE: &str = "moisture_readings";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS moisture_readings (
    id BIGSERIAL PRIMARY KEY,
    sensor_id TEXT NOT NULL,
    "timestamp" TIMESTAMPTZ NOT NULL,
    moisture_level DOUBLE PRECISION NOT NULL,
    temperature DOUBLE PRECISION,
    humidity DOUBLE PRECISION,
    battery_level DOUBLE PRECISION,
    raw_data TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_INDEXES: [&str; 2] = [
    r#"CREATE INDEX IF NOT EXISTS idx_moisture_readings_sensor_timestamp ON moisture_readings (sensor_id, "timestamp")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_moisture_readings_timestamp ON moisture_readings ("timestamp")"#,
];

const INSERT_READING: &str = r#"
INSERT INTO moisture_readings
    (sensor_id, "timestamp", moisture_level, temperature, humidity, battery_level, raw_data)
VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

/// Durable sink for validated readings.
///
/// Shared between the delivery task (inserts) and the supervisor (probe,
/// reconnect, close), so implementations serialize access internally.
#[async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Idempotent; safe on every startup.
    async fn ensure_schema(&self) -> Result<(), StorageError>;
    /// One row, auto-committed.
    async fn insert(&self, reading: &Reading) -> Result<(), StorageError>;
    /// Cheap liveness check bounded by a short timeout.
    async fn probe(&self) -> bool;
    async fn reconnect(&self) -> Result<(), StorageError>;
    /// Safe to call more than once.
    async fn close(&self) -> Result<(), StorageError>;
    fn state(&self) -> ConnectionState;
}

pub struct PgGateway {
    options: PgConnectOptions,
    conn: Mutex<Option<PgConnection>>,
    state: StateCell,
}

impl PgGateway {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StorageError> {
        let gateway = Self {
            options: connect_options(settings),
            conn: Mutex::new(None),
            state: StateCell::new("storage"),
        };
        gateway.state.set(ConnectionState::Connecting);
        match open(&gateway.options).await {
            Ok(conn) => {
                *gateway.conn.lock().await = Some(conn);
                gateway.state.set(ConnectionState::Connected);
            }
            Err(e) => {
                gateway.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        }
        info!(
            host = %settings.host,
            port = settings.port,
            database = %settings.name,
            "connected to database"
        );
        Ok(gateway)
    }

    async fn lock_conn(&self) -> Result<MutexGuard<'_, Option<PgConnection>>, StorageError> {
        timeout(INSERT_TIMEOUT, self.conn.lock()).await.map_err(|_| {
            StorageError::Unreachable(format!(
                "database connection still busy after {}s",
                INSERT_TIMEOUT.as_secs()
            ))
        })
    }
}

pub fn connect_options(settings: &DatabaseSettings) -> PgConnectOptions {
    let opts = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .database(&settings.name)
        .username(&settings.user);
    if settings.password.is_empty() {
        opts
    } else {
        opts.password(&settings.password)
    }
}

// Auth failures surface as database errors from sqlx; on connect they
// still mean "unreachable".
async fn open(options: &PgConnectOptions) -> Result<PgConnection, StorageError> {
    match timeout(CONNECT_TIMEOUT, PgConnection::connect_with(options)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(StorageError::Unreachable(e.to_string())),
        Err(_) => Err(StorageError::Unreachable(format!(
            "connect timed out after {}s",
            CONNECT_TIMEOUT.as_secs()
        ))),
    }
}

async fn close_quietly(conn: PgConnection) {
    match timeout(PROBE_TIMEOUT, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "error closing stale database connection"),
        Err(_) => debug!("timed out closing stale database connection"),
    }
}

#[async_trait]
impl ReadingStore for PgGateway {
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StorageError::NotConnected)?;
        sqlx::query(CREATE_TABLE).execute(&mut *conn).await?;
        for ddl in CREATE_INDEXES {
            sqlx::query(ddl).execute(&mut *conn).await?;
        }
        info!(table = TABLE, "database schema verified");
        Ok(())
    }

    async fn insert(&self, r: &Reading) -> Result<(), StorageError> {
        let write = async {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(StorageError::NotConnected)?;
            sqlx::query(INSERT_READING)
                .bind(&r.device_id)
                .bind(r.timestamp)
                .bind(r.moisture_level())
                .bind(r.temperature)
                .bind(r.humidity)
                .bind(r.battery)
                .bind(&r.raw_payload)
                .execute(&mut *conn)
                .await?;
            Ok::<(), StorageError>(())
        };
        timeout(INSERT_TIMEOUT, write).await.map_err(|_| {
            StorageError::Unreachable(format!(
                "insert timed out after {}s",
                INSERT_TIMEOUT.as_secs()
            ))
        })?
    }

    async fn probe(&self) -> bool {
        let check = async {
            let mut guard = self.conn.lock().await;
            match guard.as_mut() {
                Some(conn) => sqlx::query("SELECT 1").execute(&mut *conn).await.is_ok(),
                None => false,
            }
        };
        let alive = timeout(PROBE_TIMEOUT, check).await.unwrap_or(false);
        match (alive, self.state.get()) {
            (false, ConnectionState::Connected) => {
                warn!("database liveness probe failed");
                self.state.set(ConnectionState::Degraded);
            }
            (true, ConnectionState::Degraded) => {
                self.state.set(ConnectionState::Connected);
            }
            _ => {}
        }
        alive
    }

    // The lock is only held to swap handles, so inserts fail fast with
    // NotConnected instead of waiting out the connect timeout.
    async fn reconnect(&self) -> Result<(), StorageError> {
        self.state.set(ConnectionState::Connecting);
        let stale = match self.lock_conn().await {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if let Some(conn) = stale {
            close_quietly(conn).await;
        }
        let fresh = match open(&self.options).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        match self.lock_conn().await {
            Ok(mut guard) => *guard = Some(fresh),
            Err(e) => {
                close_quietly(fresh).await;
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        }
        self.state.set(ConnectionState::Connected);
        info!("reconnected to database");
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await.take();
        self.state.set(ConnectionState::Disconnected);
        let Some(conn) = conn else {
            return Ok(());
        };
        match timeout(PROBE_TIMEOUT, conn.close()).await {
            Ok(Ok(())) => {
                info!("database connection closed");
                Ok(())
            }
            Ok(Err(e)) => Err(StorageError::Unreachable(e.to_string())),
            Err(_) => Err(StorageError::Unreachable("timed out closing connection".into())),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::normalize;

    fn settings(password: &str) -> DatabaseSettings {
        DatabaseSettings {
            host: "db.local".into(),
            port: 6543,
            name: "moisture_db".into(),
            user: "bridge".into(),
            password: password.into(),
        }
    }

    #[test]
    fn test_connect_options() {
        let opts = connect_options(&settings("secret"));
        assert_eq!(opts.get_host(), "db.local");
        assert_eq!(opts.get_port(), 6543);
        assert_eq!(opts.get_database(), Some("moisture_db"));
        assert_eq!(opts.get_username(), "bridge");
    }

    fn idle_gateway() -> PgGateway {
        PgGateway {
            options: connect_options(&settings("")),
            conn: Mutex::new(None),
            state: StateCell::new("storage"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_connection_does_not_block_insert_or_reconnect() {
        let gw = idle_gateway();
        gw.state.set(ConnectionState::Connected);
        let _stuck = gw.conn.lock().await;

        let reading = normalize("moisture/s1/data", br#"{"moisture": 40}"#).unwrap();
        let err = gw.insert(&reading).await.unwrap_err();
        assert!(matches!(err, StorageError::Unreachable(_)), "{err}");

        let err = gw.reconnect().await.unwrap_err();
        assert!(matches!(err, StorageError::Unreachable(_)), "{err}");
        assert_eq!(gw.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_insert_without_connection() {
        let gw = idle_gateway();
        let reading = normalize("moisture/s1/data", br#"{"moisture": 40}"#).unwrap();
        assert!(matches!(
            gw.insert(&reading).await,
            Err(StorageError::NotConnected)
        ));
        assert!(!gw.probe().await);
        gw.close().await.unwrap();
        gw.close().await.unwrap();
    }

    #[test]
    fn test_schema_statements_are_idempotent() {
        assert!(CREATE_TABLE.contains("IF NOT EXISTS"));
        assert!(CREATE_INDEXES.iter().all(|ddl| ddl.contains("IF NOT EXISTS")));
    }

    #[test]
    fn test_insert_binds_every_column() {
        let placeholders = (1..=7).map(|i| format!("${i}")).collect::<Vec<_>>();
        for p in &placeholders {
            assert!(INSERT_READING.contains(p.as_str()), "missing {p}");
        }
        assert!(!INSERT_READING.contains("$8"));
    }
}
