use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("malformed config: {0}")]
    Malformed(String),
    #[error("{key} = {value} is out of range ({bound})")]
    OutOfRange {
        key: &'static str,
        value: i64,
        bound: &'static str,
    },
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database unreachable: {0}")]
    Unreachable(String),
    #[error("row rejected by database: {0}")]
    Rejected(String),
    #[error("no open database connection")]
    NotConnected,
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => StorageError::Rejected(db.to_string()),
            other => StorageError::Unreachable(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT broker unreachable: {0}")]
    Unreachable(String),
    #[error("MQTT subscribe failed: {0}")]
    Subscribe(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),
    #[error("field '{field}' is not numeric: {value}")]
    TypeMismatch { field: String, value: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("device identifier is empty")]
    EmptyDeviceId,
    #[error("moisture level is missing")]
    MissingMoisture,
    #[error("{field} = {value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Umbrella error for the startup sequence, where any failure is fatal.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("logging setup failed: {0}")]
    Logging(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
