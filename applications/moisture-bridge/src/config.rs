use crate::error::ConfigError;
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};
use tracing::Level;

/// Resolved, immutable settings. Built once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub database: DatabaseSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    /// Empty means anonymous; credentials are only sent when both are non-empty.
    pub username: String,
    pub password: String,
    pub topic: String,
    pub qos: u8,
    pub keepalive: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub id: String,
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    pub max_runtime: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: Level,
    /// `None` logs to stdout only.
    pub file: Option<PathBuf>,
}

// On-disk shape. Every key is optional; sections are checked separately.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    mqtt: Option<FileMqtt>,
    database: Option<FileDatabase>,
    client: Option<FileClient>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileMqtt {
    broker: Option<String>,
    port: Option<i64>,
    username: Option<String>,
    password: Option<String>,
    topic: Option<String>,
    qos: Option<i64>,
    keepalive: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDatabase {
    host: Option<String>,
    port: Option<i64>,
    name: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileClient {
    id: Option<String>,
    reconnect_delay: Option<i64>,
    max_retries: Option<i64>,
    max_runtime: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLogging {
    level: Option<String>,
    file: Option<String>,
}

const PORT_RANGE: RangeInclusive<i64> = 1..=65535;
// One year; keeps the run deadline representable as an Instant.
const MAX_RUNTIME_RANGE: RangeInclusive<i64> = 1..=31_536_000;

impl Settings {
    /// Load YAML from disk, expand $(VAR)/${VAR} placeholders, then apply
    /// the documented environment overrides from the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<E>(path: impl AsRef<Path>, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Io(e),
        })?;
        Self::from_yaml(&raw, env)
    }

    pub fn from_yaml<E>(raw: &str, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let expanded = expand_env_placeholders(raw, &env)?;
        let file: FileConfig = if expanded.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::Malformed(e.to_string()))?
        };

        let missing: Vec<&str> = [
            ("mqtt", file.mqtt.is_none()),
            ("database", file.database.is_none()),
            ("logging", file.logging.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Malformed(format!(
                "missing required section(s): {}",
                missing.join(", ")
            )));
        }

        let r = Resolver { env: &env };
        let mqtt = file.mqtt.unwrap_or_default();
        let database = file.database.unwrap_or_default();
        let client = file.client.unwrap_or_default();
        let logging = file.logging.unwrap_or_default();

        Ok(Settings {
            mqtt: MqttSettings {
                broker: r.text("MQTT_BROKER", mqtt.broker, "localhost"),
                port: r.int("mqtt.port", "MQTT_PORT", mqtt.port, 1883, PORT_RANGE, "1..=65535")?
                    as u16,
                username: r.text("MQTT_USERNAME", mqtt.username, ""),
                password: r.text("MQTT_PASSWORD", mqtt.password, ""),
                topic: r.text("MQTT_TOPIC", mqtt.topic, "moisture/+/data"),
                qos: r.int("mqtt.qos", "MQTT_QOS", mqtt.qos, 1, 0..=2, "0..=2")? as u8,
                keepalive: secs(r.int(
                    "mqtt.keepalive",
                    "MQTT_KEEPALIVE",
                    mqtt.keepalive,
                    60,
                    1..=u16::MAX as i64,
                    "1..=65535",
                )?),
            },
            database: DatabaseSettings {
                host: r.text("DB_HOST", database.host, "localhost"),
                port: r.int(
                    "database.port",
                    "DB_PORT",
                    database.port,
                    5432,
                    PORT_RANGE,
                    "1..=65535",
                )? as u16,
                name: r.text("DB_NAME", database.name, "moisture_db"),
                user: r.text("DB_USER", database.user, "postgres"),
                password: r.text("DB_PASSWORD", database.password, ""),
            },
            client: ClientSettings {
                id: r.text("CLIENT_ID", client.id, "moisture_client"),
                reconnect_delay: secs(r.int(
                    "client.reconnect_delay",
                    "RECONNECT_DELAY",
                    client.reconnect_delay,
                    5,
                    0..=86_400,
                    "0..=86400",
                )?),
                max_retries: r.int(
                    "client.max_retries",
                    "MAX_RETRIES",
                    client.max_retries,
                    3,
                    0..=u32::MAX as i64,
                    ">= 0",
                )? as u32,
                max_runtime: secs(r.int(
                    "client.max_runtime",
                    "MAX_RUNTIME",
                    client.max_runtime,
                    300,
                    MAX_RUNTIME_RANGE,
                    "1..=31536000",
                )?),
            },
            logging: LoggingSettings {
                level: parse_level(&r.text("LOG_LEVEL", logging.level, "info"))?,
                file: Some(r.text("LOG_FILE", logging.file, "logs/moisture_bridge.log"))
                    .filter(|f| !f.trim().is_empty())
                    .map(PathBuf::from),
            },
        })
    }
}

fn secs(v: i64) -> Duration {
    Duration::from_secs(v as u64)
}

/// Applies "env var wins over file value wins over default".
struct Resolver<'a, E> {
    env: &'a E,
}

impl<E> Resolver<'_, E>
where
    E: Fn(&str) -> Option<String>,
{
    fn text(&self, var: &str, file: Option<String>, default: &str) -> String {
        (self.env)(var)
            .or(file)
            .unwrap_or_else(|| default.to_string())
    }

    fn int(
        &self,
        key: &'static str,
        var: &str,
        file: Option<i64>,
        default: i64,
        range: RangeInclusive<i64>,
        bound: &'static str,
    ) -> Result<i64, ConfigError> {
        let value = match (self.env)(var) {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                ConfigError::Malformed(format!("{var}={raw:?} is not an integer"))
            })?,
            None => file.unwrap_or(default),
        };
        if !range.contains(&value) {
            return Err(ConfigError::OutOfRange { key, value, bound });
        }
        Ok(value)
    }
}

fn parse_level(raw: &str) -> Result<Level, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" | "critical" => Ok(Level::ERROR),
        other => Err(ConfigError::Malformed(format!("unknown log level: {other}"))),
    }
}

/// Expand $(VAR) and ${VAR} placeholders.
/// "$$" is a literal "$"; any other "$" is kept as-is.
fn expand_env_placeholders<E>(input: &str, env: &E) -> Result<String, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let close = match tail.chars().next() {
            Some('$') => {
                out.push('$');
                rest = &tail[1..];
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                rest = tail;
                continue;
            }
        };
        let end = tail.find(close).ok_or_else(|| {
            ConfigError::Malformed(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let name = &tail[1..end];
        let value = env(name).ok_or_else(|| {
            ConfigError::Malformed(format!("missing environment variable: {name}"))
        })?;
        out.push_str(&value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
